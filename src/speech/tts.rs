//! Speech output adapter
//!
//! Wraps a [`Synthesizer`] device with a FIFO utterance queue. A single
//! driver task plays queued utterances one at a time and reports progress
//! as [`OutputEvent`]s; `Drained` marks the point where the queue has
//! truly emptied.

use crate::{BriefError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Text-to-speech device
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Speak `text`, returning once playback has completed
    async fn speak(&self, text: &str) -> Result<()>;

    /// Abort the current utterance
    fn cancel(&self);

    fn pause(&self);

    fn resume(&self);
}

/// Playback progress reported by [`SpeechOutput`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputEvent {
    /// An utterance started playing
    Started { seq: u64, text: String },

    /// An utterance played to completion
    Finished { seq: u64 },

    /// The queue is empty; everything up to `through` has been played
    Drained { through: u64 },

    /// Playback failed; the rest of the queue was dropped
    Failed { seq: u64, error: BriefError },
}

/// Handle to an utterance queued by [`SpeechOutput::speak_now`]
#[derive(Debug)]
pub struct Playback {
    pub seq: u64,
    done: oneshot::Receiver<Result<()>>,
}

impl Playback {
    /// Wait until the utterance has played, failed, or been cancelled
    pub async fn wait(self) -> Result<()> {
        self.done
            .await
            .unwrap_or_else(|_| Err(BriefError::SynthesisError("Playback interrupted".into())))
    }
}

struct Utterance {
    seq: u64,
    text: String,
    done: Option<oneshot::Sender<Result<()>>>,
}

struct OutputState {
    queue: VecDeque<Utterance>,
    driver: Option<JoinHandle<()>>,
    generation: u64,
    next_seq: u64,
    last_played: u64,
}

struct OutputInner {
    synth: Arc<dyn Synthesizer>,
    state: Mutex<OutputState>,
    paused: watch::Sender<bool>,
    events: mpsc::UnboundedSender<OutputEvent>,
}

/// Queued speech playback over a [`Synthesizer`]
#[derive(Clone)]
pub struct SpeechOutput {
    inner: Arc<OutputInner>,
}

impl SpeechOutput {
    /// Create the adapter and the receiver its events are delivered on
    pub fn new(synth: Arc<dyn Synthesizer>) -> (Self, mpsc::UnboundedReceiver<OutputEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (paused, _) = watch::channel(false);

        let inner = OutputInner {
            synth,
            state: Mutex::new(OutputState {
                queue: VecDeque::new(),
                driver: None,
                generation: 0,
                next_seq: 0,
                last_played: 0,
            }),
            paused,
            events,
        };

        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    /// Cancel everything and start playing `text`
    ///
    /// Returns `None` for blank text, which is not spoken.
    pub fn speak_now(&self, text: &str) -> Option<Playback> {
        if text.trim().is_empty() {
            return None;
        }
        self.stop();

        let (tx, rx) = oneshot::channel();
        let seq = self.enqueue(text, Some(tx));
        Some(Playback { seq, done: rx })
    }

    /// Cancel everything, play `text` and wait for it to finish
    pub async fn speak(&self, text: &str) -> Result<()> {
        match self.speak_now(text) {
            Some(playback) => playback.wait().await,
            None => Ok(()),
        }
    }

    /// Append a streamed chunk to the queue
    ///
    /// Returns the sequence number of the queued utterance, or `None` when
    /// the chunk is blank.
    pub fn speak_chunk(&self, text: &str) -> Option<u64> {
        if text.trim().is_empty() {
            debug!("Skipping blank chunk");
            return None;
        }
        Some(self.enqueue(text, None))
    }

    fn enqueue(&self, text: &str, done: Option<oneshot::Sender<Result<()>>>) -> u64 {
        let mut state = self.inner.state.lock();
        state.next_seq += 1;
        let seq = state.next_seq;
        state.queue.push_back(Utterance {
            seq,
            text: text.to_string(),
            done,
        });

        if state.driver.is_none() {
            let generation = state.generation;
            state.driver = Some(tokio::spawn(drive(self.inner.clone(), generation)));
        }
        seq
    }

    /// Pause playback; returns false when nothing is playing
    pub fn pause(&self) -> bool {
        if !self.is_speaking() || *self.inner.paused.borrow() {
            return false;
        }
        self.inner.paused.send_replace(true);
        self.inner.synth.pause();
        info!("Playback paused");
        true
    }

    /// Resume paused playback; returns false when not paused
    pub fn resume(&self) -> bool {
        if !*self.inner.paused.borrow() {
            return false;
        }
        self.inner.paused.send_replace(false);
        self.inner.synth.resume();
        info!("Playback resumed");
        true
    }

    /// Cancel current playback and clear the queue
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        state.generation += 1;
        let dropped = state.queue.len();
        state.queue.clear();
        let was_playing = match state.driver.take() {
            Some(driver) => {
                driver.abort();
                true
            }
            None => false,
        };
        drop(state);

        self.inner.paused.send_replace(false);
        if was_playing {
            self.inner.synth.cancel();
            debug!("Playback stopped, {} queued utterances dropped", dropped);
        }
    }

    /// True from the start of the first queued utterance until the queue
    /// has drained
    pub fn is_speaking(&self) -> bool {
        self.inner.state.lock().driver.is_some()
    }

    pub fn is_paused(&self) -> bool {
        *self.inner.paused.borrow()
    }

    /// Number of utterances waiting behind the current one
    pub fn queued(&self) -> usize {
        self.inner.state.lock().queue.len()
    }
}

impl std::fmt::Debug for SpeechOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechOutput")
            .field("speaking", &self.is_speaking())
            .field("paused", &self.is_paused())
            .finish()
    }
}

/// Play queued utterances until the queue is empty or `generation` is stale
async fn drive(inner: Arc<OutputInner>, generation: u64) {
    let mut paused = inner.paused.subscribe();

    loop {
        let _ = paused.wait_for(|p| !*p).await;

        let utterance = {
            let mut state = inner.state.lock();
            if state.generation != generation {
                return;
            }
            match state.queue.pop_front() {
                Some(utterance) => utterance,
                None => {
                    state.driver = None;
                    let _ = inner.events.send(OutputEvent::Drained {
                        through: state.last_played,
                    });
                    return;
                }
            }
        };

        let _ = inner.events.send(OutputEvent::Started {
            seq: utterance.seq,
            text: utterance.text.clone(),
        });

        let result = inner.synth.speak(&utterance.text).await;

        let mut state = inner.state.lock();
        if state.generation != generation {
            return;
        }

        match result {
            Ok(()) => {
                state.last_played = utterance.seq;
                let _ = inner.events.send(OutputEvent::Finished { seq: utterance.seq });
                if let Some(done) = utterance.done {
                    let _ = done.send(Ok(()));
                }
            }
            Err(e) => {
                warn!("Playback failed for utterance {}: {}", utterance.seq, e);
                for pending in state.queue.drain(..) {
                    if let Some(done) = pending.done {
                        let _ = done.send(Err(e.clone()));
                    }
                }
                state.driver = None;
                let _ = inner.events.send(OutputEvent::Failed {
                    seq: utterance.seq,
                    error: e.clone(),
                });
                if let Some(done) = utterance.done {
                    let _ = done.send(Err(e));
                }
                return;
            }
        }
    }
}
