//! Speech input adapter
//!
//! Wraps a continuous [`Recognizer`] device. Each `start_listening()` opens
//! a new listening window; the device pushes results through a
//! [`RecognizerSink`] bound to that window, so results from a stopped
//! window never reach the transcript.

use crate::{BriefError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Continuous speech-to-text device
pub trait Recognizer: Send + Sync {
    /// Whether the device can recognize speech at all
    fn is_supported(&self) -> bool;

    /// Begin capture, pushing results into `sink`
    fn start(&self, sink: RecognizerSink) -> Result<()>;

    /// Stop capture
    fn stop(&self);
}

/// Accumulated result for the current listening window
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TranscriptBuffer {
    pub interim_text: String,
    pub final_text: String,
}

impl TranscriptBuffer {
    /// Append a finalized segment, normalizing whitespace
    pub fn push_final(&mut self, segment: &str) {
        let joined = format!("{} {}", self.final_text, segment);
        self.final_text = joined.split_whitespace().collect::<Vec<_>>().join(" ");
        self.interim_text.clear();
    }

    pub fn set_interim(&mut self, segment: &str) {
        self.interim_text = segment.trim().to_string();
    }

    /// Final text followed by the in-progress segment
    pub fn display_text(&self) -> String {
        match (self.final_text.is_empty(), self.interim_text.is_empty()) {
            (_, true) => self.final_text.clone(),
            (true, false) => self.interim_text.clone(),
            (false, false) => format!("{} {}", self.final_text, self.interim_text),
        }
    }

    pub fn clear(&mut self) {
        self.interim_text.clear();
        self.final_text.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.interim_text.is_empty() && self.final_text.is_empty()
    }
}

/// Transcript change reported by [`SpeechInput`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TranscriptEvent {
    /// In-progress text; carries final text plus the interim segment
    Interim { text: String },

    /// A segment was finalized; carries all final text of the window
    Final { text: String },

    /// The device reported a runtime failure
    Failed(BriefError),

    /// The device stopped capturing on its own
    Ended,
}

/// Transcript event tagged with its listening window
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TranscriptUpdate {
    pub window: u64,
    pub event: TranscriptEvent,
}

/// Capture status of the adapter
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputStatus {
    Idle,
    Listening,
    /// The device cannot recognize speech; permanent
    Unsupported,
}

struct InputState {
    status: InputStatus,
    window: u64,
    buffer: TranscriptBuffer,
}

struct InputInner {
    recognizer: Arc<dyn Recognizer>,
    state: Mutex<InputState>,
    events: mpsc::UnboundedSender<TranscriptUpdate>,
}

/// Where a [`Recognizer`] delivers results for one listening window
#[derive(Clone)]
pub struct RecognizerSink {
    window: u64,
    inner: Arc<InputInner>,
}

impl RecognizerSink {
    pub fn window(&self) -> u64 {
        self.window
    }

    /// Whether results pushed here still reach the transcript
    pub fn is_current(&self) -> bool {
        let state = self.inner.state.lock();
        state.window == self.window && state.status == InputStatus::Listening
    }

    /// Report an in-progress segment
    pub fn interim(&self, segment: &str) -> bool {
        self.update(|buffer| {
            buffer.set_interim(segment);
            TranscriptEvent::Interim {
                text: buffer.display_text(),
            }
        })
    }

    /// Report a finalized segment
    pub fn final_segment(&self, segment: &str) -> bool {
        self.update(|buffer| {
            buffer.push_final(segment);
            TranscriptEvent::Final {
                text: buffer.final_text.clone(),
            }
        })
    }

    /// Report a runtime failure; the window ends
    pub fn fail(&self, error: BriefError) -> bool {
        self.finish(TranscriptEvent::Failed(error))
    }

    /// Report that capture ended without being stopped
    pub fn ended(&self) -> bool {
        self.finish(TranscriptEvent::Ended)
    }

    fn update(&self, apply: impl FnOnce(&mut TranscriptBuffer) -> TranscriptEvent) -> bool {
        let mut state = self.inner.state.lock();
        if state.window != self.window || state.status != InputStatus::Listening {
            return false;
        }
        let event = apply(&mut state.buffer);
        let _ = self.inner.events.send(TranscriptUpdate {
            window: self.window,
            event,
        });
        true
    }

    fn finish(&self, event: TranscriptEvent) -> bool {
        let mut state = self.inner.state.lock();
        if state.window != self.window || state.status != InputStatus::Listening {
            return false;
        }
        state.status = InputStatus::Idle;
        let _ = self.inner.events.send(TranscriptUpdate {
            window: self.window,
            event,
        });
        true
    }
}

impl std::fmt::Debug for RecognizerSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecognizerSink")
            .field("window", &self.window)
            .finish()
    }
}

/// Windowed transcript capture over a [`Recognizer`]
#[derive(Clone)]
pub struct SpeechInput {
    inner: Arc<InputInner>,
}

impl SpeechInput {
    /// Create the adapter and the receiver its events are delivered on
    pub fn new(
        recognizer: Arc<dyn Recognizer>,
    ) -> (Self, mpsc::UnboundedReceiver<TranscriptUpdate>) {
        let (events, rx) = mpsc::unbounded_channel();
        let status = if recognizer.is_supported() {
            InputStatus::Idle
        } else {
            warn!("Speech recognition is not supported on this device");
            InputStatus::Unsupported
        };

        let inner = InputInner {
            recognizer,
            state: Mutex::new(InputState {
                status,
                window: 0,
                buffer: TranscriptBuffer::default(),
            }),
            events,
        };

        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    /// Open a new listening window and return its id
    ///
    /// Already listening is not an error; the current window id is returned.
    pub fn start_listening(&self) -> Result<u64> {
        let sink = {
            let mut state = self.inner.state.lock();
            match state.status {
                InputStatus::Unsupported => {
                    return Err(BriefError::UnsupportedError(
                        "no recognizer available on this device".into(),
                    ))
                }
                InputStatus::Listening => return Ok(state.window),
                InputStatus::Idle => {}
            }
            state.window += 1;
            state.buffer.clear();
            state.status = InputStatus::Listening;
            RecognizerSink {
                window: state.window,
                inner: self.inner.clone(),
            }
        };

        let window = sink.window;
        if let Err(e) = self.inner.recognizer.start(sink) {
            let mut state = self.inner.state.lock();
            if state.window == window {
                state.status = InputStatus::Idle;
            }
            warn!("Failed to start recognition: {}", e);
            return Err(e);
        }

        info!("Listening (window {})", window);
        Ok(window)
    }

    /// Stop capture; results of the stopped window are discarded
    pub fn stop_listening(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.status != InputStatus::Listening {
                return;
            }
            state.status = InputStatus::Idle;
            state.window += 1;
        }
        self.inner.recognizer.stop();
        debug!("Stopped listening");
    }

    /// Clear the transcript without stopping capture
    pub fn reset_transcript(&self) {
        self.inner.state.lock().buffer.clear();
    }

    pub fn transcript(&self) -> TranscriptBuffer {
        self.inner.state.lock().buffer.clone()
    }

    pub fn status(&self) -> InputStatus {
        self.inner.state.lock().status
    }

    pub fn is_listening(&self) -> bool {
        self.status() == InputStatus::Listening
    }

    pub fn is_supported(&self) -> bool {
        self.status() != InputStatus::Unsupported
    }

    /// Id of the most recent window
    pub fn window(&self) -> u64 {
        self.inner.state.lock().window
    }
}

impl std::fmt::Debug for SpeechInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechInput")
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockRecognizer;

    #[test]
    fn test_buffer_concatenates_finals() {
        let mut buffer = TranscriptBuffer::default();
        buffer.set_interim("read");
        assert_eq!(buffer.display_text(), "read");

        buffer.push_final("  read my ");
        buffer.set_interim("ma");
        assert_eq!(buffer.display_text(), "read my ma");

        buffer.push_final("mail\n");
        assert_eq!(buffer.final_text, "read my mail");
        assert!(buffer.interim_text.is_empty());
    }

    #[test]
    fn test_window_results() {
        let recognizer = Arc::new(MockRecognizer::new());
        let (input, mut events) = SpeechInput::new(recognizer.clone());

        let window = input.start_listening().unwrap();
        assert_eq!(input.start_listening().unwrap(), window);
        assert_eq!(recognizer.starts(), 1);

        assert!(recognizer.interim("read"));
        assert!(recognizer.final_segment("read my"));
        assert!(recognizer.final_segment("mail"));

        assert_eq!(
            events.try_recv().unwrap(),
            TranscriptUpdate {
                window,
                event: TranscriptEvent::Interim {
                    text: "read".into()
                }
            }
        );
        events.try_recv().unwrap();
        assert_eq!(
            events.try_recv().unwrap().event,
            TranscriptEvent::Final {
                text: "read my mail".into()
            }
        );
        assert_eq!(input.transcript().final_text, "read my mail");
    }

    #[test]
    fn test_stopped_window_is_silent() {
        let recognizer = Arc::new(MockRecognizer::new());
        let (input, mut events) = SpeechInput::new(recognizer.clone());

        input.start_listening().unwrap();
        let stale = recognizer.sink().unwrap();
        input.stop_listening();

        assert!(!stale.final_segment("late result"));
        assert!(events.try_recv().is_err());

        let window = input.start_listening().unwrap();
        assert!(!stale.is_current());
        assert_eq!(input.transcript(), TranscriptBuffer::default());
        assert_eq!(window, stale.window() + 2);
    }

    #[test]
    fn test_unsupported_never_listens() {
        let recognizer = Arc::new(MockRecognizer::unsupported());
        let (input, _events) = SpeechInput::new(recognizer.clone());

        assert!(matches!(
            input.start_listening(),
            Err(BriefError::UnsupportedError(_))
        ));
        assert!(!input.is_listening());
        assert!(!input.is_supported());
        assert_eq!(recognizer.starts(), 0);
    }

    #[test]
    fn test_start_failure_returns_to_idle() {
        let recognizer = Arc::new(MockRecognizer::new());
        recognizer.fail_next_start(BriefError::RecognitionError("mic busy".into()));
        let (input, _events) = SpeechInput::new(recognizer.clone());

        assert!(input.start_listening().is_err());
        assert_eq!(input.status(), InputStatus::Idle);
        assert!(input.start_listening().is_ok());
    }

    #[test]
    fn test_device_end_closes_window() {
        let recognizer = Arc::new(MockRecognizer::new());
        let (input, mut events) = SpeechInput::new(recognizer.clone());

        input.start_listening().unwrap();
        assert!(recognizer.end());
        assert_eq!(events.try_recv().unwrap().event, TranscriptEvent::Ended);
        assert!(!input.is_listening());
        assert!(!recognizer.final_segment("after end"));

        input.start_listening().unwrap();
        input.reset_transcript();
        assert!(recognizer.final_segment("again"));
        input.reset_transcript();
        assert!(input.transcript().is_empty());
    }
}
