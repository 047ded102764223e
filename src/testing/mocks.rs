//! Mock devices and backends.

use crate::identity::UserProfile;
use crate::speech::{Recognizer, RecognizerSink, Synthesizer};
use crate::transport::{SessionApi, SessionInfo};
use crate::{BriefError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// A synthesizer that records what it was asked to say.
///
/// Speaking takes `word_delay` per word so tests on a paused clock can
/// observe playback in progress.
#[derive(Debug, Default)]
pub struct MockSynthesizer {
    word_delay: Duration,
    started: Mutex<Vec<String>>,
    spoken: Mutex<Vec<String>>,
    failures: Mutex<VecDeque<String>>,
    cancelled: AtomicUsize,
    pauses: AtomicUsize,
}

impl MockSynthesizer {
    /// Create a synthesizer that finishes instantly.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a synthesizer that takes `delay` per word.
    pub fn with_word_delay(delay: Duration) -> Self {
        Self {
            word_delay: delay,
            ..Default::default()
        }
    }

    /// Make the next utterance fail.
    pub fn fail_next(&self, message: &str) {
        self.failures.lock().push_back(message.to_string());
    }

    /// Utterances that played to completion, in order.
    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().clone()
    }

    /// Utterances that started playing, in order.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn pauses(&self) -> usize {
        self.pauses.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Synthesizer for MockSynthesizer {
    async fn speak(&self, text: &str) -> Result<()> {
        self.started.lock().push(text.to_string());

        if let Some(message) = self.failures.lock().pop_front() {
            return Err(BriefError::SynthesisError(message));
        }

        let words = text.split_whitespace().count().max(1) as u32;
        if !self.word_delay.is_zero() {
            tokio::time::sleep(self.word_delay * words).await;
        } else {
            tokio::task::yield_now().await;
        }

        self.spoken.lock().push(text.to_string());
        Ok(())
    }

    fn cancel(&self) {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
    }

    fn pause(&self) {
        self.pauses.fetch_add(1, Ordering::SeqCst);
    }

    fn resume(&self) {}
}

/// A recognizer driven by the test.
///
/// The test plays the part of the user by pushing segments into the most
/// recent sink handed over by the adapter.
#[derive(Debug)]
pub struct MockRecognizer {
    supported: bool,
    sink: Mutex<Option<RecognizerSink>>,
    start_failures: Mutex<VecDeque<BriefError>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl MockRecognizer {
    pub fn new() -> Self {
        Self {
            supported: true,
            sink: Mutex::new(None),
            start_failures: Mutex::new(VecDeque::new()),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }

    /// A device without speech recognition.
    pub fn unsupported() -> Self {
        Self {
            supported: false,
            ..Self::new()
        }
    }

    /// Make the next `start` fail.
    pub fn fail_next_start(&self, error: BriefError) {
        self.start_failures.lock().push_back(error);
    }

    /// Sink of the most recent window, if capture is active.
    pub fn sink(&self) -> Option<RecognizerSink> {
        self.sink.lock().clone()
    }

    /// Whether a window is open and accepting results.
    pub fn is_listening(&self) -> bool {
        self.sink().map(|sink| sink.is_current()).unwrap_or(false)
    }

    pub fn interim(&self, segment: &str) -> bool {
        self.sink().map(|sink| sink.interim(segment)).unwrap_or(false)
    }

    pub fn final_segment(&self, segment: &str) -> bool {
        self.sink()
            .map(|sink| sink.final_segment(segment))
            .unwrap_or(false)
    }

    pub fn fail(&self, error: BriefError) -> bool {
        self.sink().map(|sink| sink.fail(error)).unwrap_or(false)
    }

    pub fn end(&self) -> bool {
        self.sink().map(|sink| sink.ended()).unwrap_or(false)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl Default for MockRecognizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Recognizer for MockRecognizer {
    fn is_supported(&self) -> bool {
        self.supported
    }

    fn start(&self, sink: RecognizerSink) -> Result<()> {
        if let Some(error) = self.start_failures.lock().pop_front() {
            return Err(error);
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// A session API with a fixed answer.
#[derive(Debug)]
pub struct MockSessionApi {
    result: Result<SessionInfo>,
    delay: Duration,
    calls: AtomicUsize,
}

impl MockSessionApi {
    /// Create an API that hands out `session_id`.
    pub fn with_session(session_id: &str) -> Self {
        Self {
            result: Ok(SessionInfo {
                session_id: session_id.to_string(),
                agent_id: None,
            }),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Create an API that always fails with `error`.
    pub fn with_error(error: BriefError) -> Self {
        Self {
            result: Err(error),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Delay every response by `delay`.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of sessions requested so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionApi for MockSessionApi {
    async fn create_session(
        &self,
        _user: &UserProfile,
        _token: Option<&str>,
    ) -> Result<SessionInfo> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.result.clone()
    }
}
