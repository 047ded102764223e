//! Terminal speech devices
//!
//! The synthesizer prints what would be spoken and takes time proportional
//! to its length; the recognizer treats typed lines as finalized speech.

use super::stt::{Recognizer, RecognizerSink};
use super::tts::Synthesizer;
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::io::Write;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Prints utterances to stdout
#[derive(Debug)]
pub struct ConsoleSynthesizer {
    word_delay: Duration,
    paused: watch::Sender<bool>,
}

impl ConsoleSynthesizer {
    pub fn new(word_delay: Duration) -> Self {
        let (paused, _) = watch::channel(false);
        Self { word_delay, paused }
    }
}

impl Default for ConsoleSynthesizer {
    fn default() -> Self {
        Self::new(Duration::from_millis(120))
    }
}

#[async_trait]
impl Synthesizer for ConsoleSynthesizer {
    async fn speak(&self, text: &str) -> Result<()> {
        let mut paused = self.paused.subscribe();
        let _ = paused.wait_for(|p| !*p).await;

        let mut stdout = std::io::stdout();
        write!(stdout, "{}", text)?;
        stdout.flush()?;

        for _ in text.split_whitespace() {
            tokio::time::sleep(self.word_delay).await;
            let _ = paused.wait_for(|p| !*p).await;
        }
        writeln!(stdout)?;
        Ok(())
    }

    fn cancel(&self) {
        println!(" [interrupted]");
    }

    fn pause(&self) {
        self.paused.send_replace(true);
    }

    fn resume(&self) {
        self.paused.send_replace(false);
    }
}

/// Feeds typed lines to the active listening window
#[derive(Debug, Default)]
pub struct ConsoleRecognizer {
    sink: Mutex<Option<RecognizerSink>>,
}

impl ConsoleRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a typed line as a finalized segment; false when not listening
    pub fn feed(&self, line: &str) -> bool {
        let sink = self.sink.lock().clone();
        match sink {
            Some(sink) => sink.final_segment(line),
            None => false,
        }
    }
}

impl Recognizer for ConsoleRecognizer {
    fn is_supported(&self) -> bool {
        true
    }

    fn start(&self, sink: RecognizerSink) -> Result<()> {
        debug!("Console recognizer listening (window {})", sink.window());
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    fn stop(&self) {
        self.sink.lock().take();
    }
}
