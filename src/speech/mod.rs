//! Speech adapters
//!
//! - [`stt`]: windowed speech-to-text capture
//! - [`tts`]: queued text-to-speech playback
//! - [`console`]: terminal stand-ins for both devices

pub mod console;
pub mod stt;
pub mod tts;

pub use console::{ConsoleRecognizer, ConsoleSynthesizer};
pub use stt::{
    InputStatus, Recognizer, RecognizerSink, SpeechInput, TranscriptBuffer, TranscriptEvent,
    TranscriptUpdate,
};
pub use tts::{OutputEvent, Playback, SpeechOutput, Synthesizer};
