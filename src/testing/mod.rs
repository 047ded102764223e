//! Test doubles for the speech devices and the session API.
//!
//! These let the orchestrator run end to end without a microphone, a
//! speaker or a backend:
//!
//! ```rust,ignore
//! use brief::testing::{MockRecognizer, MockSessionApi, MockSynthesizer};
//!
//! let recognizer = Arc::new(MockRecognizer::new());
//! // ... once the conversation is listening:
//! recognizer.final_segment("read my mail");
//! ```

pub mod mocks;

pub use mocks::*;
