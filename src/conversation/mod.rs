//! Conversation orchestration
//!
//! [`machine`] holds the pure transition logic; [`state`] is what the UI
//! observes. The async runtime driving both lives in
//! [`crate::integration::orchestrator`].

pub mod machine;
pub mod state;

pub use machine::{ConversationMachine, Effect, Input, DEFAULT_TURN_DEBOUNCE};
pub use state::{
    ConversationCommand, ConversationEvent, ConversationSnapshot, ConversationState,
    SharedConversationState,
};
