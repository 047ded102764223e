//! Observable conversation state
//!
//! The orchestrator writes this state after every transition; the UI reads
//! it through [`SharedConversationState`] and reacts to
//! [`ConversationEvent`]s for things that happen once.

use crate::messages::{ConversationTurn, TurnLog};
use crate::BriefError;
use parking_lot::RwLock;
use std::sync::Arc;

/// Mode of the conversation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConversationState {
    /// No conversation running
    #[default]
    Idle,
    /// Creating the session and waiting for the first assistant content
    Connecting,
    /// Assistant speech is playing or still streaming in
    Speaking,
    /// Capturing the user's turn
    Listening,
    /// User turn sent, waiting for the reply
    Processing,
    /// Stopped after a failure; only start or end proceed
    Error,
}

impl ConversationState {
    pub fn is_idle(&self) -> bool {
        matches!(self, ConversationState::Idle)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ConversationState::Error)
    }

    /// Check if a conversation is in progress
    pub fn is_active(&self) -> bool {
        !matches!(self, ConversationState::Idle | ConversationState::Error)
    }

    /// Whether `start` is accepted in this state
    pub fn can_start(&self) -> bool {
        !self.is_active()
    }
}

impl std::fmt::Display for ConversationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConversationState::Idle => write!(f, "idle"),
            ConversationState::Connecting => write!(f, "connecting"),
            ConversationState::Speaking => write!(f, "speaking"),
            ConversationState::Listening => write!(f, "listening"),
            ConversationState::Processing => write!(f, "processing"),
            ConversationState::Error => write!(f, "error"),
        }
    }
}

/// Requests from the UI
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConversationCommand {
    Start,
    Pause,
    Resume,
    /// Pause when running, resume when paused
    PauseResume,
    End,
    /// Stop the orchestrator loop
    Shutdown,
}

/// Notifications for the UI
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConversationEvent {
    StateChanged {
        from: ConversationState,
        to: ConversationState,
    },
    PauseChanged(bool),
    SessionOpened {
        session_id: String,
    },
    /// A streamed piece of the assistant turn; `text` is everything so far
    AssistantChunk {
        chunk: String,
        text: String,
    },
    AssistantMessage(ConversationTurn),
    UserTurn(ConversationTurn),
    TranscriptUpdated(String),
    /// Something failed but the conversation goes on
    Warning(String),
    Error(BriefError),
    Ended,
    Shutdown,
}

/// Mutable state behind [`SharedConversationState`]
#[derive(Clone, Debug, Default)]
pub struct ConversationData {
    pub state: ConversationState,
    pub paused: bool,
    /// Speech output is playing or has queued utterances
    pub speaking: bool,
    /// Transcript of the current listening window for display
    pub transcript: String,
    pub session_id: Option<String>,
    pub last_error: Option<BriefError>,
    pub epoch: u64,
}

/// Immutable snapshot of the conversation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversationSnapshot {
    pub state: ConversationState,
    pub paused: bool,
    pub speaking: bool,
    pub transcript: String,
    pub turns: Vec<ConversationTurn>,
    pub session_id: Option<String>,
    pub last_error: Option<BriefError>,
    pub epoch: u64,
}

/// Thread-safe conversation state shared between orchestrator and UI
#[derive(Clone, Debug)]
pub struct SharedConversationState {
    inner: Arc<RwLock<ConversationData>>,
    turns: TurnLog,
}

impl Default for SharedConversationState {
    fn default() -> Self {
        Self::new(TurnLog::new())
    }
}

impl SharedConversationState {
    pub fn new(turns: TurnLog) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ConversationData::default())),
            turns,
        }
    }

    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, ConversationData> {
        self.inner.read()
    }

    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, ConversationData> {
        self.inner.write()
    }

    /// Get a snapshot of current state (no lock held after return)
    pub fn snapshot(&self) -> ConversationSnapshot {
        let data = self.inner.read().clone();
        ConversationSnapshot {
            state: data.state,
            paused: data.paused,
            speaking: data.speaking,
            transcript: data.transcript,
            turns: self.turns.get_all(),
            session_id: data.session_id,
            last_error: data.last_error,
            epoch: data.epoch,
        }
    }

    pub fn state(&self) -> ConversationState {
        self.inner.read().state
    }

    pub fn is_paused(&self) -> bool {
        self.inner.read().paused
    }

    pub fn is_speaking(&self) -> bool {
        self.inner.read().speaking
    }

    pub fn transcript(&self) -> String {
        self.inner.read().transcript.clone()
    }

    pub fn turns(&self) -> Vec<ConversationTurn> {
        self.turns.get_all()
    }

    pub fn last_error(&self) -> Option<BriefError> {
        self.inner.read().last_error.clone()
    }
}
