pub mod conversation;
pub mod identity;
pub mod integration;
pub mod messages;
pub mod speech;
pub mod testing;
pub mod transport;
pub mod utils;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BriefError {
    #[error("Authentication error: {0}")]
    AuthenticationError(String),

    #[error("Handshake error: {0}")]
    HandshakeError(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Connection closed unexpectedly (code: {code}): {reason}")]
    ConnectionError { code: u16, reason: String },

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Synthesis error: {0}")]
    SynthesisError(String),

    #[error("Recognition error: {0}")]
    RecognitionError(String),

    #[error("Speech recognition not supported: {0}")]
    UnsupportedError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for BriefError {
    fn from(e: std::io::Error) -> Self {
        BriefError::IOError(e.to_string())
    }
}

impl From<serde_json::Error> for BriefError {
    fn from(e: serde_json::Error) -> Self {
        BriefError::ProtocolError(e.to_string())
    }
}

impl From<toml::de::Error> for BriefError {
    fn from(e: toml::de::Error) -> Self {
        BriefError::ConfigError(e.to_string())
    }
}

impl BriefError {
    /// Whether an automatic retry may succeed.
    ///
    /// Authentication and validation failures never get better by trying again.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            BriefError::AuthenticationError(_) | BriefError::ValidationError(_)
        )
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Requires the user to sign in again
            BriefError::AuthenticationError(_) => false,
            // The user may retry the session manually
            BriefError::HandshakeError(_) => true,
            BriefError::ChannelError(_) => true,
            BriefError::ConnectionError { .. } => true,
            BriefError::TransportError(_) => true,
            BriefError::ServerError(_) => true,
            BriefError::ProtocolError(_) => true,
            // Local device failures
            BriefError::SynthesisError(_) => true,
            BriefError::RecognitionError(_) => true,
            BriefError::UnsupportedError(_) => false,
            BriefError::ValidationError(_) => false,
            BriefError::StorageError(_) => false,
            BriefError::ConfigError(_) => false,
            BriefError::IOError(_) => false,
        }
    }

    /// Get a user-friendly description
    pub fn user_message(&self) -> String {
        match self {
            BriefError::AuthenticationError(_) => {
                "You're signed out. Please sign in again.".to_string()
            }
            BriefError::HandshakeError(_) => {
                "Couldn't start your briefing. Please try again.".to_string()
            }
            BriefError::ChannelError(_) | BriefError::ConnectionError { .. } => {
                "Connection error. Please try again.".to_string()
            }
            BriefError::TransportError(_) => {
                "Your message couldn't be sent. Please say it again.".to_string()
            }
            BriefError::ServerError(_) => {
                "The briefing service ran into a problem. Please try again.".to_string()
            }
            BriefError::ProtocolError(_) => {
                "Received an unexpected response from the server.".to_string()
            }
            BriefError::SynthesisError(_) => {
                "Speech playback failed. Please try again.".to_string()
            }
            BriefError::RecognitionError(_) => {
                "Speech recognition failed. Please try again.".to_string()
            }
            BriefError::UnsupportedError(_) => {
                "Speech recognition is not available on this device.".to_string()
            }
            BriefError::ValidationError(_) => "Invalid request.".to_string(),
            BriefError::StorageError(_) => "Couldn't access saved sign-in data.".to_string(),
            BriefError::ConfigError(_) => {
                "Configuration error. Please check settings.".to_string()
            }
            BriefError::IOError(_) => "File system error occurred.".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BriefError>;
