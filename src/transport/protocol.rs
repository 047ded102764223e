//! Wire format of the real-time session channel
//!
//! Inbound frames are JSON objects `{ "type": ..., "content": ... }`.
//! Outbound frames are `{ "type": "message", "content": ... }` and
//! `{ "type": "close" }`.

use crate::{BriefError, Result};
use serde::{Deserialize, Serialize};

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;

/// Endpoint going away (page unload, server restart)
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Closed without a close frame
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Whether a close code represents an expected shutdown
pub fn is_normal_closure(code: u16) -> bool {
    matches!(code, CLOSE_NORMAL | CLOSE_GOING_AWAY)
}

/// Kind of a complete assistant message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Greeting,
    Summary,
    Response,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Greeting => write!(f, "greeting"),
            MessageKind::Summary => write!(f, "summary"),
            MessageKind::Response => write!(f, "response"),
        }
    }
}

/// A decoded inbound frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerMessage {
    /// A complete assistant message
    Message { kind: MessageKind, content: String },
    /// A partial piece of the assistant turn in progress
    Chunk(String),
    /// Server-side failure report
    Error(String),
    /// A frame with a `type` this client does not understand
    Unknown(String),
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: String,
}

impl ServerMessage {
    /// Decode one text frame
    pub fn parse(text: &str) -> Result<Self> {
        let wire: WireMessage = serde_json::from_str(text)
            .map_err(|e| BriefError::ProtocolError(format!("Failed to parse message: {}", e)))?;

        let message = match wire.kind.as_str() {
            "greeting" => ServerMessage::Message {
                kind: MessageKind::Greeting,
                content: wire.content,
            },
            "summary" => ServerMessage::Message {
                kind: MessageKind::Summary,
                content: wire.content,
            },
            "response" => ServerMessage::Message {
                kind: MessageKind::Response,
                content: wire.content,
            },
            "chunk" => ServerMessage::Chunk(wire.content),
            "error" => ServerMessage::Error(wire.content),
            _ => ServerMessage::Unknown(wire.kind),
        };

        Ok(message)
    }
}

/// Frames sent by the client
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// A user turn
    Message { content: String },
    /// Courtesy notice sent before the channel is closed
    Close,
}

impl ClientMessage {
    /// Encode as a JSON text frame
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Connection lifecycle and content events produced by the transport
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// The channel is open
    Opened,
    /// A complete assistant message
    Message { content: String, kind: MessageKind },
    /// A partial assistant message
    Chunk(String),
    /// The backend reported an error
    Error(String),
    /// The channel closed
    Closed { code: u16, reason: String },
}

impl TransportEvent {
    /// Map a decoded frame to an event; unknown frames yield nothing
    pub fn from_server(message: ServerMessage) -> Option<Self> {
        match message {
            ServerMessage::Message { kind, content } => {
                Some(TransportEvent::Message { content, kind })
            }
            ServerMessage::Chunk(content) => Some(TransportEvent::Chunk(content)),
            ServerMessage::Error(content) => Some(TransportEvent::Error(content)),
            ServerMessage::Unknown(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_message_kinds() {
        let greeting = ServerMessage::parse(r#"{"type":"greeting","content":"Hi"}"#).unwrap();
        assert_eq!(
            greeting,
            ServerMessage::Message {
                kind: MessageKind::Greeting,
                content: "Hi".into()
            }
        );

        let summary = ServerMessage::parse(r#"{"type":"summary","content":"3 new"}"#).unwrap();
        assert!(matches!(
            summary,
            ServerMessage::Message {
                kind: MessageKind::Summary,
                ..
            }
        ));

        let chunk = ServerMessage::parse(r#"{"type":"chunk","content":"Sure, "}"#).unwrap();
        assert_eq!(chunk, ServerMessage::Chunk("Sure, ".into()));

        let error = ServerMessage::parse(r#"{"type":"error","content":"boom"}"#).unwrap();
        assert_eq!(error, ServerMessage::Error("boom".into()));
    }

    #[test]
    fn test_parse_unknown_type() {
        let msg = ServerMessage::parse(r#"{"type":"typing"}"#).unwrap();
        assert_eq!(msg, ServerMessage::Unknown("typing".into()));
        assert_eq!(TransportEvent::from_server(msg), None);
    }

    #[test]
    fn test_parse_garbage_is_protocol_error() {
        let result = ServerMessage::parse("not json");
        assert!(matches!(result, Err(BriefError::ProtocolError(_))));
    }

    #[test]
    fn test_outbound_encoding() {
        let msg = ClientMessage::Message {
            content: "read my mail".into(),
        };
        let json: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["content"], "read my mail");

        assert_eq!(ClientMessage::Close.to_json().unwrap(), r#"{"type":"close"}"#);
    }

    #[test]
    fn test_close_code_policy() {
        assert!(is_normal_closure(1000));
        assert!(is_normal_closure(1001));
        assert!(!is_normal_closure(1006));
        assert!(!is_normal_closure(1011));
    }
}
