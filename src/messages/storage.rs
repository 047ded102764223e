use super::types::{ConversationTurn, Role};
use crate::transport::MessageKind;
use std::sync::Arc;
use parking_lot::RwLock;

/// Ordered turns of the current conversation
#[derive(Debug, Clone)]
pub struct TurnLog {
    turns: Arc<RwLock<Vec<ConversationTurn>>>,
}

impl TurnLog {
    pub fn new() -> Self {
        Self {
            turns: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn add(&self, turn: ConversationTurn) {
        self.turns.write().push(turn);
    }

    /// Append a chunk to the streaming assistant turn, opening one if needed.
    /// Returns the accumulated text.
    pub fn append_chunk(&self, chunk: &str) -> String {
        let mut turns = self.turns.write();
        match turns.last_mut() {
            Some(turn) if turn.role == Role::Assistant && turn.is_partial => {
                turn.content.push_str(chunk);
                turn.content.clone()
            }
            _ => {
                turns.push(ConversationTurn::partial(chunk));
                chunk.to_string()
            }
        }
    }

    /// Finalize the streaming assistant turn, or add a new assistant turn
    /// when nothing is streaming
    ///
    /// A streamed turn keeps the text of its chunks. The closing `content`
    /// only replaces it when it repeats the streamed text and extends it.
    pub fn complete_assistant(&self, content: &str, kind: MessageKind) -> ConversationTurn {
        let mut turns = self.turns.write();
        match turns.last_mut() {
            Some(turn) if turn.role == Role::Assistant && turn.is_partial => {
                if content.starts_with(turn.content.as_str()) {
                    turn.content = content.to_string();
                }
                turn.is_partial = false;
                turn.kind = Some(kind);
                turn.clone()
            }
            _ => {
                let turn = ConversationTurn::assistant(content, kind);
                turns.push(turn.clone());
                turn
            }
        }
    }

    /// Text of the streaming assistant turn, if one is open
    pub fn partial_text(&self) -> Option<String> {
        self.turns
            .read()
            .last()
            .filter(|turn| turn.role == Role::Assistant && turn.is_partial)
            .map(|turn| turn.content.clone())
    }

    /// Mark a streaming turn as final as-is
    pub fn seal_partial(&self) {
        if let Some(turn) = self.turns.write().last_mut() {
            turn.is_partial = false;
        }
    }

    pub fn get_all(&self) -> Vec<ConversationTurn> {
        self.turns.read().clone()
    }

    pub fn last(&self) -> Option<ConversationTurn> {
        self.turns.read().last().cloned()
    }

    pub fn clear(&self) {
        self.turns.write().clear();
    }

    pub fn len(&self) -> usize {
        self.turns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.read().is_empty()
    }
}

impl Default for TurnLog {
    fn default() -> Self {
        Self::new()
    }
}
