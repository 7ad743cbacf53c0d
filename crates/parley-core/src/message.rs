//! Conversation messages.

use bytes::Bytes;
use parley_protocol::Receipt;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::conversation::ConversationId;

/// Message identity, assigned by the backend on acceptance.
pub type MessageId = Uuid;

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// A message in a conversation. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Backend-assigned identity.
    pub id: MessageId,
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// Username of the sender.
    pub sender: String,
    /// Message payload.
    pub payload: Bytes,
    /// Position in the conversation, as acknowledged by the backend.
    pub position: u64,
    /// Acceptance time (ms since the Unix epoch).
    pub timestamp: u64,
}

impl Message {
    /// Build the local copy of a message the backend acknowledged.
    #[must_use]
    pub fn acknowledged(
        conversation_id: ConversationId,
        sender: impl Into<String>,
        payload: impl Into<Bytes>,
        receipt: &Receipt,
    ) -> Self {
        Self {
            id: receipt.message_id,
            conversation_id,
            sender: sender.into(),
            payload: payload.into(),
            position: receipt.sequence,
            timestamp: receipt.timestamp,
        }
    }

    /// The payload as UTF-8 text, if it is valid UTF-8.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Get the payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acknowledged_message_takes_receipt_fields() {
        let conversation_id = ConversationId::generate();
        let receipt = Receipt {
            message_id: Uuid::new_v4(),
            sequence: 4,
            timestamp: 1_700_000_000_000,
        };
        let msg = Message::acknowledged(conversation_id, "alice", "hello", &receipt);

        assert_eq!(msg.id, receipt.message_id);
        assert_eq!(msg.position, 4);
        assert_eq!(msg.text(), Some("hello"));
        assert_eq!(msg.payload_size(), 5);
    }

    #[test]
    fn test_binary_payload_has_no_text() {
        let receipt = Receipt {
            message_id: Uuid::new_v4(),
            sequence: 1,
            timestamp: now_millis(),
        };
        let msg = Message::acknowledged(
            ConversationId::generate(),
            "bob",
            vec![0xff, 0xfe],
            &receipt,
        );
        assert!(msg.text().is_none());
    }
}
