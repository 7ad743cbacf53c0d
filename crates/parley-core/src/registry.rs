//! Conversation registry.
//!
//! The registry owns every conversation this client knows about, in the
//! order they became known, and is the only place history and membership
//! are mutated.

use std::collections::HashMap;
use tracing::{debug, warn};

use crate::conversation::{Conversation, ConversationId, ConversationSummary, InsertOutcome};
use crate::error::{CoreError, Result};
use crate::message::Message;

/// Known conversations in insertion order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConversationRegistry {
    /// Conversations in insertion order.
    conversations: Vec<Conversation>,
    /// Conversation id -> index into `conversations`.
    index: HashMap<ConversationId, usize>,
}

impl ConversationRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a registry from conversations in their original order.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Corrupted` if an id appears twice.
    pub fn from_conversations(conversations: Vec<Conversation>) -> Result<Self> {
        let mut registry = Self::new();
        for conversation in conversations {
            let id = conversation.id();
            if !registry.insert(conversation) {
                return Err(CoreError::Corrupted(format!(
                    "conversation {id} stored twice"
                )));
            }
        }
        Ok(registry)
    }

    /// Register a conversation.
    ///
    /// Returns `false` (and leaves the registry untouched) if the id is
    /// already known.
    pub fn insert(&mut self, conversation: Conversation) -> bool {
        let id = conversation.id();
        if self.index.contains_key(&id) {
            return false;
        }
        debug!(conversation = %id, name = %conversation.name(), "Conversation registered");
        self.index.insert(id, self.conversations.len());
        self.conversations.push(conversation);
        true
    }

    /// Check if a conversation is known.
    #[must_use]
    pub fn contains(&self, id: &ConversationId) -> bool {
        self.index.contains_key(id)
    }

    /// Look up a conversation.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` for unknown ids.
    pub fn get(&self, id: &ConversationId) -> Result<&Conversation> {
        self.index
            .get(id)
            .map(|&i| &self.conversations[i])
            .ok_or_else(|| CoreError::NotFound(id.to_string()))
    }

    fn get_mut(&mut self, id: &ConversationId) -> Result<&mut Conversation> {
        match self.index.get(id) {
            Some(&i) => Ok(&mut self.conversations[i]),
            None => Err(CoreError::NotFound(id.to_string())),
        }
    }

    /// Add a member to a known conversation.
    ///
    /// Returns `true` if membership changed.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` for unknown ids.
    pub fn add_member(&mut self, id: &ConversationId, username: &str) -> Result<bool> {
        Ok(self.get_mut(id)?.add_member(username))
    }

    /// Remove a member from a known conversation.
    ///
    /// Returns `true` if membership changed.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` for unknown ids.
    pub fn remove_member(&mut self, id: &ConversationId, username: &str) -> Result<bool> {
        Ok(self.get_mut(id)?.remove_member(username))
    }

    /// Move a conversation's read marker forward.
    ///
    /// Returns `true` if the marker moved.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` for unknown ids.
    pub fn mark_read(&mut self, id: &ConversationId, position: u64) -> Result<bool> {
        Ok(self.get_mut(id)?.mark_read(position))
    }

    /// Append a message to its conversation's history.
    ///
    /// Returns `true` if the message was new.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the conversation is unknown.
    pub fn append(&mut self, message: Message) -> Result<bool> {
        let conversation = self.get_mut(&message.conversation_id)?;
        let id = message.id;
        let position = message.position;
        match conversation.insert_message(message) {
            InsertOutcome::Inserted => Ok(true),
            InsertOutcome::Duplicate => Ok(false),
            InsertOutcome::Conflict => {
                warn!(
                    conversation = %conversation.id(),
                    message = %id,
                    position,
                    "Backend reused a message position, keeping the first message"
                );
                Ok(false)
            }
        }
    }

    /// Summaries of every conversation, in insertion order. Messages sent
    /// by `own` never count as unread.
    #[must_use]
    pub fn summaries(&self, own: Option<&str>) -> Vec<ConversationSummary> {
        self.conversations.iter().map(|c| c.summary(own)).collect()
    }

    /// The `last_n` most recent messages of a conversation, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` for unknown ids.
    pub fn messages(&self, id: &ConversationId, last_n: usize) -> Result<Vec<Message>> {
        Ok(self.get(id)?.last_messages(last_n))
    }

    /// All conversation ids, in insertion order.
    #[must_use]
    pub fn ids(&self) -> Vec<ConversationId> {
        self.conversations.iter().map(Conversation::id).collect()
    }

    /// Conversations in insertion order.
    #[must_use]
    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    /// Get the number of conversations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    /// Check if the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// Forget every conversation.
    pub fn clear(&mut self) {
        self.conversations.clear();
        self.index.clear();
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            conversation_count: self.conversations.len(),
            member_count: self.conversations.iter().map(|c| c.members().len()).sum(),
            message_count: self.conversations.iter().map(Conversation::message_count).sum(),
        }
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of known conversations.
    pub conversation_count: usize,
    /// Sum of member counts over all conversations.
    pub member_count: usize,
    /// Total number of stored messages.
    pub message_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use uuid::Uuid;

    fn message(conversation: ConversationId, position: u64) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id: conversation,
            sender: "alice".into(),
            payload: Bytes::from_static(b"hi"),
            position,
            timestamp: 0,
        }
    }

    #[test]
    fn test_registry_keeps_insertion_order() {
        let mut registry = ConversationRegistry::new();
        let ids: Vec<ConversationId> = (0..3).map(|_| ConversationId::generate()).collect();
        for (i, id) in ids.iter().enumerate() {
            assert!(registry.insert(Conversation::new(*id, format!("c{i}"), "alice")));
        }

        assert_eq!(registry.ids(), ids);
        let names: Vec<String> = registry
            .summaries(None)
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["c0", "c1", "c2"]);
    }

    #[test]
    fn test_registry_rejects_duplicate_ids() {
        let mut registry = ConversationRegistry::new();
        let id = ConversationId::generate();
        assert!(registry.insert(Conversation::new(id, "first", "alice")));
        assert!(!registry.insert(Conversation::new(id, "second", "bob")));
        assert_eq!(registry.get(&id).unwrap().name(), "first");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_unknown_conversation() {
        let mut registry = ConversationRegistry::new();
        let id = ConversationId::generate();

        assert!(matches!(registry.get(&id), Err(CoreError::NotFound(_))));
        assert!(matches!(registry.messages(&id, 5), Err(CoreError::NotFound(_))));
        assert!(matches!(registry.add_member(&id, "bob"), Err(CoreError::NotFound(_))));
        assert!(matches!(registry.remove_member(&id, "bob"), Err(CoreError::NotFound(_))));
        assert!(matches!(registry.mark_read(&id, 1), Err(CoreError::NotFound(_))));
        assert!(matches!(registry.append(message(id, 1)), Err(CoreError::NotFound(_))));
    }

    #[test]
    fn test_registry_append_and_messages() {
        let mut registry = ConversationRegistry::new();
        let id = ConversationId::generate();
        registry.insert(Conversation::new(id, "team", "alice"));

        let first = message(id, 1);
        assert!(registry.append(first.clone()).unwrap());
        assert!(!registry.append(first).unwrap());
        assert!(registry.append(message(id, 2)).unwrap());
        assert!(!registry.append(message(id, 2)).unwrap());

        assert_eq!(registry.messages(&id, 5).unwrap().len(), 2);
        assert_eq!(registry.messages(&id, 1).unwrap()[0].position, 2);
    }

    #[test]
    fn test_registry_stats() {
        let mut registry = ConversationRegistry::new();
        let a = ConversationId::generate();
        let b = ConversationId::generate();
        registry.insert(Conversation::new(a, "a", "alice"));
        registry.insert(Conversation::new(b, "b", "alice"));
        registry.add_member(&a, "bob").unwrap();
        registry.append(message(b, 1)).unwrap();

        let stats = registry.stats();
        assert_eq!(stats.conversation_count, 2);
        assert_eq!(stats.member_count, 3);
        assert_eq!(stats.message_count, 1);
    }

    #[test]
    fn test_from_conversations_detects_duplicates() {
        let id = ConversationId::generate();
        let conversations = vec![
            Conversation::new(id, "a", "alice"),
            Conversation::new(id, "b", "alice"),
        ];
        assert!(matches!(
            ConversationRegistry::from_conversations(conversations),
            Err(CoreError::Corrupted(_))
        ));
    }
}
