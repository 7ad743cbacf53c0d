//! Conversations: named multi-party threads with ordered members and history.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::CoreError;
use crate::message::{Message, MessageId};

/// Maximum conversation name length.
pub const MAX_CONVERSATION_NAME_LENGTH: usize = 256;

/// A conversation identifier (128-bit UUID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(Uuid);

impl ConversationId {
    /// Allocate a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Decode an id from its 16 raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Decode` if `bytes` is not exactly 16 bytes long.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        Uuid::from_slice(bytes).map(Self).map_err(|_| {
            CoreError::Decode(format!(
                "conversation id must be 16 bytes, got {}",
                bytes.len()
            ))
        })
    }

    /// The 16 raw bytes of this id.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 16] {
        *self.0.as_bytes()
    }

    /// The underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for ConversationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validate a conversation name.
///
/// # Errors
///
/// Returns an error message if the name is invalid.
pub fn validate_conversation_name(name: &str) -> Result<(), &'static str> {
    if name.trim().is_empty() {
        return Err("Conversation name cannot be empty");
    }
    if name.len() > MAX_CONVERSATION_NAME_LENGTH {
        return Err("Conversation name too long");
    }
    if name.chars().any(char::is_control) {
        return Err("Conversation name contains control characters");
    }
    Ok(())
}

/// Result of offering a message to a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// New message, now part of the history.
    Inserted,
    /// Same message id already present.
    Duplicate,
    /// A different message already occupies this position.
    Conflict,
}

/// Owned, read-only view of a conversation handed to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub name: String,
    pub members: Vec<String>,
    pub message_count: usize,
    /// Position of the newest message, if any.
    pub last_position: Option<u64>,
    /// Messages from other users past the read marker.
    pub unread_messages: usize,
}

/// A conversation with its members and message history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StoredConversation")]
pub struct Conversation {
    id: ConversationId,
    name: String,
    /// Members in join order; the creator first.
    members: Vec<String>,
    /// History keyed by position.
    messages: BTreeMap<u64, Message>,
    /// Every message up to this position has been read.
    read_position: u64,
    #[serde(skip)]
    seen: HashSet<MessageId>,
}

impl Conversation {
    /// Create a conversation whose only member is its creator.
    #[must_use]
    pub fn new(id: ConversationId, name: impl Into<String>, creator: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            members: vec![creator.into()],
            messages: BTreeMap::new(),
            read_position: 0,
            seen: HashSet::new(),
        }
    }

    /// Create a conversation learned from the backend with an existing
    /// member list.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Decode` if `members` is empty.
    pub fn with_members(
        id: ConversationId,
        name: impl Into<String>,
        members: Vec<String>,
    ) -> Result<Self, CoreError> {
        if members.is_empty() {
            return Err(CoreError::Decode(format!(
                "backend announced conversation {id} without members"
            )));
        }
        let mut conversation = Self {
            id,
            name: name.into(),
            members: Vec::with_capacity(members.len()),
            messages: BTreeMap::new(),
            read_position: 0,
            seen: HashSet::new(),
        };
        for member in members {
            conversation.add_member(member);
        }
        Ok(conversation)
    }

    /// Get the conversation id.
    #[must_use]
    pub fn id(&self) -> ConversationId {
        self.id
    }

    /// Get the display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Members in join order.
    #[must_use]
    pub fn members(&self) -> &[String] {
        &self.members
    }

    /// Check if a user is a member.
    #[must_use]
    pub fn is_member(&self, username: &str) -> bool {
        self.members.iter().any(|m| m == username)
    }

    /// Add a member.
    ///
    /// Returns `true` if the user was not yet a member.
    pub fn add_member(&mut self, username: impl Into<String>) -> bool {
        let username = username.into();
        if self.is_member(&username) {
            return false;
        }
        debug!(conversation = %self.id, user = %username, "Member added");
        self.members.push(username);
        true
    }

    /// Remove a member.
    ///
    /// Returns `true` if the user was a member.
    pub fn remove_member(&mut self, username: &str) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m != username);
        let removed = self.members.len() != before;
        if removed {
            debug!(conversation = %self.id, user = %username, "Member removed");
        }
        removed
    }

    /// Offer a message to the history, deduplicating by message id.
    pub fn insert_message(&mut self, message: Message) -> InsertOutcome {
        if self.seen.contains(&message.id) {
            trace!(conversation = %self.id, message = %message.id, "Duplicate message ignored");
            return InsertOutcome::Duplicate;
        }
        if self.messages.contains_key(&message.position) {
            return InsertOutcome::Conflict;
        }
        self.seen.insert(message.id);
        self.messages.insert(message.position, message);
        InsertOutcome::Inserted
    }

    /// Check if a message is already in the history.
    #[must_use]
    pub fn contains_message(&self, id: &MessageId) -> bool {
        self.seen.contains(id)
    }

    /// The `n` most recent messages, oldest first.
    #[must_use]
    pub fn last_messages(&self, n: usize) -> Vec<Message> {
        let mut recent: Vec<Message> = self.messages.values().rev().take(n).cloned().collect();
        recent.reverse();
        recent
    }

    /// Get the number of messages.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Position of the newest message.
    #[must_use]
    pub fn last_position(&self) -> Option<u64> {
        self.messages.keys().next_back().copied()
    }

    /// Position up to which the history has been read.
    #[must_use]
    pub fn read_position(&self) -> u64 {
        self.read_position
    }

    /// Move the read marker forward to `position`, capped at the newest
    /// message.
    ///
    /// Returns `true` if the marker moved.
    pub fn mark_read(&mut self, position: u64) -> bool {
        let target = position.min(self.last_position().unwrap_or(0));
        if target <= self.read_position {
            return false;
        }
        self.read_position = target;
        true
    }

    /// Messages past the read marker, not counting those sent by `own`.
    #[must_use]
    pub fn unread_count(&self, own: Option<&str>) -> usize {
        self.messages
            .range(self.read_position.saturating_add(1)..)
            .filter(|(_, m)| Some(m.sender.as_str()) != own)
            .count()
    }

    /// Owned view for callers; `own` is the local username.
    #[must_use]
    pub fn summary(&self, own: Option<&str>) -> ConversationSummary {
        ConversationSummary {
            id: self.id,
            name: self.name.clone(),
            members: self.members.clone(),
            message_count: self.messages.len(),
            last_position: self.last_position(),
            unread_messages: self.unread_count(own),
        }
    }
}

/// Serialized form of a conversation; checked on the way back in.
#[derive(Deserialize)]
struct StoredConversation {
    id: ConversationId,
    name: String,
    members: Vec<String>,
    messages: BTreeMap<u64, Message>,
    #[serde(default)]
    read_position: u64,
}

impl TryFrom<StoredConversation> for Conversation {
    type Error = String;

    fn try_from(stored: StoredConversation) -> Result<Self, Self::Error> {
        if stored.members.is_empty() {
            return Err(format!("conversation {} has no members", stored.id));
        }
        let mut seen = HashSet::with_capacity(stored.messages.len());
        for (position, message) in &stored.messages {
            if *position != message.position || message.conversation_id != stored.id {
                return Err(format!(
                    "message {} misplaced in conversation {}",
                    message.id, stored.id
                ));
            }
            if !seen.insert(message.id) {
                return Err(format!("message {} stored twice", message.id));
            }
        }
        Ok(Self {
            id: stored.id,
            name: stored.name,
            members: stored.members,
            messages: stored.messages,
            read_position: stored.read_position,
            seen,
        })
    }
}
