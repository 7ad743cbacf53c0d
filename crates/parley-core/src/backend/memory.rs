//! In-process backend.
//!
//! Keeps the user directory, conversations and one delivery queue per device
//! in memory. Used by tests, by embedders that want a local-only setup, and
//! by `parley-server` as its store.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parley_protocol::{
    ClientRecord, Delivery, DeliveryEvent, ErrorCode, Receipt, Version, PROTOCOL_VERSION,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, trace};
use url::Url;
use uuid::Uuid;

use super::{Backend, BackendError, Connector};
use crate::message::now_millis;

/// URL scheme served by [`MemoryConnector`].
pub const MEMORY_SCHEME: &str = "memory";

/// Default maximum payload accepted by `send_message` (64 KiB).
const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Acknowledged entries kept per queue while redelivery is on.
const REDELIVERY_WINDOW: usize = 64;

#[derive(Debug)]
struct ConversationRecord {
    name: String,
    members: Vec<String>,
    /// Sequence handed to the next accepted message.
    next_sequence: u64,
}

/// Users and conversations. Every mutation, including its fan-out, happens
/// under one lock so that queues see membership before messages.
#[derive(Debug, Default)]
struct Directory {
    users: HashMap<String, Vec<ClientRecord>>,
    conversations: HashMap<Uuid, ConversationRecord>,
}

impl Directory {
    fn devices_of<'a>(&'a self, usernames: &'a [String]) -> impl Iterator<Item = &'a str> + 'a {
        usernames
            .iter()
            .filter_map(|u| self.users.get(u))
            .flatten()
            .map(|record| record.client_id.as_str())
    }
}

#[derive(Debug, Default)]
struct Queue {
    last_cursor: u64,
    entries: VecDeque<Delivery>,
}

impl Queue {
    /// Drop entries up to `after`, except the newest `keep` of them.
    fn acknowledge(&mut self, after: u64, keep: usize) -> usize {
        let acked = self.entries.iter().take_while(|d| d.cursor <= after).count();
        let dropped = acked.saturating_sub(keep);
        self.entries.drain(..dropped);
        dropped
    }
}

/// A complete backend living in process memory.
#[derive(Debug)]
pub struct MemoryBackend {
    directory: Mutex<Directory>,
    /// Device queues; read by fetches without touching the directory.
    queues: DashMap<String, Queue>,
    online: AtomicBool,
    redeliver: AtomicBool,
    max_message_size: usize,
}

impl MemoryBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Create an empty backend with a payload limit.
    #[must_use]
    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            directory: Mutex::new(Directory::default()),
            queues: DashMap::new(),
            online: AtomicBool::new(true),
            redeliver: AtomicBool::new(false),
            max_message_size,
        }
    }

    /// Simulate an outage: while offline every call fails with a
    /// transport error.
    pub fn set_online(&self, online: bool) {
        info!(online, "Memory backend availability changed");
        self.online.store(online, Ordering::SeqCst);
    }

    /// Make fetches ignore the caller's cursor and return every retained
    /// entry, as an at-least-once backend may after a retry. While on, each
    /// queue keeps its most recent acknowledged entries for replay.
    pub fn set_redelivery(&self, redeliver: bool) {
        self.redeliver.store(redeliver, Ordering::SeqCst);
    }

    /// Number of entries retained in a device queue.
    #[must_use]
    pub fn queue_len(&self, client_id: &str) -> usize {
        self.queues.get(client_id).map_or(0, |q| q.entries.len())
    }

    /// Number of registered users.
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.directory.lock().map_or(0, |d| d.users.len())
    }

    fn ensure_online(&self) -> Result<(), BackendError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::Transport("backend unreachable".into()))
        }
    }

    fn directory(&self) -> Result<MutexGuard<'_, Directory>, BackendError> {
        self.ensure_online()?;
        self.directory
            .lock()
            .map_err(|_| BackendError::rejected(ErrorCode::Internal, "directory lock poisoned"))
    }

    fn enqueue(&self, client_id: &str, event: DeliveryEvent) {
        let mut queue = self.queues.entry(client_id.to_string()).or_default();
        queue.last_cursor += 1;
        let cursor = queue.last_cursor;
        trace!(client = %client_id, cursor, "Enqueued delivery");
        queue.entries.push_back(Delivery { cursor, event });
    }

    fn add_device(
        directory: &mut Directory,
        username: &str,
        device: &str,
    ) -> ClientRecord {
        let devices = directory.users.entry(username.to_string()).or_default();
        let record = ClientRecord {
            client_id: format!("{username}#{}", devices.len() + 1),
            username: username.to_string(),
            device: device.to_string(),
            registered_at: now_millis(),
        };
        devices.push(record.clone());
        record
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn version(&self) -> Result<Version, BackendError> {
        self.ensure_online()?;
        Ok(PROTOCOL_VERSION)
    }

    async fn register_user(
        &self,
        username: &str,
        device: &str,
    ) -> Result<ClientRecord, BackendError> {
        let mut directory = self.directory()?;
        if directory.users.contains_key(username) {
            return Err(BackendError::rejected(ErrorCode::DuplicateUser, username));
        }
        let record = Self::add_device(&mut directory, username, device);
        info!(user = %username, client = %record.client_id, "User registered");
        Ok(record)
    }

    async fn register_client(
        &self,
        username: &str,
        device: &str,
    ) -> Result<ClientRecord, BackendError> {
        let mut directory = self.directory()?;
        if !directory.users.contains_key(username) {
            return Err(BackendError::rejected(ErrorCode::UnknownUser, username));
        }
        let record = Self::add_device(&mut directory, username, device);

        // The new device learns every conversation its user is in.
        for (id, conversation) in &directory.conversations {
            if conversation.members.iter().any(|m| m == username) {
                self.enqueue(
                    &record.client_id,
                    DeliveryEvent::Welcome {
                        conversation_id: *id,
                        name: conversation.name.clone(),
                        members: conversation.members.clone(),
                    },
                );
            }
        }
        info!(user = %username, client = %record.client_id, "Client registered");
        Ok(record)
    }

    async fn create_conversation(
        &self,
        creator: &str,
        conversation_id: Uuid,
        name: &str,
    ) -> Result<(), BackendError> {
        let mut directory = self.directory()?;
        if !directory.users.contains_key(creator) {
            return Err(BackendError::rejected(ErrorCode::UnknownUser, creator));
        }
        if let Some(existing) = directory.conversations.get(&conversation_id) {
            // A retried create from the same creator is not an error.
            if existing.members.first().map(String::as_str) == Some(creator) {
                return Ok(());
            }
            return Err(BackendError::rejected(
                ErrorCode::BadRequest,
                format!("conversation {conversation_id} already exists"),
            ));
        }

        let members = vec![creator.to_string()];
        for client_id in directory.devices_of(&members) {
            self.enqueue(
                client_id,
                DeliveryEvent::Welcome {
                    conversation_id,
                    name: name.to_string(),
                    members: members.clone(),
                },
            );
        }
        directory.conversations.insert(
            conversation_id,
            ConversationRecord {
                name: name.to_string(),
                members,
                next_sequence: 1,
            },
        );
        debug!(conversation = %conversation_id, creator = %creator, "Conversation created");
        Ok(())
    }

    async fn invite_member(
        &self,
        inviter: &str,
        conversation_id: Uuid,
        username: &str,
    ) -> Result<(), BackendError> {
        let mut directory = self.directory()?;
        if !directory.users.contains_key(username) {
            return Err(BackendError::rejected(ErrorCode::UnknownUser, username));
        }
        let conversation = directory
            .conversations
            .get_mut(&conversation_id)
            .ok_or_else(|| {
                BackendError::rejected(ErrorCode::UnknownConversation, conversation_id.to_string())
            })?;
        if !conversation.members.iter().any(|m| m == inviter) {
            return Err(BackendError::rejected(ErrorCode::NotMember, inviter));
        }
        if conversation.members.iter().any(|m| m == username) {
            return Ok(());
        }

        let existing = conversation.members.clone();
        conversation.members.push(username.to_string());
        let name = conversation.name.clone();
        let members = conversation.members.clone();

        for client_id in directory.devices_of(&existing) {
            self.enqueue(
                client_id,
                DeliveryEvent::MemberAdded {
                    conversation_id,
                    username: username.to_string(),
                    invited_by: inviter.to_string(),
                },
            );
        }
        let invitee = [username.to_string()];
        for client_id in directory.devices_of(&invitee) {
            self.enqueue(
                client_id,
                DeliveryEvent::Welcome {
                    conversation_id,
                    name: name.clone(),
                    members: members.clone(),
                },
            );
        }
        debug!(
            conversation = %conversation_id,
            user = %username,
            inviter = %inviter,
            "Member invited"
        );
        Ok(())
    }

    async fn remove_member(
        &self,
        remover: &str,
        conversation_id: Uuid,
        username: &str,
    ) -> Result<(), BackendError> {
        let mut directory = self.directory()?;
        if !directory.users.contains_key(username) {
            return Err(BackendError::rejected(ErrorCode::UnknownUser, username));
        }
        let conversation = directory
            .conversations
            .get_mut(&conversation_id)
            .ok_or_else(|| {
                BackendError::rejected(ErrorCode::UnknownConversation, conversation_id.to_string())
            })?;
        if !conversation.members.iter().any(|m| m == remover) {
            return Err(BackendError::rejected(ErrorCode::NotMember, remover));
        }
        if !conversation.members.iter().any(|m| m == username) {
            return Ok(());
        }
        if conversation.members.len() == 1 {
            return Err(BackendError::rejected(
                ErrorCode::BadRequest,
                format!("{username} is the last member of {conversation_id}"),
            ));
        }

        // The removed user's devices hear about it as well.
        let notified = conversation.members.clone();
        conversation.members.retain(|m| m != username);

        for client_id in directory.devices_of(&notified) {
            self.enqueue(
                client_id,
                DeliveryEvent::MemberRemoved {
                    conversation_id,
                    username: username.to_string(),
                    removed_by: remover.to_string(),
                },
            );
        }
        debug!(
            conversation = %conversation_id,
            user = %username,
            remover = %remover,
            "Member removed"
        );
        Ok(())
    }

    async fn send_message(
        &self,
        sender: &str,
        conversation_id: Uuid,
        payload: Bytes,
    ) -> Result<Receipt, BackendError> {
        if payload.len() > self.max_message_size {
            return Err(BackendError::rejected(
                ErrorCode::BadRequest,
                format!(
                    "message of {} bytes exceeds limit of {}",
                    payload.len(),
                    self.max_message_size
                ),
            ));
        }
        let mut directory = self.directory()?;
        let conversation = directory
            .conversations
            .get_mut(&conversation_id)
            .ok_or_else(|| {
                BackendError::rejected(ErrorCode::UnknownConversation, conversation_id.to_string())
            })?;
        if !conversation.members.iter().any(|m| m == sender) {
            return Err(BackendError::rejected(ErrorCode::NotMember, sender));
        }

        let receipt = Receipt {
            message_id: Uuid::new_v4(),
            sequence: conversation.next_sequence,
            timestamp: now_millis(),
        };
        conversation.next_sequence += 1;
        let members = conversation.members.clone();

        for client_id in directory.devices_of(&members) {
            self.enqueue(
                client_id,
                DeliveryEvent::Message {
                    conversation_id,
                    message_id: receipt.message_id,
                    sender: sender.to_string(),
                    payload: payload.to_vec(),
                    sequence: receipt.sequence,
                    timestamp: receipt.timestamp,
                },
            );
        }
        trace!(conversation = %conversation_id, sequence = receipt.sequence, "Message accepted");
        Ok(receipt)
    }

    async fn fetch_messages(
        &self,
        client_id: &str,
        after: u64,
    ) -> Result<Vec<Delivery>, BackendError> {
        self.ensure_online()?;
        let Some(mut queue) = self.queues.get_mut(client_id) else {
            return Ok(Vec::new());
        };

        // `after` acknowledges everything up to it.
        let redeliver = self.redeliver.load(Ordering::SeqCst);
        let keep = if redeliver { REDELIVERY_WINDOW } else { 0 };
        let dropped = queue.acknowledge(after, keep);
        if dropped > 0 {
            trace!(client = %client_id, after, dropped, "Acknowledged deliveries dropped");
        }

        let from = if redeliver { 0 } else { after };
        Ok(queue
            .entries
            .iter()
            .filter(|d| d.cursor > from)
            .cloned()
            .collect())
    }

    async fn list_clients(&self, username: &str) -> Result<Vec<ClientRecord>, BackendError> {
        let directory = self.directory()?;
        directory
            .users
            .get(username)
            .cloned()
            .ok_or_else(|| BackendError::rejected(ErrorCode::UnknownUser, username))
    }
}

/// Connects `memory://` URLs to a shared [`MemoryBackend`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    backend: Arc<MemoryBackend>,
}

impl MemoryConnector {
    /// Create a connector handing out `backend`.
    #[must_use]
    pub fn new(backend: Arc<MemoryBackend>) -> Self {
        Self { backend }
    }

    /// The backend handed out by this connector.
    #[must_use]
    pub fn backend(&self) -> &Arc<MemoryBackend> {
        &self.backend
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn supports(&self, url: &Url) -> bool {
        url.scheme() == MEMORY_SCHEME
    }

    async fn connect(&self, url: &Url) -> Result<Arc<dyn Backend>, BackendError> {
        self.backend.ensure_online()?;
        debug!(url = %url, "Connected to memory backend");
        Ok(Arc::clone(&self.backend) as Arc<dyn Backend>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn backend_with(users: &[&str]) -> MemoryBackend {
        let backend = MemoryBackend::new();
        for user in users {
            backend.register_user(user, "primary").await.unwrap();
        }
        backend
    }

    #[tokio::test]
    async fn test_register_user_rejects_duplicates() {
        let backend = backend_with(&["alice"]).await;
        let err = backend.register_user("alice", "laptop").await.unwrap_err();
        assert!(matches!(
            err,
            BackendError::Rejected {
                code: ErrorCode::DuplicateUser,
                ..
            }
        ));
        assert_eq!(backend.user_count(), 1);
    }

    #[tokio::test]
    async fn test_register_client_requires_user_and_welcomes() {
        let backend = backend_with(&["alice"]).await;
        let id = Uuid::new_v4();
        backend.create_conversation("alice", id, "team").await.unwrap();

        assert!(backend.register_client("bob", "phone").await.is_err());

        let phone = backend.register_client("alice", "phone").await.unwrap();
        assert_eq!(phone.client_id, "alice#2");
        let deliveries = backend.fetch_messages(&phone.client_id, 0).await.unwrap();
        assert_eq!(deliveries.len(), 1);
        assert!(matches!(deliveries[0].event, DeliveryEvent::Welcome { .. }));

        let clients = backend.list_clients("alice").await.unwrap();
        assert_eq!(clients.len(), 2);
    }

    #[tokio::test]
    async fn test_invite_fans_out_welcome_and_member_added() {
        let backend = backend_with(&["alice", "bob"]).await;
        let id = Uuid::new_v4();
        backend.create_conversation("alice", id, "team").await.unwrap();
        backend.invite_member("alice", id, "bob").await.unwrap();
        // Inviting twice changes nothing.
        backend.invite_member("alice", id, "bob").await.unwrap();

        let bob = backend.fetch_messages("bob#1", 0).await.unwrap();
        assert_eq!(bob.len(), 1);
        match &bob[0].event {
            DeliveryEvent::Welcome { members, .. } => assert_eq!(members, &["alice", "bob"]),
            other => panic!("expected welcome, got {other:?}"),
        }

        let alice = backend.fetch_messages("alice#1", 0).await.unwrap();
        assert_eq!(alice.len(), 2);
        assert!(matches!(alice[1].event, DeliveryEvent::MemberAdded { .. }));
    }

    #[tokio::test]
    async fn test_invite_errors() {
        let backend = backend_with(&["alice", "bob", "carol"]).await;
        let id = Uuid::new_v4();

        let unknown_conversation = backend.invite_member("alice", id, "bob").await.unwrap_err();
        assert!(matches!(
            unknown_conversation,
            BackendError::Rejected {
                code: ErrorCode::UnknownConversation,
                ..
            }
        ));

        backend.create_conversation("alice", id, "team").await.unwrap();
        let unknown_user = backend.invite_member("alice", id, "dave").await.unwrap_err();
        assert!(matches!(
            unknown_user,
            BackendError::Rejected {
                code: ErrorCode::UnknownUser,
                ..
            }
        ));

        let outsider = backend.invite_member("carol", id, "bob").await.unwrap_err();
        assert!(matches!(
            outsider,
            BackendError::Rejected {
                code: ErrorCode::NotMember,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_send_assigns_sequences_and_fans_out() {
        let backend = backend_with(&["alice", "bob"]).await;
        let id = Uuid::new_v4();
        backend.create_conversation("alice", id, "team").await.unwrap();
        backend.invite_member("alice", id, "bob").await.unwrap();

        let first = backend
            .send_message("alice", id, Bytes::from_static(b"one"))
            .await
            .unwrap();
        let second = backend
            .send_message("bob", id, Bytes::from_static(b"two"))
            .await
            .unwrap();
        assert_eq!((first.sequence, second.sequence), (1, 2));

        // bob: welcome + two messages
        assert_eq!(backend.queue_len("bob#1"), 3);
        let after_welcome = backend.fetch_messages("bob#1", 1).await.unwrap();
        assert_eq!(after_welcome.len(), 2);
    }

    #[tokio::test]
    async fn test_send_limits() {
        let backend = MemoryBackend::with_max_message_size(4);
        backend.register_user("alice", "primary").await.unwrap();
        let id = Uuid::new_v4();
        backend.create_conversation("alice", id, "team").await.unwrap();

        let err = backend
            .send_message("alice", id, Bytes::from_static(b"too long"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BackendError::Rejected {
                code: ErrorCode::BadRequest,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_offline_and_redelivery() {
        let backend = backend_with(&["alice"]).await;
        backend
            .create_conversation("alice", Uuid::new_v4(), "team")
            .await
            .unwrap();

        backend.set_online(false);
        assert!(matches!(
            backend.fetch_messages("alice#1", 0).await,
            Err(BackendError::Transport(_))
        ));
        backend.set_online(true);

        backend.set_redelivery(true);
        assert_eq!(backend.fetch_messages("alice#1", 1).await.unwrap().len(), 1);
        assert_eq!(backend.queue_len("alice#1"), 1);

        backend.set_redelivery(false);
        assert!(backend.fetch_messages("alice#1", 1).await.unwrap().is_empty());
        assert_eq!(backend.queue_len("alice#1"), 0);
    }

    #[tokio::test]
    async fn test_fetch_drops_acknowledged_entries() {
        let backend = backend_with(&["alice"]).await;
        let id = Uuid::new_v4();
        backend.create_conversation("alice", id, "team").await.unwrap();
        for i in 0..100 {
            backend
                .send_message("alice", id, Bytes::from(format!("m{i}")))
                .await
                .unwrap();
        }

        let all = backend.fetch_messages("alice#1", 0).await.unwrap();
        assert_eq!(all.len(), 101);
        assert_eq!(backend.queue_len("alice#1"), 101);

        let cursor = all.last().map(|d| d.cursor).unwrap();
        assert_eq!(cursor, 101);
        assert!(backend.fetch_messages("alice#1", cursor).await.unwrap().is_empty());
        assert_eq!(backend.queue_len("alice#1"), 0);

        // Cursors keep counting after the queue drained.
        backend
            .send_message("alice", id, Bytes::from_static(b"later"))
            .await
            .unwrap();
        let later = backend.fetch_messages("alice#1", cursor).await.unwrap();
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].cursor, 102);
    }

    #[tokio::test]
    async fn test_redelivery_replays_a_bounded_window() {
        let backend = backend_with(&["alice"]).await;
        let id = Uuid::new_v4();
        backend.create_conversation("alice", id, "team").await.unwrap();
        for _ in 0..REDELIVERY_WINDOW * 2 {
            backend
                .send_message("alice", id, Bytes::from_static(b"x"))
                .await
                .unwrap();
        }
        let last = (REDELIVERY_WINDOW * 2 + 1) as u64;

        backend.set_redelivery(true);
        let replayed = backend.fetch_messages("alice#1", last).await.unwrap();
        assert_eq!(replayed.len(), REDELIVERY_WINDOW);
        assert_eq!(replayed.last().map(|d| d.cursor), Some(last));
        assert_eq!(backend.queue_len("alice#1"), REDELIVERY_WINDOW);
    }

    #[tokio::test]
    async fn test_remove_member_fans_out_and_guards() {
        let backend = backend_with(&["alice", "bob", "carol"]).await;
        let id = Uuid::new_v4();
        backend.create_conversation("alice", id, "team").await.unwrap();
        backend.invite_member("alice", id, "bob").await.unwrap();

        let outsider = backend.remove_member("carol", id, "bob").await.unwrap_err();
        assert!(matches!(
            outsider,
            BackendError::Rejected {
                code: ErrorCode::NotMember,
                ..
            }
        ));

        backend.remove_member("alice", id, "bob").await.unwrap();
        // Removing again changes nothing.
        backend.remove_member("alice", id, "bob").await.unwrap();

        // bob: welcome + removal, alice: welcome + added + removed
        let bob = backend.fetch_messages("bob#1", 0).await.unwrap();
        assert_eq!(bob.len(), 2);
        assert!(matches!(
            &bob[1].event,
            DeliveryEvent::MemberRemoved { username, removed_by, .. }
                if username == "bob" && removed_by == "alice"
        ));
        assert_eq!(backend.fetch_messages("alice#1", 0).await.unwrap().len(), 3);

        let err = backend
            .send_message("bob", id, Bytes::from_static(b"still here?"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BackendError::Rejected {
                code: ErrorCode::NotMember,
                ..
            }
        ));

        let last = backend.remove_member("alice", id, "alice").await.unwrap_err();
        assert!(matches!(
            last,
            BackendError::Rejected {
                code: ErrorCode::BadRequest,
                ..
            }
        ));
    }
}
