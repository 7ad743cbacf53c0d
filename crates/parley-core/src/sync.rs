//! Network sync engine.
//!
//! Sends messages, lists peer devices and pulls the device's delivery queue
//! into the registry. A fetch takes the state lock twice: once to read the
//! cursor and once to merge what the backend returned. The network call in
//! between runs without it.
//!
//! Each known conversation moves through
//! `Idle -> Fetching -> {Merged, Failed} -> Idle` on every fetch. A failed
//! fetch is reported to the caller and leaves the registry untouched.

use bytes::Bytes;
use parley_protocol::{ClientRecord, Delivery, DeliveryEvent};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use tracing::{debug, info, trace, warn};

use crate::client::{Client, ClientState};
use crate::conversation::{Conversation, ConversationId};
use crate::error::{CoreError, Result};
use crate::message::Message;
use crate::notifier::{Event, Notifier};

/// Fetch state of one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FetchState {
    Idle,
    Fetching,
    Merged,
    Failed,
}

impl FetchState {
    /// Check if moving to `next` is allowed.
    #[must_use]
    pub fn can_transition_to(self, next: FetchState) -> bool {
        matches!(
            (self, next),
            (FetchState::Idle, FetchState::Fetching)
                | (FetchState::Fetching, FetchState::Merged)
                | (FetchState::Fetching, FetchState::Failed)
                | (FetchState::Merged, FetchState::Idle)
                | (FetchState::Failed, FetchState::Idle)
        )
    }
}

impl fmt::Display for FetchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FetchState::Idle => "idle",
            FetchState::Fetching => "fetching",
            FetchState::Merged => "merged",
            FetchState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// How the last fetch ended for a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FetchOutcome {
    /// Deliveries were merged; `applied` of them changed state.
    Merged { applied: usize },
    /// The backend call failed.
    Failed { error: String },
}

/// Sync status of one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub state: FetchState,
    /// `None` until the first fetch that covered the conversation.
    pub last_outcome: Option<FetchOutcome>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            state: FetchState::Idle,
            last_outcome: None,
        }
    }
}

/// Per-conversation fetch state.
#[derive(Debug, Default, Clone)]
pub(crate) struct SyncTracker {
    statuses: HashMap<ConversationId, SyncStatus>,
}

impl SyncTracker {
    fn transition(&mut self, id: ConversationId, next: FetchState) -> bool {
        let status = self.statuses.entry(id).or_default();
        if !status.state.can_transition_to(next) {
            warn!(
                conversation = %id,
                from = %status.state,
                to = %next,
                "Rejected fetch state transition"
            );
            return false;
        }
        trace!(conversation = %id, from = %status.state, to = %next, "Fetch state transition");
        status.state = next;
        true
    }

    /// Track a conversation, starting idle.
    pub(crate) fn track(&mut self, id: ConversationId) {
        self.statuses.entry(id).or_default();
    }

    /// Move every idle conversation to `Fetching`.
    fn begin<I: IntoIterator<Item = ConversationId>>(&mut self, ids: I) {
        for id in ids {
            self.transition(id, FetchState::Fetching);
        }
    }

    /// Close a successful fetch. Conversations that were fetching pass
    /// through `Merged`; conversations learned during the fetch only record
    /// the outcome.
    fn finish_merged(&mut self, applied: &HashMap<ConversationId, usize>) {
        let fetching: Vec<ConversationId> = self.in_state(FetchState::Fetching);
        for id in &fetching {
            self.transition(*id, FetchState::Merged);
            self.transition(*id, FetchState::Idle);
        }
        for id in fetching.iter().chain(applied.keys()) {
            let outcome = FetchOutcome::Merged {
                applied: applied.get(id).copied().unwrap_or(0),
            };
            self.statuses.entry(*id).or_default().last_outcome = Some(outcome);
        }
    }

    /// Close a failed fetch.
    fn finish_failed(&mut self, error: &str) {
        for id in self.in_state(FetchState::Fetching) {
            self.transition(id, FetchState::Failed);
            if let Some(status) = self.statuses.get_mut(&id) {
                status.last_outcome = Some(FetchOutcome::Failed {
                    error: error.to_string(),
                });
            }
            self.transition(id, FetchState::Idle);
        }
    }

    fn in_state(&self, state: FetchState) -> Vec<ConversationId> {
        self.statuses
            .iter()
            .filter(|(_, status)| status.state == state)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Get the status of a conversation.
    pub(crate) fn status(&self, id: &ConversationId) -> SyncStatus {
        self.statuses.get(id).cloned().unwrap_or_default()
    }

    /// Forget every conversation.
    pub(crate) fn clear(&mut self) {
        self.statuses.clear();
    }
}

/// What one `fetch_messages` call did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchReport {
    /// Deliveries returned by the backend.
    pub deliveries: usize,
    /// Deliveries that changed local state. Redelivered entries do not count.
    pub applied: usize,
    /// Conversations that changed, in first-change order.
    pub conversations: Vec<ConversationId>,
    /// Queue cursor after the merge.
    pub cursor: u64,
}

impl FetchReport {
    /// Whether the fetch changed nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.applied == 0
    }
}

impl ClientState {
    /// Apply one delivery. Returns `true` if state changed.
    ///
    /// Every change emits exactly one event, while the caller still holds
    /// the write lock.
    fn apply(&mut self, event: DeliveryEvent, notifier: &Notifier) -> bool {
        match event {
            DeliveryEvent::Welcome {
                conversation_id,
                name,
                members,
            } => {
                let id = ConversationId::from(conversation_id);
                if self.registry.contains(&id) {
                    // Already known: pick up members we have not seen yet.
                    let mut changed = false;
                    for username in members {
                        if matches!(self.registry.add_member(&id, &username), Ok(true)) {
                            notifier.emit(Event::MemberAdded {
                                conversation_id: id,
                                username,
                            });
                            changed = true;
                        }
                    }
                    return changed;
                }
                match Conversation::with_members(id, name, members) {
                    Ok(conversation) => {
                        let name = conversation.name().to_string();
                        let members = conversation.members().to_vec();
                        self.registry.insert(conversation);
                        self.sync.track(id);
                        info!(conversation = %id, name = %name, "Joined conversation");
                        notifier.emit(Event::ConversationCreated {
                            conversation_id: id,
                            name,
                            members,
                        });
                        true
                    }
                    Err(e) => {
                        warn!(conversation = %id, error = %e, "Ignoring malformed welcome");
                        false
                    }
                }
            }
            DeliveryEvent::MemberAdded {
                conversation_id,
                username,
                invited_by,
            } => {
                let id = ConversationId::from(conversation_id);
                match self.registry.add_member(&id, &username) {
                    Ok(true) => {
                        debug!(
                            conversation = %id,
                            user = %username,
                            inviter = %invited_by,
                            "Member joined"
                        );
                        notifier.emit(Event::MemberAdded {
                            conversation_id: id,
                            username,
                        });
                        true
                    }
                    Ok(false) => false,
                    Err(_) => {
                        warn!(
                            conversation = %id,
                            user = %username,
                            "Member added to unknown conversation"
                        );
                        false
                    }
                }
            }
            DeliveryEvent::MemberRemoved {
                conversation_id,
                username,
                removed_by,
            } => {
                let id = ConversationId::from(conversation_id);
                match self.registry.remove_member(&id, &username) {
                    Ok(true) => {
                        debug!(
                            conversation = %id,
                            user = %username,
                            remover = %removed_by,
                            "Member left"
                        );
                        notifier.emit(Event::MemberRemoved {
                            conversation_id: id,
                            username,
                        });
                        true
                    }
                    Ok(false) => false,
                    Err(_) => {
                        warn!(
                            conversation = %id,
                            user = %username,
                            "Member removed from unknown conversation"
                        );
                        false
                    }
                }
            }
            DeliveryEvent::Message {
                conversation_id,
                message_id,
                sender,
                payload,
                sequence,
                timestamp,
            } => {
                let message = Message {
                    id: message_id,
                    conversation_id: ConversationId::from(conversation_id),
                    sender,
                    payload: Bytes::from(payload),
                    position: sequence,
                    timestamp,
                };
                match self.registry.append(message.clone()) {
                    Ok(true) => {
                        notifier.emit(Event::MessageReceived { message });
                        true
                    }
                    Ok(false) => false,
                    Err(_) => {
                        warn!(
                            conversation = %message.conversation_id,
                            message = %message.id,
                            "Message for unknown conversation"
                        );
                        false
                    }
                }
            }
        }
    }

    /// Merge fetched deliveries in cursor order.
    ///
    /// Deliveries at or below the session cursor were applied by an earlier
    /// fetch and are skipped, so a redelivered membership change can never
    /// undo a later one.
    pub(crate) fn merge(&mut self, deliveries: Vec<Delivery>, notifier: &Notifier) -> FetchReport {
        let mut report = FetchReport {
            deliveries: deliveries.len(),
            ..FetchReport::default()
        };
        let mut applied: HashMap<ConversationId, usize> = HashMap::new();
        let mut touched = BTreeSet::new();

        let mut deliveries = deliveries;
        deliveries.sort_by_key(|d| d.cursor);
        for delivery in deliveries {
            if delivery.cursor <= self.session.cursor() {
                trace!(cursor = delivery.cursor, "Skipping redelivered entry");
                continue;
            }
            let id = ConversationId::from(delivery.event.conversation_id());
            if self.apply(delivery.event, notifier) {
                report.applied += 1;
                *applied.entry(id).or_default() += 1;
                if touched.insert(id) {
                    report.conversations.push(id);
                }
            }
            self.session.advance_cursor(delivery.cursor);
        }

        self.sync.finish_merged(&applied);
        report.cursor = self.session.cursor();
        report
    }
}

impl Client {
    /// Send a message to a conversation.
    ///
    /// The message is added to the local history only once the backend has
    /// acknowledged it, at the position the backend assigned.
    ///
    /// # Errors
    ///
    /// - `CoreError::NotFound` if the conversation is unknown
    /// - `CoreError::InvalidInput` if the payload exceeds the configured limit
    /// - `CoreError::Network` if the backend call fails
    pub async fn send_message(
        &self,
        conversation_id: &ConversationId,
        payload: impl Into<Bytes>,
    ) -> Result<Message> {
        let payload = payload.into();
        if payload.len() > self.config.max_message_size {
            return Err(CoreError::InvalidInput(format!(
                "message of {} bytes exceeds limit of {}",
                payload.len(),
                self.config.max_message_size
            )));
        }

        let sender = {
            let state = self.state.read().await;
            let user = state.session.require_user()?;
            state.registry.get(conversation_id)?;
            user.username.clone()
        };

        let receipt = self
            .backend
            .send_message(&sender, conversation_id.as_uuid(), payload.clone())
            .await?;
        let message = Message::acknowledged(*conversation_id, sender, payload, &receipt);

        let mut state = self.state.write().await;
        if state.registry.append(message.clone())? {
            self.notifier.emit(Event::MessageReceived {
                message: message.clone(),
            });
        }
        debug!(
            conversation = %conversation_id,
            message = %message.id,
            position = message.position,
            "Message sent"
        );
        Ok(message)
    }

    /// List every device registered for the local user, this one included.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Network` if the backend call fails.
    pub async fn get_clients(&self) -> Result<Vec<ClientRecord>> {
        let username = {
            let state = self.state.read().await;
            state.session.require_user()?.username.clone()
        };
        Ok(self.backend.list_clients(&username).await?)
    }

    /// Pull new deliveries from the backend and merge them.
    ///
    /// Merging is idempotent: deliveries already applied change nothing and
    /// emit nothing, so repeating a fetch with no new server data is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Network` if the backend call fails. Local state is
    /// unchanged and the next fetch starts from the same cursor.
    pub async fn fetch_messages(&self) -> Result<FetchReport> {
        let _serial = self.fetch_guard.lock().await;

        let (client_id, cursor) = {
            let mut state = self.state.write().await;
            let user = state.session.require_user()?;
            let client_id = user.client_id.clone();
            let cursor = state.session.cursor();
            let ids = state.registry.ids();
            state.sync.begin(ids);
            (client_id, cursor)
        };

        let fetched = self.backend.fetch_messages(&client_id, cursor).await;

        let mut state = self.state.write().await;
        let deliveries = match fetched {
            Ok(deliveries) => deliveries,
            Err(e) => {
                let error = CoreError::from(e);
                warn!(client = %client_id, error = %error, "Fetch failed");
                state.sync.finish_failed(&error.to_string());
                return Err(error);
            }
        };

        // The identity may have been replaced while the request was in flight.
        if state.session.user().map(|u| u.client_id.as_str()) != Some(client_id.as_str()) {
            debug!(client = %client_id, "Discarding fetch for replaced identity");
            state.sync.finish_merged(&HashMap::new());
            return Ok(FetchReport {
                cursor: state.session.cursor(),
                ..FetchReport::default()
            });
        }

        let report = state.merge(deliveries, &self.notifier);
        if report.applied > 0 {
            debug!(
                client = %client_id,
                deliveries = report.deliveries,
                applied = report.applied,
                cursor = report.cursor,
                "Fetch merged"
            );
        } else {
            trace!(client = %client_id, deliveries = report.deliveries, "Fetch changed nothing");
        }
        Ok(report)
    }

    /// Fetch status of a conversation.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` for unknown conversations.
    pub async fn sync_status(&self, conversation_id: &ConversationId) -> Result<SyncStatus> {
        let state = self.state.read().await;
        state.registry.get(conversation_id)?;
        Ok(state.sync.status(conversation_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, MemoryConnector};
    use crate::config::ClientConfig;
    use crate::notifier::StreamError;
    use std::sync::Arc;

    async fn client_on(backend: &Arc<MemoryBackend>, username: &str) -> Client {
        let connector = MemoryConnector::new(Arc::clone(backend));
        let client = Client::initialize("memory://local", &connector)
            .await
            .unwrap();
        client.create_user(username).await.unwrap();
        client
    }

    fn drain(stream: &mut crate::notifier::EventStream) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(Some(envelope)) = stream.try_recv() {
            events.push(envelope.event.clone());
        }
        events
    }

    #[test]
    fn test_fetch_state_transitions() {
        use FetchState::*;
        assert!(Idle.can_transition_to(Fetching));
        assert!(Fetching.can_transition_to(Merged));
        assert!(Fetching.can_transition_to(Failed));
        assert!(Merged.can_transition_to(Idle));
        assert!(Failed.can_transition_to(Idle));

        assert!(!Idle.can_transition_to(Merged));
        assert!(!Merged.can_transition_to(Fetching));
        assert!(!Failed.can_transition_to(Merged));
        assert!(!Fetching.can_transition_to(Idle));
    }

    #[test]
    fn test_tracker_failed_fetch_returns_to_idle() {
        let mut tracker = SyncTracker::default();
        let id = ConversationId::generate();
        tracker.track(id);
        tracker.begin([id]);
        assert_eq!(tracker.status(&id).state, FetchState::Fetching);

        tracker.finish_failed("reset");
        let status = tracker.status(&id);
        assert_eq!(status.state, FetchState::Idle);
        assert_eq!(
            status.last_outcome,
            Some(FetchOutcome::Failed {
                error: "reset".into()
            })
        );
    }

    #[tokio::test]
    async fn test_invited_user_joins_on_fetch() {
        let backend = Arc::new(MemoryBackend::new());
        let alice = client_on(&backend, "alice").await;
        let bob = client_on(&backend, "bob").await;

        let id = alice.create_conversation("team").await.unwrap();
        alice.invite_user(&id, "bob").await.unwrap();
        alice.send_message(&id, "hello bob").await.unwrap();

        let mut events = bob.register_stream();
        let report = bob.fetch_messages().await.unwrap();
        assert_eq!(report.deliveries, 2);
        assert_eq!(report.applied, 2);
        assert_eq!(report.conversations, vec![id]);

        let conversations = bob.get_conversations().await;
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].members, ["alice", "bob"]);
        let messages = bob.get_messages(&id, 10).await.unwrap();
        assert_eq!(messages[0].text(), Some("hello bob"));

        let kinds: Vec<&str> = drain(&mut events).iter().map(Event::kind).collect();
        assert_eq!(kinds, ["conversation_created", "message_received"]);

        // alice learns about bob's membership from her own queue too, but
        // she already applied it locally.
        let report = alice.fetch_messages().await.unwrap();
        assert_eq!(report.applied, 0);
    }

    #[tokio::test]
    async fn test_repeated_fetch_changes_nothing() {
        let backend = Arc::new(MemoryBackend::new());
        let alice = client_on(&backend, "alice").await;
        let bob = client_on(&backend, "bob").await;
        let id = alice.create_conversation("team").await.unwrap();
        alice.invite_user(&id, "bob").await.unwrap();
        alice.send_message(&id, "one").await.unwrap();
        bob.fetch_messages().await.unwrap();

        let before = serde_json::to_vec(&bob.snapshot().await).unwrap();
        let mut events = bob.register_stream();

        let report = bob.fetch_messages().await.unwrap();
        assert!(report.is_empty());
        let after = serde_json::to_vec(&bob.snapshot().await).unwrap();

        assert_eq!(before, after);
        assert_eq!(events.try_recv(), Ok(None));
    }

    #[tokio::test]
    async fn test_redelivery_is_absorbed() {
        let backend = Arc::new(MemoryBackend::new());
        let alice = client_on(&backend, "alice").await;
        let bob = client_on(&backend, "bob").await;
        let id = alice.create_conversation("team").await.unwrap();
        alice.invite_user(&id, "bob").await.unwrap();
        alice.send_message(&id, "one").await.unwrap();
        bob.fetch_messages().await.unwrap();

        backend.set_redelivery(true);
        let mut events = bob.register_stream();
        let report = bob.fetch_messages().await.unwrap();

        assert_eq!(report.deliveries, 2);
        assert_eq!(report.applied, 0);
        assert_eq!(bob.get_messages(&id, 10).await.unwrap().len(), 1);
        assert_eq!(events.try_recv(), Ok(None));
    }

    #[tokio::test]
    async fn test_removal_reaches_every_member_once() {
        let backend = Arc::new(MemoryBackend::new());
        let alice = client_on(&backend, "alice").await;
        let bob = client_on(&backend, "bob").await;
        let carol = client_on(&backend, "carol").await;
        let id = alice.create_conversation("team").await.unwrap();
        alice.invite_user(&id, "bob").await.unwrap();
        alice.invite_user(&id, "carol").await.unwrap();
        for client in [&alice, &bob, &carol] {
            client.fetch_messages().await.unwrap();
        }

        alice.remove_member(&id, "bob").await.unwrap();

        let mut events = carol.register_stream();
        let report = carol.fetch_messages().await.unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(
            carol.conversation(&id).await.unwrap().members,
            ["alice", "carol"]
        );
        assert_eq!(
            drain(&mut events),
            [Event::MemberRemoved {
                conversation_id: id,
                username: "bob".into(),
            }]
        );

        // The removed user hears about it too and stops listing themselves.
        bob.fetch_messages().await.unwrap();
        assert_eq!(bob.conversation(&id).await.unwrap().members, ["alice", "carol"]);
        let err = bob.send_message(&id, "still here?").await.unwrap_err();
        assert!(matches!(err, CoreError::NotMember(_)));

        // alice applied it locally already.
        assert_eq!(alice.fetch_messages().await.unwrap().applied, 0);
    }

    #[tokio::test]
    async fn test_redelivered_removal_does_not_undo_rejoin() {
        let backend = Arc::new(MemoryBackend::new());
        let alice = client_on(&backend, "alice").await;
        let bob = client_on(&backend, "bob").await;
        let carol = client_on(&backend, "carol").await;
        let id = alice.create_conversation("team").await.unwrap();
        alice.invite_user(&id, "bob").await.unwrap();
        alice.invite_user(&id, "carol").await.unwrap();
        alice.remove_member(&id, "bob").await.unwrap();
        alice.invite_user(&id, "bob").await.unwrap();

        carol.fetch_messages().await.unwrap();
        let members = carol.conversation(&id).await.unwrap().members;
        assert_eq!(members, ["alice", "carol", "bob"]);

        backend.set_redelivery(true);
        let mut events = carol.register_stream();
        let report = carol.fetch_messages().await.unwrap();
        assert!(report.deliveries > 0);
        assert_eq!(report.applied, 0);
        assert_eq!(carol.conversation(&id).await.unwrap().members, members);
        assert_eq!(events.try_recv(), Ok(None));
    }

    #[tokio::test]
    async fn test_own_messages_are_not_duplicated() {
        let backend = Arc::new(MemoryBackend::new());
        let alice = client_on(&backend, "alice").await;
        let id = alice.create_conversation("team").await.unwrap();
        alice.send_message(&id, "one").await.unwrap();

        let report = alice.fetch_messages().await.unwrap();
        assert_eq!(report.deliveries, 2);
        assert_eq!(report.applied, 0);
        assert_eq!(alice.get_messages(&id, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_reported_and_recoverable() {
        let backend = Arc::new(MemoryBackend::new());
        let alice = client_on(&backend, "alice").await;
        let bob = client_on(&backend, "bob").await;
        let id = alice.create_conversation("team").await.unwrap();
        alice.invite_user(&id, "bob").await.unwrap();
        bob.fetch_messages().await.unwrap();
        alice.send_message(&id, "while offline").await.unwrap();

        backend.set_online(false);
        let err = bob.fetch_messages().await.unwrap_err();
        assert!(err.is_retryable());
        let status = bob.sync_status(&id).await.unwrap();
        assert_eq!(status.state, FetchState::Idle);
        assert!(matches!(status.last_outcome, Some(FetchOutcome::Failed { .. })));
        assert!(bob.get_messages(&id, 10).await.unwrap().is_empty());

        backend.set_online(true);
        let report = bob.fetch_messages().await.unwrap();
        assert_eq!(report.applied, 1);
        let status = bob.sync_status(&id).await.unwrap();
        assert_eq!(status.last_outcome, Some(FetchOutcome::Merged { applied: 1 }));
    }

    #[tokio::test]
    async fn test_send_to_unknown_conversation() {
        let backend = Arc::new(MemoryBackend::new());
        let alice = client_on(&backend, "alice").await;
        let err = alice
            .send_message(&ConversationId::generate(), "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_send_rejects_oversized_payload_locally() {
        let backend = Arc::new(MemoryBackend::new());
        let connector = MemoryConnector::new(Arc::clone(&backend));
        let config = ClientConfig {
            max_message_size: 4,
            ..ClientConfig::default()
        };
        let alice = Client::initialize_with_config("memory://local", &connector, config)
            .await
            .unwrap();
        alice.create_user("alice").await.unwrap();
        let id = alice.create_conversation("team").await.unwrap();

        let err = alice.send_message(&id, "too long").await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_concurrent_sends_follow_acknowledgment_order() {
        let backend = Arc::new(MemoryBackend::new());
        let alice = Arc::new(client_on(&backend, "alice").await);
        let id = alice.create_conversation("team").await.unwrap();

        let a = {
            let alice = Arc::clone(&alice);
            tokio::spawn(async move { alice.send_message(&id, "first").await })
        };
        let b = {
            let alice = Arc::clone(&alice);
            tokio::spawn(async move { alice.send_message(&id, "second").await })
        };
        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();

        let history = alice.get_messages(&id, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        let positions: Vec<u64> = history.iter().map(|m| m.position).collect();
        assert_eq!(positions, vec![1, 2]);
        for stored in &history {
            let sent = if stored.id == a.id { &a } else { &b };
            assert_eq!(stored, sent);
        }
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_idle_subscriber_does_not_block_others() {
        let backend = Arc::new(MemoryBackend::new());
        let connector = MemoryConnector::new(Arc::clone(&backend));
        let config = ClientConfig::default().with_event_capacity(2);
        let alice = Client::initialize_with_config("memory://local", &connector, config)
            .await
            .unwrap();
        alice.create_user("alice").await.unwrap();
        let id = alice.create_conversation("team").await.unwrap();

        let mut idle = alice.register_stream();
        let mut active = alice.register_stream();
        for i in 0..5 {
            alice.send_message(&id, format!("m{i}")).await.unwrap();
            let envelope = active.recv().await.unwrap();
            assert!(matches!(envelope.event, Event::MessageReceived { .. }));
        }

        assert_eq!(idle.try_recv(), Err(StreamError::Lagged(3)));
    }
}
