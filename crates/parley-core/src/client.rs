//! The client facade.
//!
//! [`Client`] owns the session, the conversation registry and the notifier.
//! State sits behind a reader/writer lock: accessors share it, mutations take
//! it exclusively, and only after the backend has answered. No lock is held
//! across a network call.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use url::Url;

use crate::backend::{Backend, Connector};
use crate::config::ClientConfig;
use crate::conversation::{
    validate_conversation_name, Conversation, ConversationId, ConversationSummary,
};
use crate::error::{CoreError, Result};
use crate::identity::{parse_backend_url, validate_username, Session, User};
use crate::message::Message;
use crate::notifier::{Event, EventSink, EventStream, Notifier, SubscriptionId};
use crate::registry::ConversationRegistry;
use crate::snapshot::StateSnapshot;
use crate::sync::SyncTracker;

/// Everything guarded by the state lock.
#[derive(Debug)]
pub(crate) struct ClientState {
    pub(crate) session: Session,
    pub(crate) registry: ConversationRegistry,
    pub(crate) sync: SyncTracker,
}

impl ClientState {
    fn new(session: Session) -> Self {
        Self {
            session,
            registry: ConversationRegistry::new(),
            sync: SyncTracker::default(),
        }
    }

    /// Install a newly registered identity. State learned under a previous
    /// identity belongs to another device queue and is dropped.
    fn install_user(&mut self, user: User) {
        if let Some(previous) = self.session.user() {
            info!(
                previous = %previous.username,
                user = %user.username,
                conversations = self.registry.len(),
                "Replacing local identity"
            );
            self.registry.clear();
            self.sync.clear();
        }
        self.session.set_user(user);
    }
}

/// Client statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClientStats {
    pub conversations: usize,
    pub members: usize,
    pub messages: usize,
    /// Delivery queue cursor.
    pub cursor: u64,
    /// Live event subscribers.
    pub subscribers: usize,
    /// Events emitted so far.
    pub events_emitted: u64,
}

/// A messaging client bound to one backend.
pub struct Client {
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) state: RwLock<ClientState>,
    pub(crate) notifier: Notifier,
    /// Serializes fetches so merges apply in cursor order.
    pub(crate) fetch_guard: Mutex<()>,
    pub(crate) config: ClientConfig,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .field("notifier", &self.notifier)
            .finish_non_exhaustive()
    }
}

/// Open and verify a backend connection.
async fn connect(url: &Url, connector: &dyn Connector) -> Result<Arc<dyn Backend>> {
    if !connector.supports(url) {
        return Err(CoreError::Config(format!(
            "unsupported backend scheme {:?}",
            url.scheme()
        )));
    }
    let backend = connector
        .connect(url)
        .await
        .map_err(|e| CoreError::Config(format!("backend {url} unreachable: {e}")))?;
    let version = backend
        .version()
        .await
        .map_err(|e| CoreError::Config(format!("backend {url} did not answer: {e}")))?;
    if !parley_protocol::PROTOCOL_VERSION.is_compatible_with(&version) {
        return Err(CoreError::Config(format!(
            "backend {url} speaks protocol {version}, expected {}",
            parley_protocol::PROTOCOL_VERSION
        )));
    }
    debug!(url = %url, version = %version, "Backend connected");
    Ok(backend)
}

impl Client {
    fn assemble(backend: Arc<dyn Backend>, state: ClientState, config: ClientConfig) -> Self {
        Self {
            backend,
            state: RwLock::new(state),
            notifier: Notifier::with_capacity(config.event_capacity),
            fetch_guard: Mutex::new(()),
            config,
        }
    }

    /// Connect to a backend with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Config` if the URL is malformed, its scheme is not
    /// handled by `connector`, or the backend cannot be reached.
    pub async fn initialize(backend_url: &str, connector: &dyn Connector) -> Result<Self> {
        Self::initialize_with_config(backend_url, connector, ClientConfig::default()).await
    }

    /// Connect to a backend.
    ///
    /// # Errors
    ///
    /// Same as [`initialize`](Self::initialize).
    pub async fn initialize_with_config(
        backend_url: &str,
        connector: &dyn Connector,
        config: ClientConfig,
    ) -> Result<Self> {
        let url = parse_backend_url(backend_url)?;
        let backend = connect(&url, connector).await?;
        info!(url = %url, device = %config.device_name, "Client initialized");
        Ok(Self::assemble(
            backend,
            ClientState::new(Session::new(url)),
            config,
        ))
    }

    /// Rebuild a client from a snapshot and reconnect to its backend.
    ///
    /// # Errors
    ///
    /// `CoreError::Corrupted` if the snapshot is inconsistent, otherwise as
    /// [`initialize`](Self::initialize).
    pub async fn resume(
        snapshot: StateSnapshot,
        connector: &dyn Connector,
        config: ClientConfig,
    ) -> Result<Self> {
        let url = parse_backend_url(&snapshot.backend_url)?;
        let registry = ConversationRegistry::from_conversations(snapshot.conversations)?;
        let backend = connect(&url, connector).await?;

        let mut state = ClientState::new(Session::restore(url, snapshot.user, snapshot.cursor));
        for id in registry.ids() {
            state.sync.track(id);
        }
        state.registry = registry;
        info!(
            conversations = state.registry.len(),
            cursor = state.session.cursor(),
            "Client resumed"
        );
        Ok(Self::assemble(backend, state, config))
    }

    /// Register a new user with the backend and make it the local identity.
    ///
    /// Registering again replaces the identity and forgets every conversation
    /// known under the previous one.
    ///
    /// # Errors
    ///
    /// - `CoreError::InvalidInput` if the username is malformed
    /// - `CoreError::DuplicateUser` if the username is taken
    /// - `CoreError::Network` if the backend call fails
    pub async fn create_user(&self, username: &str) -> Result<User> {
        validate_username(username).map_err(|e| CoreError::InvalidInput(e.to_string()))?;
        let record = self
            .backend
            .register_user(username, &self.config.device_name)
            .await?;
        let user = User::from(record);
        self.state.write().await.install_user(user.clone());
        info!(user = %user.username, client = %user.client_id, "User created");
        Ok(user)
    }

    /// Attach this client as another device of an existing user.
    ///
    /// The next fetch delivers every conversation the user belongs to.
    ///
    /// # Errors
    ///
    /// - `CoreError::UserNotFound` if the username is not registered
    /// - `CoreError::Network` if the backend call fails
    pub async fn login(&self, username: &str) -> Result<User> {
        validate_username(username).map_err(|e| CoreError::InvalidInput(e.to_string()))?;
        let record = self
            .backend
            .register_client(username, &self.config.device_name)
            .await?;
        let user = User::from(record);
        self.state.write().await.install_user(user.clone());
        info!(user = %user.username, client = %user.client_id, "Device linked");
        Ok(user)
    }

    /// Get the local user, if one is registered.
    pub async fn user(&self) -> Option<User> {
        self.state.read().await.session.user().cloned()
    }

    /// Get the backend URL.
    pub async fn backend_url(&self) -> Url {
        self.state.read().await.session.backend_url().clone()
    }

    /// Create a conversation with the local user as its only member.
    ///
    /// The conversation is registered with the backend before it is added
    /// locally; there are no local-only conversations.
    ///
    /// # Errors
    ///
    /// - `CoreError::InvalidInput` if the name is malformed
    /// - `CoreError::NoIdentity` before a user exists
    /// - `CoreError::Network` if the backend call fails
    pub async fn create_conversation(&self, name: &str) -> Result<ConversationId> {
        validate_conversation_name(name).map_err(|e| CoreError::InvalidInput(e.to_string()))?;
        let creator = {
            let state = self.state.read().await;
            state.session.require_user()?.username.clone()
        };

        let id = ConversationId::generate();
        self.backend
            .create_conversation(&creator, id.as_uuid(), name)
            .await?;

        let mut state = self.state.write().await;
        if state.registry.insert(Conversation::new(id, name, creator.clone())) {
            state.sync.track(id);
            self.notifier.emit(Event::ConversationCreated {
                conversation_id: id,
                name: name.to_string(),
                members: vec![creator],
            });
        }
        info!(conversation = %id, name = %name, "Conversation created");
        Ok(id)
    }

    /// Every known conversation, in the order it became known.
    pub async fn get_conversations(&self) -> Vec<ConversationSummary> {
        let state = self.state.read().await;
        let own = state.session.user().map(|u| u.username.as_str());
        state.registry.summaries(own)
    }

    /// Look up one conversation.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` for unknown ids.
    pub async fn conversation(&self, id: &ConversationId) -> Result<ConversationSummary> {
        let state = self.state.read().await;
        let own = state.session.user().map(|u| u.username.as_str());
        Ok(state.registry.get(id)?.summary(own))
    }

    /// Add a registered user to a conversation.
    ///
    /// # Errors
    ///
    /// - `CoreError::NotFound` if the conversation is unknown (checked before
    ///   any network call)
    /// - `CoreError::UserNotFound` if the username is not registered
    /// - `CoreError::Network` if the backend call fails
    pub async fn invite_user(
        &self,
        conversation_id: &ConversationId,
        username: &str,
    ) -> Result<()> {
        let inviter = {
            let state = self.state.read().await;
            let inviter = state.session.require_user()?.username.clone();
            state.registry.get(conversation_id)?;
            inviter
        };

        self.backend
            .invite_member(&inviter, conversation_id.as_uuid(), username)
            .await?;

        let mut state = self.state.write().await;
        if state.registry.add_member(conversation_id, username)? {
            self.notifier.emit(Event::MemberAdded {
                conversation_id: *conversation_id,
                username: username.to_string(),
            });
        }
        debug!(conversation = %conversation_id, user = %username, "User invited");
        Ok(())
    }

    /// Remove a member from a conversation. Removing yourself leaves it; the
    /// conversation stays in the local registry with its history.
    ///
    /// # Errors
    ///
    /// - `CoreError::NotFound` if the conversation is unknown (checked before
    ///   any network call)
    /// - `CoreError::NotMember` if the backend no longer counts us as a member
    /// - `CoreError::InvalidInput` when removing the last member
    /// - `CoreError::Network` if the backend call fails
    pub async fn remove_member(
        &self,
        conversation_id: &ConversationId,
        username: &str,
    ) -> Result<()> {
        let remover = {
            let state = self.state.read().await;
            let remover = state.session.require_user()?.username.clone();
            state.registry.get(conversation_id)?;
            remover
        };

        self.backend
            .remove_member(&remover, conversation_id.as_uuid(), username)
            .await?;

        let mut state = self.state.write().await;
        if state.registry.remove_member(conversation_id, username)? {
            self.notifier.emit(Event::MemberRemoved {
                conversation_id: *conversation_id,
                username: username.to_string(),
            });
        }
        debug!(conversation = %conversation_id, user = %username, "Member removed");
        Ok(())
    }

    /// Mark a conversation read up to `position`. The marker only moves
    /// forward and never past the newest message.
    ///
    /// Returns `true` if the marker moved.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` for unknown ids.
    pub async fn mark_as_read(
        &self,
        conversation_id: &ConversationId,
        position: u64,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        if !state.registry.mark_read(conversation_id, position)? {
            return Ok(false);
        }
        let position = state.registry.get(conversation_id)?.read_position();
        self.notifier.emit(Event::MarkedRead {
            conversation_id: *conversation_id,
            position,
        });
        Ok(true)
    }

    /// Messages from other users past the read marker.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` for unknown ids.
    pub async fn unread_count(&self, conversation_id: &ConversationId) -> Result<usize> {
        let state = self.state.read().await;
        let own = state.session.user().map(|u| u.username.as_str());
        Ok(state.registry.get(conversation_id)?.unread_count(own))
    }

    /// Up to `last_n` most recent messages, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` for unknown ids.
    pub async fn get_messages(
        &self,
        conversation_id: &ConversationId,
        last_n: usize,
    ) -> Result<Vec<Message>> {
        self.state.read().await.registry.messages(conversation_id, last_n)
    }

    /// Open a pollable event subscription.
    pub fn register_stream(&self) -> EventStream {
        self.notifier.register_stream()
    }

    /// Attach a callback subscriber. Must be called within a Tokio runtime.
    pub fn register_sink(&self, sink: impl EventSink) -> SubscriptionId {
        self.notifier.register_sink(sink)
    }

    /// Detach a callback subscriber.
    pub fn unregister_sink(&self, id: SubscriptionId) -> bool {
        self.notifier.unregister_sink(id)
    }

    /// Capture the persistent part of the client state.
    pub async fn snapshot(&self) -> StateSnapshot {
        let state = self.state.read().await;
        StateSnapshot::new(
            state.session.backend_url().as_str(),
            state.session.user().cloned(),
            state.session.cursor(),
            state.registry.conversations().to_vec(),
        )
    }

    /// Get client statistics.
    pub async fn stats(&self) -> ClientStats {
        let state = self.state.read().await;
        let registry = state.registry.stats();
        ClientStats {
            conversations: registry.conversation_count,
            members: registry.member_count,
            messages: registry.message_count,
            cursor: state.session.cursor(),
            subscribers: self.notifier.subscriber_count(),
            events_emitted: self.notifier.last_sequence(),
        }
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}
