//! Host bridge.
//!
//! Lets a host runtime drive a [`Client`] with plain byte arguments. Each
//! call carries a caller-chosen [`Port`] and resolves exactly once through
//! [`HostSink::complete`]. Calls run as runtime tasks: a host that stops
//! waiting does not cancel the operation, and its result is still applied.
//! Event feeds are pushed to the host through [`HostSink::deliver`].

use parley_protocol::ClientRecord;
use serde::Serialize;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::client::Client;
use crate::conversation::{ConversationId, ConversationSummary};
use crate::error::{CoreError, ErrorKind};
use crate::identity::User;
use crate::message::Message;
use crate::notifier::{EventEnvelope, EventSink, SubscriptionId};
use crate::sync::FetchReport;

/// Caller-supplied token correlating a call with its completion.
pub type Port = i64;

/// Reference-counted client handle.
///
/// Clones share the client. The client is dropped, and its event feeds
/// closed, when the last handle is released.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    client: Arc<Client>,
}

impl ClientHandle {
    /// Wrap a client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client: Arc::new(client),
        }
    }

    /// Get the client.
    #[must_use]
    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// Number of live handles, including in-flight calls.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.client)
    }

    /// Release this handle.
    ///
    /// Returns `true` if it was the last one and the client is gone.
    pub fn release(self) -> bool {
        let last = Arc::into_inner(self.client).is_some();
        debug!(last, "Client handle released");
        last
    }
}

/// A call from the host. Strings are UTF-8 bytes, ids are 16 raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostRequest {
    CreateUser { username: Vec<u8> },
    Login { username: Vec<u8> },
    CreateConversation { name: Vec<u8> },
    GetConversations,
    InviteUser { conversation_id: Vec<u8>, username: Vec<u8> },
    RemoveMember { conversation_id: Vec<u8>, username: Vec<u8> },
    MarkAsRead { conversation_id: Vec<u8>, position: u64 },
    UnreadCount { conversation_id: Vec<u8> },
    GetMessages { conversation_id: Vec<u8>, last_n: u64 },
    SendMessage { conversation_id: Vec<u8>, payload: Vec<u8> },
    GetClients,
    FetchMessages,
}

impl HostRequest {
    /// Short operation name for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            HostRequest::CreateUser { .. } => "create_user",
            HostRequest::Login { .. } => "login",
            HostRequest::CreateConversation { .. } => "create_conversation",
            HostRequest::GetConversations => "get_conversations",
            HostRequest::InviteUser { .. } => "invite_user",
            HostRequest::RemoveMember { .. } => "remove_member",
            HostRequest::MarkAsRead { .. } => "mark_as_read",
            HostRequest::UnreadCount { .. } => "unread_count",
            HostRequest::GetMessages { .. } => "get_messages",
            HostRequest::SendMessage { .. } => "send_message",
            HostRequest::GetClients => "get_clients",
            HostRequest::FetchMessages => "fetch_messages",
        }
    }
}

/// Successful result of a host call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum HostReply {
    User(User),
    ConversationId([u8; 16]),
    Conversations(Vec<ConversationSummary>),
    Messages(Vec<Message>),
    Message(Message),
    Clients(Vec<ClientRecord>),
    Fetched(FetchReport),
    /// Whether a flag-returning call changed anything.
    Changed(bool),
    Count(u64),
    Done,
}

/// Structured failure handed to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<CoreError> for HostError {
    fn from(e: CoreError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// The single result for a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub port: Port,
    pub outcome: Result<HostReply, HostError>,
}

/// Receives completions and event feeds on behalf of the host.
pub trait HostSink: Send + Sync + 'static {
    /// Called exactly once per dispatched call.
    fn complete(&self, completion: Completion);

    /// Push an event on a feed. Return `false` once the host no longer
    /// listens on `port`; the feed is then closed.
    fn deliver(&self, port: Port, envelope: &EventEnvelope) -> bool;

    /// Events dropped on a feed because the host fell behind.
    fn missed(&self, port: Port, count: u64) -> bool {
        let _ = (port, count);
        true
    }
}

struct PortFeed {
    port: Port,
    sink: Arc<dyn HostSink>,
}

impl EventSink for PortFeed {
    fn deliver(&self, envelope: &EventEnvelope) -> bool {
        self.sink.deliver(self.port, envelope)
    }

    fn missed(&self, count: u64) -> bool {
        self.sink.missed(self.port, count)
    }
}

fn decode_text(field: &str, bytes: Vec<u8>) -> Result<String, CoreError> {
    String::from_utf8(bytes).map_err(|e| CoreError::Decode(format!("{field} is not UTF-8: {e}")))
}

/// Run one host call against a client.
async fn execute(client: &Client, request: HostRequest) -> Result<HostReply, CoreError> {
    match request {
        HostRequest::CreateUser { username } => {
            let username = decode_text("username", username)?;
            client.create_user(&username).await.map(HostReply::User)
        }
        HostRequest::Login { username } => {
            let username = decode_text("username", username)?;
            client.login(&username).await.map(HostReply::User)
        }
        HostRequest::CreateConversation { name } => {
            let name = decode_text("name", name)?;
            let id = client.create_conversation(&name).await?;
            Ok(HostReply::ConversationId(id.to_bytes()))
        }
        HostRequest::GetConversations => {
            Ok(HostReply::Conversations(client.get_conversations().await))
        }
        HostRequest::InviteUser {
            conversation_id,
            username,
        } => {
            let id = ConversationId::from_bytes(&conversation_id)?;
            let username = decode_text("username", username)?;
            client.invite_user(&id, &username).await?;
            Ok(HostReply::Done)
        }
        HostRequest::RemoveMember {
            conversation_id,
            username,
        } => {
            let id = ConversationId::from_bytes(&conversation_id)?;
            let username = decode_text("username", username)?;
            client.remove_member(&id, &username).await?;
            Ok(HostReply::Done)
        }
        HostRequest::MarkAsRead {
            conversation_id,
            position,
        } => {
            let id = ConversationId::from_bytes(&conversation_id)?;
            client.mark_as_read(&id, position).await.map(HostReply::Changed)
        }
        HostRequest::UnreadCount { conversation_id } => {
            let id = ConversationId::from_bytes(&conversation_id)?;
            let count = client.unread_count(&id).await?;
            Ok(HostReply::Count(count as u64))
        }
        HostRequest::GetMessages {
            conversation_id,
            last_n,
        } => {
            let id = ConversationId::from_bytes(&conversation_id)?;
            let last_n = usize::try_from(last_n).unwrap_or(usize::MAX);
            client.get_messages(&id, last_n).await.map(HostReply::Messages)
        }
        HostRequest::SendMessage {
            conversation_id,
            payload,
        } => {
            let id = ConversationId::from_bytes(&conversation_id)?;
            client.send_message(&id, payload).await.map(HostReply::Message)
        }
        HostRequest::GetClients => client.get_clients().await.map(HostReply::Clients),
        HostRequest::FetchMessages => client.fetch_messages().await.map(HostReply::Fetched),
    }
}

/// Dispatches host calls onto a Tokio runtime.
pub struct HostBridge {
    handle: ClientHandle,
    sink: Arc<dyn HostSink>,
    runtime: Handle,
}

impl HostBridge {
    /// Create a bridge running calls on `runtime`.
    #[must_use]
    pub fn new(handle: ClientHandle, sink: Arc<dyn HostSink>, runtime: Handle) -> Self {
        Self {
            handle,
            sink,
            runtime,
        }
    }

    /// Get the client handle.
    #[must_use]
    pub fn handle(&self) -> &ClientHandle {
        &self.handle
    }

    /// Start a call. Its result arrives through [`HostSink::complete`] with
    /// the same `port`.
    pub fn dispatch(&self, port: Port, request: HostRequest) -> JoinHandle<()> {
        let client = Arc::clone(self.handle.client());
        let sink = Arc::clone(&self.sink);
        trace!(port, request = request.kind(), "Host call dispatched");
        self.runtime.spawn(async move {
            let kind = request.kind();
            let outcome = execute(&client, request).await.map_err(HostError::from);
            if let Err(e) = &outcome {
                debug!(port, request = kind, kind = %e.kind, "Host call failed");
            }
            sink.complete(Completion { port, outcome });
        })
    }

    /// Open an event feed delivered on `port`.
    pub fn open_stream(&self, port: Port) -> SubscriptionId {
        let _guard = self.runtime.enter();
        let id = self.handle.client().register_sink(PortFeed {
            port,
            sink: Arc::clone(&self.sink),
        });
        debug!(port, subscription = id, "Host event feed opened");
        id
    }

    /// Close an event feed.
    pub fn close_stream(&self, id: SubscriptionId) -> bool {
        self.handle.client().unregister_sink(id)
    }
}
