//! [`Backend`] over a WebSocket connection.
//!
//! After the `Hello` / `Accepted` exchange the connection is split: a writer
//! task drains an outgoing queue and a reader task routes each `Response` to
//! the caller waiting on its request id. Any number of requests can be in
//! flight at once.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parley_core::{Backend, BackendError, Connector};
use parley_protocol::{
    codec, ClientRecord, Delivery, Frame, Receipt, Request, Response, Version, PROTOCOL_VERSION,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};
use url::Url;
use uuid::Uuid;

use crate::traits::{Connection, TransportError};
use crate::websocket::{self, absorb, WebSocketConfig};

/// Callers waiting for a response, by request id.
type Pending = Arc<DashMap<u64, oneshot::Sender<Response>>>;

/// A backend reached over WebSocket.
pub struct RemoteBackend {
    outgoing: mpsc::UnboundedSender<Bytes>,
    pending: Pending,
    next_id: AtomicU64,
    open: Arc<AtomicBool>,
    version: Version,
    server: String,
    request_timeout: Duration,
    tasks: Vec<AbortHandle>,
}

impl RemoteBackend {
    /// Connect and perform the protocol handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails, the backend does not answer
    /// `Hello` in time, or answers with anything but `Accepted`.
    pub async fn connect(url: &Url, config: &WebSocketConfig) -> Result<Self, TransportError> {
        let mut conn = websocket::connect(url, config).await?;
        conn.send(Frame::hello(PROTOCOL_VERSION)).await?;

        let (version, server) = match tokio::time::timeout(config.connect_timeout, conn.recv())
            .await
            .map_err(|_| TransportError::Timeout)??
        {
            Some(Frame::Accepted { version, server }) => (version, server),
            Some(other) => {
                return Err(TransportError::Handshake(format!(
                    "expected accepted, got {:?}",
                    other.frame_type()
                )))
            }
            None => return Err(TransportError::ConnectionClosed),
        };
        info!(url = %url, server = %server, version = %version, "Backend handshake complete");

        let connection = conn.id().clone();
        let (stream, buffer) = conn.into_parts();
        let (mut sink, mut source) = stream.split();
        let (outgoing, mut queue) = mpsc::unbounded_channel::<Bytes>();
        let pending: Pending = Arc::new(DashMap::new());
        let open = Arc::new(AtomicBool::new(true));

        let writer = {
            let open = Arc::clone(&open);
            let connection = connection.clone();
            tokio::spawn(async move {
                while let Some(data) = queue.recv().await {
                    if let Err(e) = sink.send(Message::Binary(data.to_vec())).await {
                        warn!(connection = %connection, error = %e, "Send failed");
                        break;
                    }
                }
                open.store(false, Ordering::SeqCst);
                let _ = sink.close().await;
            })
        };

        let reader = {
            let open = Arc::clone(&open);
            let pending = Arc::clone(&pending);
            let outgoing = outgoing.clone();
            let max_message_size = config.max_message_size;
            tokio::spawn(async move {
                let mut buffer: BytesMut = buffer;
                'read: loop {
                    loop {
                        match codec::decode_from(&mut buffer) {
                            Ok(Some(frame)) => route(frame, &pending, &outgoing),
                            Ok(None) => break,
                            Err(e) => {
                                warn!(connection = %connection, error = %e, "Undecodable frame");
                                break 'read;
                            }
                        }
                    }
                    match source.next().await {
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(message)) => {
                            if let Err(e) = absorb(&mut buffer, &message, max_message_size) {
                                warn!(connection = %connection, error = %e, "Dropping connection");
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(connection = %connection, error = %e, "Receive failed");
                            break;
                        }
                    }
                }
                debug!(
                    connection = %connection,
                    waiting = pending.len(),
                    "Backend connection closed"
                );
                open.store(false, Ordering::SeqCst);
                // Dropping the senders fails every waiting request.
                pending.clear();
            })
        };

        Ok(Self {
            outgoing,
            pending,
            next_id: AtomicU64::new(1),
            open,
            version,
            server,
            request_timeout: config.request_timeout,
            tasks: vec![writer.abort_handle(), reader.abort_handle()],
        })
    }

    /// Server identification sent during the handshake.
    #[must_use]
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Check if the connection is still usable.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Number of requests waiting for a response.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Send a request and wait for its response.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Timeout` if no response arrives within the
    /// request timeout and `TransportError::ConnectionClosed` if the
    /// connection is gone.
    pub async fn call(&self, request: Request) -> Result<Response, TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let kind = request.kind();
        let data = codec::encode(&Frame::request(id, request))?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        if self.outgoing.send(data).is_err() {
            self.pending.remove(&id);
            return Err(TransportError::ConnectionClosed);
        }
        trace!(request = kind, id, "Request sent");

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => {
                self.pending.remove(&id);
                warn!(request = kind, id, "Request timed out");
                Err(TransportError::Timeout)
            }
        }
    }

    async fn call_backend(&self, request: Request) -> Result<Response, BackendError> {
        match self.call(request).await? {
            Response::Error { code, message } => Err(BackendError::Rejected { code, message }),
            response => Ok(response),
        }
    }
}

/// Hand an incoming frame to whoever waits for it.
fn route(frame: Frame, pending: &Pending, outgoing: &mpsc::UnboundedSender<Bytes>) {
    match frame {
        Frame::Response { id, response } => match pending.remove(&id) {
            Some((_, waiter)) => {
                // The caller may have given up; nothing to do then.
                let _ = waiter.send(response);
            }
            None => debug!(id, "Response for unknown request"),
        },
        Frame::Ping { timestamp } => {
            if let Ok(data) = codec::encode(&Frame::pong(timestamp)) {
                let _ = outgoing.send(data);
            }
        }
        other => trace!(frame = ?other.frame_type(), "Ignoring frame"),
    }
}

impl Drop for RemoteBackend {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn unexpected(response: &Response) -> BackendError {
    BackendError::Protocol(format!("unexpected response {response:?}"))
}

#[async_trait]
impl Backend for RemoteBackend {
    async fn version(&self) -> Result<Version, BackendError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed.into());
        }
        Ok(self.version)
    }

    async fn register_user(
        &self,
        username: &str,
        device: &str,
    ) -> Result<ClientRecord, BackendError> {
        let request = Request::RegisterUser {
            username: username.to_string(),
            device: device.to_string(),
        };
        match self.call_backend(request).await? {
            Response::Registered { client } => Ok(client),
            other => Err(unexpected(&other)),
        }
    }

    async fn register_client(
        &self,
        username: &str,
        device: &str,
    ) -> Result<ClientRecord, BackendError> {
        let request = Request::RegisterClient {
            username: username.to_string(),
            device: device.to_string(),
        };
        match self.call_backend(request).await? {
            Response::Registered { client } => Ok(client),
            other => Err(unexpected(&other)),
        }
    }

    async fn create_conversation(
        &self,
        creator: &str,
        conversation_id: Uuid,
        name: &str,
    ) -> Result<(), BackendError> {
        let request = Request::CreateConversation {
            creator: creator.to_string(),
            conversation_id,
            name: name.to_string(),
        };
        match self.call_backend(request).await? {
            Response::Done => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn invite_member(
        &self,
        inviter: &str,
        conversation_id: Uuid,
        username: &str,
    ) -> Result<(), BackendError> {
        let request = Request::InviteMember {
            inviter: inviter.to_string(),
            conversation_id,
            username: username.to_string(),
        };
        match self.call_backend(request).await? {
            Response::Done => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn remove_member(
        &self,
        remover: &str,
        conversation_id: Uuid,
        username: &str,
    ) -> Result<(), BackendError> {
        let request = Request::RemoveMember {
            remover: remover.to_string(),
            conversation_id,
            username: username.to_string(),
        };
        match self.call_backend(request).await? {
            Response::Done => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn send_message(
        &self,
        sender: &str,
        conversation_id: Uuid,
        payload: Bytes,
    ) -> Result<Receipt, BackendError> {
        let request = Request::SendMessage {
            sender: sender.to_string(),
            conversation_id,
            payload: payload.to_vec(),
        };
        match self.call_backend(request).await? {
            Response::Accepted { receipt } => Ok(receipt),
            other => Err(unexpected(&other)),
        }
    }

    async fn fetch_messages(
        &self,
        client_id: &str,
        after: u64,
    ) -> Result<Vec<Delivery>, BackendError> {
        let request = Request::FetchMessages {
            client_id: client_id.to_string(),
            after,
        };
        match self.call_backend(request).await? {
            Response::Deliveries { deliveries } => Ok(deliveries),
            other => Err(unexpected(&other)),
        }
    }

    async fn list_clients(&self, username: &str) -> Result<Vec<ClientRecord>, BackendError> {
        let request = Request::ListClients {
            username: username.to_string(),
        };
        match self.call_backend(request).await? {
            Response::Clients { clients } => Ok(clients),
            other => Err(unexpected(&other)),
        }
    }
}

/// Opens [`RemoteBackend`]s for `ws://` and `wss://` URLs.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector {
    config: WebSocketConfig,
}

impl WebSocketConnector {
    /// Create a connector with the given configuration.
    #[must_use]
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    fn supports(&self, url: &Url) -> bool {
        matches!(url.scheme(), "ws" | "wss")
    }

    async fn connect(&self, url: &Url) -> Result<Arc<dyn Backend>, BackendError> {
        let backend = RemoteBackend::connect(url, &self.config).await?;
        Ok(Arc::new(backend))
    }
}
