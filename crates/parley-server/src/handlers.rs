//! Connection handlers for the Parley server.
//!
//! Every connection opens with `Hello` / `Accepted`; after that each
//! `Request` frame is dispatched against the shared backend and answered with
//! a `Response` carrying the same id. A connection acts only for the
//! identity it registered.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parley_core::backend::Peer;
use parley_core::MemoryBackend;
use parley_protocol::{codec, Frame, PROTOCOL_VERSION};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Room for the frame header and request fields around a payload.
const FRAME_OVERHEAD: usize = 4096;

type Sender = SplitSink<WebSocket, Message>;

/// Shared server state.
pub struct AppState {
    /// The backend every connection talks to.
    pub backend: Arc<MemoryBackend>,
    /// Server configuration.
    pub config: Config,
    connections: AtomicUsize,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            backend: Arc::new(MemoryBackend::with_max_message_size(
                config.limits.max_message_size,
            )),
            config,
            connections: AtomicUsize::new(0),
        }
    }

    /// Number of open WebSocket connections.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    fn try_acquire(self: &Arc<Self>) -> Option<ConnectionSlot> {
        let limit = self.config.limits.max_connections;
        self.connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            })
            .ok()
            .map(|_| ConnectionSlot(Arc::clone(self)))
    }
}

/// Holds one unit of the connection limit until dropped.
struct ConnectionSlot(Arc<AppState>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.connections.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to bind or stops abnormally.
pub async fn run_server(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Parley server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, config.websocket_path);

    let state = Arc::new(AppState::new(config));
    axum::serve(listener, app(state)).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION.to_string(),
        "connections": state.connection_count(),
        "users": state.backend.user_count(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let Some(slot) = state.try_acquire() else {
        warn!(
            limit = state.config.limits.max_connections,
            "Connection limit reached"
        );
        metrics::record_rejected_connection();
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    let max_frame = state.config.limits.max_message_size + FRAME_OVERHEAD;
    ws.max_message_size(max_frame)
        .on_upgrade(move |socket| handle_websocket(socket, state, slot))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, _slot: ConnectionSlot) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let (mut sender, mut receiver) = socket.split();

    let mut read_buffer = BytesMut::with_capacity(4096);
    let mut greeted = false;
    let mut peer = Peer::new();

    debug!("WebSocket connected");

    'conn: while let Some(msg) = receiver.next().await {
        let data = match msg {
            Ok(Message::Binary(data)) => data,
            // For compatibility, treat text as binary
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Ping(data)) => {
                if sender.send(Message::Pong(data)).await.is_err() {
                    break;
                }
                continue;
            }
            Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => {
                debug!("Received close frame");
                break;
            }
            Err(e) => {
                warn!(error = %e, "WebSocket error");
                metrics::record_error("websocket");
                break;
            }
        };

        metrics::record_bytes(data.len(), "inbound");
        read_buffer.extend_from_slice(&data);

        loop {
            let frame = match codec::decode_from(&mut read_buffer) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Undecodable frame");
                    metrics::record_error("decode");
                    break 'conn;
                }
            };

            let result = if greeted {
                handle_frame(frame, &state, &mut peer, &mut sender).await
            } else {
                greet(frame, &mut sender).await.map(|ok| {
                    greeted = ok;
                    ok
                })
            };

            match result {
                Ok(true) => {}
                Ok(false) => break 'conn,
                Err(e) => {
                    error!(error = %e, "Frame handling error");
                    break 'conn;
                }
            }
        }
    }

    let _ = sender.close().await;
    debug!(
        client = peer.identity().map_or("-", |c| c.client_id.as_str()),
        "WebSocket disconnected"
    );
}

/// Answer the opening `Hello`.
///
/// Returns `false` when the connection must be dropped.
async fn greet(frame: Frame, sender: &mut Sender) -> Result<bool> {
    let Frame::Hello { version } = frame else {
        warn!(frame_type = ?frame.frame_type(), "Expected hello");
        return Ok(false);
    };

    match PROTOCOL_VERSION.negotiate(&version) {
        Some(agreed) => {
            debug!(client = %version, agreed = %agreed, "Handshake");
            let server = format!("parley-server/{}", env!("CARGO_PKG_VERSION"));
            send_frame(sender, &Frame::accepted(agreed, server)).await?;
            Ok(true)
        }
        None => {
            warn!(client = %version, server = %PROTOCOL_VERSION, "Incompatible protocol version");
            metrics::record_error("version");
            Ok(false)
        }
    }
}

/// Handle a frame after the handshake.
///
/// Returns `false` when the connection must be dropped.
async fn handle_frame(
    frame: Frame,
    state: &Arc<AppState>,
    peer: &mut Peer,
    sender: &mut Sender,
) -> Result<bool> {
    match frame {
        Frame::Request { id, request } => {
            let kind = request.kind();
            let start = Instant::now();
            let response = peer.dispatch(state.backend.as_ref(), request).await;
            metrics::record_request(kind, !response.is_error(), start.elapsed().as_secs_f64());
            send_frame(sender, &Frame::response(id, response)).await?;
        }
        Frame::Ping { timestamp } => {
            send_frame(sender, &Frame::pong(timestamp)).await?;
        }
        Frame::Pong { .. } => {}
        other => {
            warn!(frame_type = ?other.frame_type(), "Unexpected frame type");
            return Ok(false);
        }
    }
    Ok(true)
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut Sender, frame: &Frame) -> Result<()> {
    let data = codec::encode(frame)?;
    metrics::record_bytes(data.len(), "outbound");
    sender.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::backend::{Backend, BackendError};
    use parley_core::{Client, ErrorKind};
    use parley_protocol::ErrorCode;
    use parley_transport::{RemoteBackend, WebSocketConfig, WebSocketConnector};
    use url::Url;

    async fn spawn(config: Config) -> (Arc<AppState>, Url) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let path = config.websocket_path.clone();
        let state = Arc::new(AppState::new(config));
        let router = app(Arc::clone(&state));
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (state, Url::parse(&format!("ws://{addr}{path}")).unwrap())
    }

    #[tokio::test]
    async fn test_clients_talk_through_server() {
        let (state, url) = spawn(Config::default()).await;
        let connector = WebSocketConnector::default();

        let alice = Client::initialize(url.as_str(), &connector).await.unwrap();
        let bob = Client::initialize(url.as_str(), &connector).await.unwrap();
        alice.create_user("alice").await.unwrap();
        bob.create_user("bob").await.unwrap();
        assert_eq!(state.backend.user_count(), 2);

        let team = alice.create_conversation("team").await.unwrap();
        alice.invite_user(&team, "bob").await.unwrap();
        alice.send_message(&team, "hello bob").await.unwrap();

        bob.fetch_messages().await.unwrap();
        let history = bob.get_messages(&team, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].text(), Some("hello bob"));

        let err = alice.invite_user(&team, "carol").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UserNotFound);
    }

    fn forbidden<T: std::fmt::Debug>(result: std::result::Result<T, BackendError>) -> bool {
        matches!(
            result,
            Err(BackendError::Rejected {
                code: ErrorCode::Forbidden,
                ..
            })
        )
    }

    #[tokio::test]
    async fn test_connection_acts_only_for_its_identity() {
        let (_state, url) = spawn(Config::default()).await;
        let connector = WebSocketConnector::default();
        let alice = Client::initialize(url.as_str(), &connector).await.unwrap();
        alice.create_user("alice").await.unwrap();
        let team = alice.create_conversation("team").await.unwrap();

        // A connection that never registered cannot read or act for alice.
        let anonymous = RemoteBackend::connect(&url, &WebSocketConfig::default())
            .await
            .unwrap();
        assert!(forbidden(anonymous.fetch_messages("alice#1", 0).await));
        assert!(forbidden(anonymous.list_clients("alice").await));
        assert!(forbidden(
            anonymous
                .send_message("alice", team.as_uuid(), "spoofed".into())
                .await
        ));

        // Registering binds mallory, not alice.
        let mallory = RemoteBackend::connect(&url, &WebSocketConfig::default())
            .await
            .unwrap();
        let record = mallory.register_user("mallory", "laptop").await.unwrap();
        assert!(mallory.fetch_messages(&record.client_id, 0).await.is_ok());
        assert!(forbidden(mallory.fetch_messages("alice#1", 0).await));
        assert!(forbidden(
            mallory
                .invite_member("alice", team.as_uuid(), "mallory")
                .await
        ));

        assert!(alice.get_messages(&team, 10).await.unwrap().is_empty());
        assert_eq!(alice.conversation(&team).await.unwrap().members, ["alice"]);
        assert!(alice.fetch_messages().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_handshake_reports_server() {
        let (_state, url) = spawn(Config::default()).await;
        let remote = RemoteBackend::connect(&url, &WebSocketConfig::default())
            .await
            .unwrap();
        assert!(remote.server().starts_with("parley-server/"));
        assert!(remote.is_open());
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let mut config = Config::default();
        config.limits.max_connections = 1;
        let (state, url) = spawn(config).await;

        let first = RemoteBackend::connect(&url, &WebSocketConfig::default())
            .await
            .unwrap();
        assert_eq!(state.connection_count(), 1);

        let second = RemoteBackend::connect(&url, &WebSocketConfig::default()).await;
        assert!(second.is_err());

        drop(first);
        for _ in 0..50 {
            if state.connection_count() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(state.connection_count(), 0);
        RemoteBackend::connect(&url, &WebSocketConfig::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_oversized_payload_is_rejected_by_backend() {
        let mut config = Config::default();
        config.limits.max_message_size = 16;
        let (_state, url) = spawn(config).await;
        let connector = WebSocketConnector::default();

        let client = Client::initialize(url.as_str(), &connector).await.unwrap();
        client.create_user("alice").await.unwrap();
        let team = client.create_conversation("team").await.unwrap();

        client.send_message(&team, vec![0u8; 16]).await.unwrap();
        let err = client.send_message(&team, vec![0u8; 17]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(client.get_messages(&team, 10).await.unwrap().len(), 1);
    }
}
