//! # parley-transport
//!
//! WebSocket access to a Parley backend.
//!
//! [`RemoteBackend`] implements the core's [`Backend`](parley_core::Backend)
//! trait by sending `parley-protocol` frames over a WebSocket. Requests are
//! tagged with an id and may overlap; each response is routed back to its
//! caller. [`WebSocketConnector`] plugs it into
//! [`Client::initialize`](parley_core::Client::initialize) for `ws://` and
//! `wss://` URLs.
//!
//! ```rust,ignore
//! use parley_core::Client;
//! use parley_transport::WebSocketConnector;
//!
//! let connector = WebSocketConnector::default();
//! let client = Client::initialize("ws://127.0.0.1:8080/ws", &connector).await?;
//! client.create_user("alice").await?;
//! ```

pub mod remote;
pub mod traits;
pub mod websocket;

pub use remote::{RemoteBackend, WebSocketConnector};
pub use traits::{Connection, ConnectionId, TransportError};
pub use websocket::{WebSocketConfig, WebSocketConnection};
