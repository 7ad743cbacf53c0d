//! # parley-core
//!
//! Client-side core of the Parley messaging system.
//!
//! This crate provides:
//!
//! - **Session** - Backend endpoint, local identity and delivery cursor
//! - **Registry** - Known conversations with their members and history
//! - **Sync** - Backend calls and idempotent merge of fetched deliveries
//! - **Notifier** - Broadcast of every state change to subscribers
//! - **Bridge** - Port-correlated calls for a host runtime
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Host call  │────▶│   Client    │────▶│   Backend   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │  result applied under the state lock
//!                            ▼
//!                     ┌─────────────┐     ┌─────────────┐
//!                     │  Registry   │────▶│  Notifier   │
//!                     └─────────────┘     └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use parley_core::{Client, MemoryBackend, MemoryConnector};
//!
//! # #[tokio::main]
//! # async fn main() -> parley_core::Result<()> {
//! let connector = MemoryConnector::new(Arc::new(MemoryBackend::new()));
//! let client = Client::initialize("memory://local", &connector).await?;
//! client.create_user("alice").await?;
//!
//! let team = client.create_conversation("team").await?;
//! client.send_message(&team, "hello").await?;
//!
//! let history = client.get_messages(&team, 10).await?;
//! assert_eq!(history[0].text(), Some("hello"));
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod bridge;
pub mod client;
pub mod config;
pub mod conversation;
pub mod error;
pub mod identity;
pub mod message;
pub mod notifier;
pub mod registry;
pub mod snapshot;
pub mod sync;

pub use backend::{Backend, BackendError, Connector, MemoryBackend, MemoryConnector};
pub use bridge::{
    ClientHandle, Completion, HostBridge, HostError, HostReply, HostRequest, HostSink, Port,
};
pub use client::{Client, ClientStats};
pub use config::ClientConfig;
pub use conversation::{Conversation, ConversationId, ConversationSummary};
pub use error::{CoreError, ErrorKind, Result};
pub use identity::{Session, User};
pub use message::{Message, MessageId};
pub use notifier::{Event, EventEnvelope, EventSink, EventStream, Notifier, StreamError};
pub use registry::{ConversationRegistry, RegistryStats};
pub use snapshot::StateSnapshot;
pub use sync::{FetchOutcome, FetchReport, FetchState, SyncStatus};
