//! The backend contract.
//!
//! The core talks to the messaging server only through [`Backend`].
//! [`MemoryBackend`] implements it in-process; `parley-transport` implements
//! it over WebSocket. [`dispatch`] serves protocol requests from any
//! implementation, which is how a server exposes one; a [`Peer`] binds a
//! connection to the identity it registered.

mod memory;
mod rpc;

pub use memory::{MemoryBackend, MemoryConnector, MEMORY_SCHEME};
pub use rpc::{dispatch, Peer};

use async_trait::async_trait;
use bytes::Bytes;
use parley_protocol::{ClientRecord, Delivery, ErrorCode, Receipt, Version};
use std::sync::Arc;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::error::CoreError;

/// Failures reported by a backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend refused the operation.
    #[error("Rejected ({code}): {message}")]
    Rejected { code: ErrorCode, message: String },

    /// The request never got an answer: connection lost, timeout, etc.
    #[error("Transport failure: {0}")]
    Transport(String),

    /// The backend answered with something that does not fit the request.
    #[error("Unexpected response: {0}")]
    Protocol(String),
}

impl BackendError {
    /// Create a rejection.
    #[must_use]
    pub fn rejected(code: ErrorCode, message: impl Into<String>) -> Self {
        BackendError::Rejected {
            code,
            message: message.into(),
        }
    }
}

impl From<BackendError> for CoreError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Rejected { code, message } => match code {
                ErrorCode::DuplicateUser => CoreError::DuplicateUser(message),
                ErrorCode::UnknownUser => CoreError::UserNotFound(message),
                ErrorCode::UnknownConversation => CoreError::NotFound(message),
                ErrorCode::NotMember => CoreError::NotMember(message),
                ErrorCode::BadRequest | ErrorCode::Forbidden => CoreError::InvalidInput(message),
                ErrorCode::Internal => {
                    CoreError::Network(format!("backend rejected request ({code}): {message}"))
                }
            },
            BackendError::Transport(message) | BackendError::Protocol(message) => {
                CoreError::Network(message)
            }
        }
    }
}

/// Operations the core needs from a messaging backend.
///
/// Implementations must be safe to call concurrently. Delivery is
/// at-least-once: `fetch_messages` may return entries the caller has
/// already seen.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Protocol version the backend speaks.
    async fn version(&self) -> Result<Version, BackendError>;

    /// Register a new username with its first device.
    async fn register_user(&self, username: &str, device: &str)
        -> Result<ClientRecord, BackendError>;

    /// Register another device for an existing username.
    async fn register_client(
        &self,
        username: &str,
        device: &str,
    ) -> Result<ClientRecord, BackendError>;

    /// Create a conversation with `creator` as sole member.
    async fn create_conversation(
        &self,
        creator: &str,
        conversation_id: Uuid,
        name: &str,
    ) -> Result<(), BackendError>;

    /// Add `username` to a conversation.
    async fn invite_member(
        &self,
        inviter: &str,
        conversation_id: Uuid,
        username: &str,
    ) -> Result<(), BackendError>;

    /// Remove `username` from a conversation. Removing a non-member is a
    /// no-op; removing the last member is refused.
    async fn remove_member(
        &self,
        remover: &str,
        conversation_id: Uuid,
        username: &str,
    ) -> Result<(), BackendError>;

    /// Post a message; returns the acknowledgment.
    async fn send_message(
        &self,
        sender: &str,
        conversation_id: Uuid,
        payload: Bytes,
    ) -> Result<Receipt, BackendError>;

    /// Read the device queue past `after`, in cursor order.
    async fn fetch_messages(
        &self,
        client_id: &str,
        after: u64,
    ) -> Result<Vec<Delivery>, BackendError>;

    /// Every device registered for `username`.
    async fn list_clients(&self, username: &str) -> Result<Vec<ClientRecord>, BackendError>;
}

/// Opens a [`Backend`] for a URL.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Whether this connector handles the URL's scheme.
    fn supports(&self, url: &Url) -> bool;

    /// Establish the backend connection.
    async fn connect(&self, url: &Url) -> Result<Arc<dyn Backend>, BackendError>;
}
