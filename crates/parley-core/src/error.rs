//! Error types for the client core.

use serde::Serialize;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced by client operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Backend URL malformed or unreachable on first contact.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport or backend failure. Retrying may succeed.
    #[error("Network error: {0}")]
    Network(String),

    /// Unknown conversation.
    #[error("Conversation not found: {0}")]
    NotFound(String),

    /// Username not registered with the backend.
    #[error("User not found: {0}")]
    UserNotFound(String),

    /// The local user is not a member of the conversation it acted on.
    #[error("Not a member: {0}")]
    NotMember(String),

    /// Username already registered.
    #[error("Username already taken: {0}")]
    DuplicateUser(String),

    /// Malformed bytes at the host boundary, e.g. a UUID that is not 16 bytes.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Argument rejected before any network traffic.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation needs a local user and none is registered yet.
    #[error("No local user; create or log in a user first")]
    NoIdentity,

    /// Reading or writing a state snapshot failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Local state violates an invariant and cannot be trusted.
    #[error("Local state corrupted: {0}")]
    Corrupted(String),
}

/// Stable classification of [`CoreError`] for host-facing results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    Config,
    Network,
    NotFound,
    UserNotFound,
    NotMember,
    DuplicateUser,
    Decode,
    InvalidInput,
    NoIdentity,
    Storage,
    Corrupted,
}

impl ErrorKind {
    /// Name used in host-facing error payloads.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "ConfigError",
            ErrorKind::Network => "NetworkError",
            ErrorKind::NotFound => "NotFoundError",
            ErrorKind::UserNotFound => "UserNotFoundError",
            ErrorKind::NotMember => "NotMemberError",
            ErrorKind::DuplicateUser => "DuplicateUserError",
            ErrorKind::Decode => "DecodeError",
            ErrorKind::InvalidInput => "InvalidInputError",
            ErrorKind::NoIdentity => "NoIdentityError",
            ErrorKind::Storage => "StorageError",
            ErrorKind::Corrupted => "CorruptedStateError",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CoreError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Config(_) => ErrorKind::Config,
            CoreError::Network(_) => ErrorKind::Network,
            CoreError::NotFound(_) => ErrorKind::NotFound,
            CoreError::UserNotFound(_) => ErrorKind::UserNotFound,
            CoreError::NotMember(_) => ErrorKind::NotMember,
            CoreError::DuplicateUser(_) => ErrorKind::DuplicateUser,
            CoreError::Decode(_) => ErrorKind::Decode,
            CoreError::InvalidInput(_) => ErrorKind::InvalidInput,
            CoreError::NoIdentity => ErrorKind::NoIdentity,
            CoreError::Storage(_) => ErrorKind::Storage,
            CoreError::Corrupted(_) => ErrorKind::Corrupted,
        }
    }

    /// Whether the caller may retry the same call unchanged.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Network(_))
    }

    /// Whether the client must be discarded.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::Corrupted(_))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Storage(e.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Storage(e.to_string())
    }
}
