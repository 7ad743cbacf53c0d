//! Identity and session store.
//!
//! Holds the backend endpoint, the local user (once registered) and the
//! position reached in this device's delivery queue.

use parley_protocol::ClientRecord;
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use crate::error::{CoreError, Result};

/// Maximum username length.
pub const MAX_USERNAME_LENGTH: usize = 64;

/// Validate a username.
///
/// Usernames are ASCII letters, digits, `_`, `-` and `.`.
///
/// # Errors
///
/// Returns an error message if the username is invalid.
pub fn validate_username(username: &str) -> std::result::Result<(), &'static str> {
    if username.is_empty() {
        return Err("Username cannot be empty");
    }
    if username.len() > MAX_USERNAME_LENGTH {
        return Err("Username too long");
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err("Username contains invalid characters");
    }
    Ok(())
}

/// Parse and sanity-check a backend URL.
///
/// # Errors
///
/// Returns `CoreError::Config` if the URL is malformed or has no host.
pub fn parse_backend_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|e| CoreError::Config(format!("invalid backend URL {raw:?}: {e}")))?;
    if url.cannot_be_a_base() || url.host_str().map_or(true, str::is_empty) {
        return Err(CoreError::Config(format!("backend URL {raw:?} has no host")));
    }
    Ok(url)
}

/// The local user: a username plus the device this client registered as.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    /// Identifier and display name.
    pub username: String,
    /// Backend-assigned id of this device.
    pub client_id: String,
    /// Device label.
    pub device: String,
}

impl From<ClientRecord> for User {
    fn from(record: ClientRecord) -> Self {
        Self {
            username: record.username,
            client_id: record.client_id,
            device: record.device,
        }
    }
}

/// Session state owned by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    backend_url: Url,
    user: Option<User>,
    /// Last applied delivery cursor.
    cursor: u64,
}

impl Session {
    /// Create a session for an endpoint, with no user yet.
    #[must_use]
    pub fn new(backend_url: Url) -> Self {
        Self {
            backend_url,
            user: None,
            cursor: 0,
        }
    }

    /// Restore a session from persisted parts.
    #[must_use]
    pub fn restore(backend_url: Url, user: Option<User>, cursor: u64) -> Self {
        Self {
            backend_url,
            user,
            cursor,
        }
    }

    /// Get the backend URL.
    #[must_use]
    pub fn backend_url(&self) -> &Url {
        &self.backend_url
    }

    /// Get the local user, if registered.
    #[must_use]
    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    /// Get the local user.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NoIdentity` before a user is registered.
    pub fn require_user(&self) -> Result<&User> {
        self.user.as_ref().ok_or(CoreError::NoIdentity)
    }

    /// Install a freshly registered identity.
    ///
    /// The delivery cursor restarts because the new device has its own queue.
    pub fn set_user(&mut self, user: User) {
        info!(user = %user.username, client = %user.client_id, "Local identity set");
        self.user = Some(user);
        self.cursor = 0;
    }

    /// Get the last applied delivery cursor.
    #[must_use]
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Move the cursor forward. Never moves it back.
    ///
    /// Returns `true` if the cursor changed.
    pub fn advance_cursor(&mut self, cursor: u64) -> bool {
        if cursor > self.cursor {
            self.cursor = cursor;
            true
        } else {
            false
        }
    }
}
