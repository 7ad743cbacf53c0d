//! State snapshots.
//!
//! A snapshot is the persistent part of a client: endpoint, identity, queue
//! cursor and every conversation with its history. It is stored as JSON.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::conversation::Conversation;
use crate::error::{CoreError, Result};
use crate::identity::User;

/// Current snapshot layout version.
pub const SNAPSHOT_FORMAT: u32 = 1;

/// Serializable client state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub format: u32,
    pub backend_url: String,
    pub user: Option<User>,
    /// Last applied delivery cursor.
    pub cursor: u64,
    /// Conversations in registry order.
    pub conversations: Vec<Conversation>,
}

impl StateSnapshot {
    /// Create a snapshot in the current format.
    #[must_use]
    pub fn new(
        backend_url: impl Into<String>,
        user: Option<User>,
        cursor: u64,
        conversations: Vec<Conversation>,
    ) -> Self {
        Self {
            format: SNAPSHOT_FORMAT,
            backend_url: backend_url.into(),
            user,
            cursor,
            conversations,
        }
    }

    /// Encode as JSON.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Storage` if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Decode from JSON.
    ///
    /// # Errors
    ///
    /// - `CoreError::Storage` if the bytes are not a snapshot
    /// - `CoreError::Corrupted` if the format is unknown
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let snapshot: StateSnapshot = serde_json::from_slice(bytes)?;
        if snapshot.format != SNAPSHOT_FORMAT {
            return Err(CoreError::Corrupted(format!(
                "unsupported snapshot format {}",
                snapshot.format
            )));
        }
        Ok(snapshot)
    }

    /// Write the snapshot to `path`, replacing any previous file.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Storage` on I/O failure.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, self.to_bytes()?)?;
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), conversations = self.conversations.len(), "Snapshot saved");
        Ok(())
    }

    /// Read a snapshot from `path`.
    ///
    /// # Errors
    ///
    /// Same as [`from_bytes`](Self::from_bytes), plus `CoreError::Storage` on
    /// I/O failure.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let snapshot = Self::from_bytes(&fs::read(path)?)?;
        debug!(path = %path.display(), "Snapshot loaded");
        Ok(snapshot)
    }
}
