//! Protocol versioning.
//!
//! The client announces its version in `Hello`; the backend answers with its
//! own in `Accepted` and both sides refuse to continue on a major mismatch.

use serde::{Deserialize, Serialize};

/// Current protocol version.
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 0 };

/// Protocol version information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Major version - incompatible request/response shapes.
    pub major: u8,
    /// Minor version - additive changes only.
    pub minor: u8,
}

impl Version {
    /// Create a new version.
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Whether a peer speaking `other` can be talked to.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }

    /// Pick the version both peers speak, if any.
    ///
    /// The lower minor wins so neither side sends requests the other
    /// cannot parse.
    #[must_use]
    pub fn negotiate(&self, other: &Version) -> Option<Version> {
        if !self.is_compatible_with(other) {
            return None;
        }
        Some(Version::new(self.major, self.minor.min(other.minor)))
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}
