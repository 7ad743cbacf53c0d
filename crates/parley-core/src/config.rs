//! Client configuration.

use serde::{Deserialize, Serialize};

use crate::notifier::DEFAULT_EVENT_CAPACITY;

/// Settings for a [`Client`](crate::Client).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Label this device registers under.
    pub device_name: String,
    /// Events buffered per subscriber before the oldest are dropped.
    pub event_capacity: usize,
    /// Largest payload `send_message` accepts, checked before any network call.
    pub max_message_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            device_name: "primary".to_string(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            max_message_size: 64 * 1024,
        }
    }
}

impl ClientConfig {
    /// Use a different device label.
    #[must_use]
    pub fn with_device_name(mut self, device_name: impl Into<String>) -> Self {
        self.device_name = device_name.into();
        self
    }

    /// Use a different per-subscriber event capacity.
    #[must_use]
    pub fn with_event_capacity(mut self, event_capacity: usize) -> Self {
        self.event_capacity = event_capacity;
        self
    }
}
