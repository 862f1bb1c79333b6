use std::time::Duration;

use serde::{Deserialize, Serialize};
use strand_core::OriginId;

/// Per-process adapter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Process identity stamped on every published record.
    pub uid: OriginId,
    /// Deadline for fan-out requests and the default client ack timeout.
    #[serde(with = "humantime_serde")]
    pub requests_timeout: Duration,
    /// Idle time after the last publish before a heartbeat is sent.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Silence after which a peer no longer counts as alive.
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,
    /// Stamp `created_at` on records; needed under time-based retention.
    pub add_created_at_field: bool,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            uid: OriginId::random(),
            requests_timeout: Duration::from_millis(5_000),
            heartbeat_interval: Duration::from_millis(5_000),
            heartbeat_timeout: Duration::from_millis(10_000),
            add_created_at_field: false,
        }
    }
}

impl AdapterConfig {
    pub fn with_uid(mut self, uid: OriginId) -> Self {
        self.uid = uid;
        self
    }

    pub fn with_requests_timeout(mut self, timeout: Duration) -> Self {
        self.requests_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_created_at_field(mut self, enabled: bool) -> Self {
        self.add_created_at_field = enabled;
        self
    }
}
