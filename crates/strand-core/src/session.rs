use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Recoverable per-connection state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Secret id the client presents when reconnecting.
    pub private_id: String,
    /// Public socket id restored on success.
    pub session_id: String,
    pub rooms: BTreeSet<String>,
    #[serde(default)]
    pub data: Value,
    /// Last offset the client is known to have received, if tracked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_offset: Option<String>,
    /// Packet payloads missed while disconnected, in log order.
    ///
    /// Filled during restore only; never persisted.
    #[serde(skip)]
    pub missed_packets: Vec<Vec<Value>>,
}

impl Session {
    pub fn new(private_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            private_id: private_id.into(),
            session_id: session_id.into(),
            rooms: BTreeSet::new(),
            data: Value::Null,
            last_offset: None,
            missed_packets: Vec::new(),
        }
    }

    pub fn with_rooms<I, S>(mut self, rooms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rooms = rooms.into_iter().map(Into::into).collect();
        self
    }
}
