use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::StrandError;

/// Reserved origin of records published by a one-shot emitter.
///
/// Emitters never heartbeat and are never counted as live peers.
pub const EMITTER_UID: &str = "emitter";

/// Length of the text form of a [`LogPosition`].
const LOG_POSITION_HEX_LEN: usize = 16;

/// Returns a fresh random 16-hex-digit identifier.
fn random_hex_id() -> String {
    let mut bytes = [0_u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Wall-clock time in milliseconds since the UNIX epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Identity of a process publishing to the shared log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OriginId(String);

impl OriginId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random process identity.
    pub fn random() -> Self {
        Self(random_hex_id())
    }

    /// The reserved emitter identity.
    pub fn emitter() -> Self {
        Self(EMITTER_UID.to_string())
    }

    pub fn is_emitter(&self) -> bool {
        self.0 == EMITTER_UID
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OriginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical channel name (`/`, `/chat`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceName(String);

impl NamespaceName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for NamespaceName {
    fn default() -> Self {
        Self("/".to_string())
    }
}

impl From<&str> for NamespaceName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NamespaceName {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for NamespaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Correlation id linking a request record to its response records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        Self(random_hex_id())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Totally ordered marker of a record in the shared log.
///
/// The text form is exactly 16 hex digits and is what clients present back
/// as their recovery offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogPosition(pub u64);

impl LogPosition {
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for LogPosition {
    type Err = StrandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != LOG_POSITION_HEX_LEN || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(StrandError::InvalidInput("log position must be 16 hex digits"));
        }
        u64::from_str_radix(s, 16)
            .map(Self)
            .map_err(|_| StrandError::InvalidInput("log position must be 16 hex digits"))
    }
}
