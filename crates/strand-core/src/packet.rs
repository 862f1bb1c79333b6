use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StrandError;

/// Client protocol packet kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum PacketKind {
    Connect,
    Disconnect,
    Event,
    Ack,
    ConnectError,
    BinaryEvent,
    BinaryAck,
}

impl From<PacketKind> for u8 {
    fn from(kind: PacketKind) -> Self {
        match kind {
            PacketKind::Connect => 0,
            PacketKind::Disconnect => 1,
            PacketKind::Event => 2,
            PacketKind::Ack => 3,
            PacketKind::ConnectError => 4,
            PacketKind::BinaryEvent => 5,
            PacketKind::BinaryAck => 6,
        }
    }
}

impl TryFrom<u8> for PacketKind {
    type Error = StrandError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => PacketKind::Connect,
            1 => PacketKind::Disconnect,
            2 => PacketKind::Event,
            3 => PacketKind::Ack,
            4 => PacketKind::ConnectError,
            5 => PacketKind::BinaryEvent,
            6 => PacketKind::BinaryAck,
            _ => return Err(StrandError::Decode("unknown packet kind")),
        })
    }
}

/// A client-bound packet as replicated between processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub kind: PacketKind,
    /// Namespace the packet is addressed to.
    pub namespace: String,
    /// Event name followed by its arguments for event packets.
    pub data: Vec<Value>,
    /// Client acknowledgement id, when the sender expects a client ack.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl Packet {
    /// Builds an event packet `[event, args...]`.
    pub fn event(namespace: impl Into<String>, event: &str, args: Vec<Value>) -> Self {
        let mut data = Vec::with_capacity(args.len() + 1);
        data.push(Value::String(event.to_string()));
        data.extend(args);
        Self {
            kind: PacketKind::Event,
            namespace: namespace.into(),
            data,
            id: None,
        }
    }

    /// Event name of an event packet.
    pub fn event_name(&self) -> Option<&str> {
        match self.kind {
            PacketKind::Event | PacketKind::BinaryEvent => self.data.first()?.as_str(),
            _ => None,
        }
    }
}

/// Modifiers carried by a broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastFlags {
    /// Apply on this process only; never replicate.
    #[serde(default)]
    pub local: bool,
    /// Packet may be dropped; never stamped with a recovery offset.
    #[serde(default)]
    pub volatile: bool,
    /// Client acknowledgement timeout for acknowledged broadcasts.
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
}

/// Target selection for broadcasts and membership operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastOptions {
    /// Target rooms; empty targets every socket of the namespace.
    #[serde(default)]
    pub rooms: BTreeSet<String>,
    /// Rooms whose members are excluded.
    #[serde(default)]
    pub except: BTreeSet<String>,
    #[serde(default)]
    pub flags: BroadcastFlags,
}

impl BroadcastOptions {
    pub fn to(mut self, room: impl Into<String>) -> Self {
        self.rooms.insert(room.into());
        self
    }

    pub fn except(mut self, room: impl Into<String>) -> Self {
        self.except.insert(room.into());
        self
    }

    pub fn local(mut self) -> Self {
        self.flags.local = true;
        self
    }

    pub fn volatile(mut self) -> Self {
        self.flags.volatile = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.flags.timeout = Some(timeout);
        self
    }

    /// Whether a member of exactly `rooms` would have received a broadcast
    /// sent with these options.
    ///
    /// True iff no target rooms are set or one of `rooms` is targeted, and
    /// none of `rooms` is excluded.
    pub fn reaches_rooms(&self, rooms: &BTreeSet<String>) -> bool {
        let included =
            self.rooms.is_empty() || rooms.iter().any(|room| self.rooms.contains(room));
        let not_excluded = rooms.iter().all(|room| !self.except.contains(room));
        included && not_excluded
    }
}

/// Serialisable view of a socket, as returned by fetch-sockets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSocket {
    pub id: String,
    pub handshake: Value,
    pub rooms: BTreeSet<String>,
    pub data: Value,
}
