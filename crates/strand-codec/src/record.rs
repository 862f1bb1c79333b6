use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strand_core::{
    BroadcastOptions, NamespaceName, OriginId, Packet, RemoteSocket, RequestId, Session,
};

use crate::error::CodecError;

/// Kind of an [`EventRecord`].
///
/// Discriminants identify and order kinds only; there is no bit layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    InitialHeartbeat = 1,
    Heartbeat,
    Broadcast,
    SocketsJoin,
    SocketsLeave,
    DisconnectSockets,
    FetchSockets,
    FetchSocketsResponse,
    ServerSideEmit,
    ServerSideEmitResponse,
    BroadcastClientCount,
    BroadcastAck,
    Session,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::InitialHeartbeat => "INITIAL_HEARTBEAT",
            EventKind::Heartbeat => "HEARTBEAT",
            EventKind::Broadcast => "BROADCAST",
            EventKind::SocketsJoin => "SOCKETS_JOIN",
            EventKind::SocketsLeave => "SOCKETS_LEAVE",
            EventKind::DisconnectSockets => "DISCONNECT_SOCKETS",
            EventKind::FetchSockets => "FETCH_SOCKETS",
            EventKind::FetchSocketsResponse => "FETCH_SOCKETS_RESPONSE",
            EventKind::ServerSideEmit => "SERVER_SIDE_EMIT",
            EventKind::ServerSideEmitResponse => "SERVER_SIDE_EMIT_RESPONSE",
            EventKind::BroadcastClientCount => "BROADCAST_CLIENT_COUNT",
            EventKind::BroadcastAck => "BROADCAST_ACK",
            EventKind::Session => "SESSION",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific content of an [`EventRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventPayload {
    /// Announces a newly attached process; every peer answers with a heartbeat.
    InitialHeartbeat,
    Heartbeat,
    /// Packet fan-out. A request id marks a client-acknowledged broadcast.
    Broadcast {
        packet: Packet,
        opts: BroadcastOptions,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
    },
    SocketsJoin {
        opts: BroadcastOptions,
        rooms: Vec<String>,
    },
    SocketsLeave {
        opts: BroadcastOptions,
        rooms: Vec<String>,
    },
    DisconnectSockets {
        opts: BroadcastOptions,
        close: bool,
    },
    FetchSockets {
        opts: BroadcastOptions,
        request_id: RequestId,
    },
    FetchSocketsResponse {
        request_id: RequestId,
        sockets: Vec<RemoteSocket>,
    },
    /// Server-to-server event `[event, args...]`. A request id asks for replies.
    ServerSideEmit {
        packet: Vec<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
    },
    ServerSideEmitResponse {
        request_id: RequestId,
        packet: Value,
    },
    BroadcastClientCount {
        request_id: RequestId,
        client_count: usize,
    },
    BroadcastAck {
        request_id: RequestId,
        packet: Value,
    },
    Session(Session),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::InitialHeartbeat => EventKind::InitialHeartbeat,
            EventPayload::Heartbeat => EventKind::Heartbeat,
            EventPayload::Broadcast { .. } => EventKind::Broadcast,
            EventPayload::SocketsJoin { .. } => EventKind::SocketsJoin,
            EventPayload::SocketsLeave { .. } => EventKind::SocketsLeave,
            EventPayload::DisconnectSockets { .. } => EventKind::DisconnectSockets,
            EventPayload::FetchSockets { .. } => EventKind::FetchSockets,
            EventPayload::FetchSocketsResponse { .. } => EventKind::FetchSocketsResponse,
            EventPayload::ServerSideEmit { .. } => EventKind::ServerSideEmit,
            EventPayload::ServerSideEmitResponse { .. } => EventKind::ServerSideEmitResponse,
            EventPayload::BroadcastClientCount { .. } => EventKind::BroadcastClientCount,
            EventPayload::BroadcastAck { .. } => EventKind::BroadcastAck,
            EventPayload::Session(_) => EventKind::Session,
        }
    }
}

/// Unit of replication appended to the shared log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Publishing process; stamped by the publisher.
    pub origin: OriginId,
    /// Namespace the record belongs to; stamped by the publisher.
    pub namespace: NamespaceName,
    /// Unix millis, present only under time-based retention.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
    pub payload: EventPayload,
}

impl EventRecord {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Validates record envelope fields.
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.origin.as_str().is_empty() {
            return Err(CodecError::InvalidRecord("origin must not be empty"));
        }
        if !self.namespace.as_str().starts_with('/') {
            return Err(CodecError::InvalidRecord("namespace must start with '/'"));
        }
        Ok(())
    }
}

/// Encodes an [`EventRecord`] as CBOR after validation.
pub fn encode_record_cbor(record: &EventRecord) -> Result<Vec<u8>, CodecError> {
    record.validate()?;
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(record, &mut bytes)
        .map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(bytes)
}

/// Decodes and validates a CBOR [`EventRecord`].
pub fn decode_record_cbor(bytes: &[u8]) -> Result<EventRecord, CodecError> {
    let record: EventRecord =
        ciborium::de::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))?;
    record.validate()?;
    Ok(record)
}
