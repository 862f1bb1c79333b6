use std::sync::Arc;

use serde_json::Value;
use strand_codec::EventPayload;
use strand_core::{BroadcastOptions, LogPosition, NamespaceName, OriginId, Packet};
use strand_log::LogStore;

use crate::error::AdapterError;
use crate::publish::Publisher;

/// Event names owned by the client protocol.
pub const RESERVED_EVENTS: [&str; 5] = [
    "connect",
    "disconnect",
    "disconnecting",
    "newListener",
    "removeListener",
];

pub fn check_event_name(event: &str) -> Result<(), AdapterError> {
    if RESERVED_EVENTS.contains(&event) {
        return Err(AdapterError::ReservedEvent(event.to_string()));
    }
    Ok(())
}

/// Publishes to the cluster from outside any server process.
///
/// Records carry the emitter origin, so peers never count it as a live
/// peer and it never receives anything back.
#[derive(Clone)]
pub struct Emitter {
    publisher: Arc<Publisher>,
    opts: BroadcastOptions,
}

impl Emitter {
    /// Emitter for the root namespace.
    pub fn new(log: Arc<dyn LogStore>) -> Self {
        Self::for_namespace(log, NamespaceName::default(), false)
    }

    fn for_namespace(
        log: Arc<dyn LogStore>,
        namespace: NamespaceName,
        add_created_at_field: bool,
    ) -> Self {
        Self {
            publisher: Arc::new(Publisher::new(
                log,
                OriginId::emitter(),
                namespace,
                add_created_at_field,
            )),
            opts: BroadcastOptions::default(),
        }
    }

    /// Stamps `created_at` on emitted records; needed under time-based
    /// retention.
    pub fn with_created_at_field(self, enabled: bool) -> Self {
        Self {
            opts: self.opts,
            ..Self::for_namespace(
                Arc::clone(self.publisher.log()),
                self.publisher.namespace().clone(),
                enabled,
            )
        }
    }

    pub fn namespace(&self) -> &NamespaceName {
        self.publisher.namespace()
    }

    /// Emitter for another namespace, with no room selection.
    pub fn of(&self, namespace: impl Into<NamespaceName>) -> Self {
        Self::for_namespace(
            Arc::clone(self.publisher.log()),
            namespace.into(),
            self.publisher.adds_created_at(),
        )
    }

    pub fn to(&self, room: impl Into<String>) -> Self {
        Self {
            publisher: Arc::clone(&self.publisher),
            opts: self.opts.clone().to(room),
        }
    }

    pub fn in_room(&self, room: impl Into<String>) -> Self {
        self.to(room)
    }

    pub fn except(&self, room: impl Into<String>) -> Self {
        Self {
            publisher: Arc::clone(&self.publisher),
            opts: self.opts.clone().except(room),
        }
    }

    pub fn volatile(&self) -> Self {
        Self {
            publisher: Arc::clone(&self.publisher),
            opts: self.opts.clone().volatile(),
        }
    }

    /// Broadcasts `event` to the selected sockets of every process.
    pub async fn emit(&self, event: &str, args: Vec<Value>) -> Result<LogPosition, AdapterError> {
        check_event_name(event)?;
        let packet = Packet::event(self.namespace().as_str(), event, args);
        self.publisher
            .publish(EventPayload::Broadcast {
                packet,
                opts: self.opts.clone(),
                request_id: None,
            })
            .await
    }

    pub async fn socket_join(&self, rooms: Vec<String>) -> Result<LogPosition, AdapterError> {
        self.publisher
            .publish(EventPayload::SocketsJoin {
                opts: self.opts.clone(),
                rooms,
            })
            .await
    }

    pub async fn socket_leave(&self, rooms: Vec<String>) -> Result<LogPosition, AdapterError> {
        self.publisher
            .publish(EventPayload::SocketsLeave {
                opts: self.opts.clone(),
                rooms,
            })
            .await
    }

    pub async fn disconnect_sockets(&self, close: bool) -> Result<LogPosition, AdapterError> {
        self.publisher
            .publish(EventPayload::DisconnectSockets {
                opts: self.opts.clone(),
                close,
            })
            .await
    }

    /// Sends a server-to-server event; replies are not collected.
    pub async fn server_side_emit(
        &self,
        event: &str,
        args: Vec<Value>,
    ) -> Result<LogPosition, AdapterError> {
        check_event_name(event)?;
        let mut packet = Vec::with_capacity(args.len() + 1);
        packet.push(Value::String(event.to_string()));
        packet.extend(args);
        self.publisher
            .publish(EventPayload::ServerSideEmit {
                packet,
                request_id: None,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use strand_codec::EventPayload;
    use strand_core::{LogPosition, NamespaceName, OriginId};
    use strand_log::{LogQuery, LogStore, MemoryLog};

    use super::{check_event_name, Emitter};
    use crate::error::AdapterError;

    #[tokio::test]
    async fn emits_room_scoped_broadcast_as_emitter() {
        let log = Arc::new(MemoryLog::new());
        let emitter = Emitter::new(log.clone());
        let position = emitter
            .of("/chat")
            .to("r1")
            .except("r2")
            .emit("news", vec![json!("hello")])
            .await
            .expect("emit should work");

        let record = log
            .find_at(position, &LogQuery::new())
            .await
            .expect("lookup should work")
            .expect("record should exist");
        assert_eq!(record.origin, OriginId::emitter());
        assert_eq!(record.namespace, NamespaceName::from("/chat"));
        let EventPayload::Broadcast { packet, opts, .. } = record.payload else {
            panic!("expected a broadcast");
        };
        assert_eq!(packet.event_name(), Some("news"));
        assert!(opts.rooms.contains("r1") && opts.except.contains("r2"));
    }

    #[tokio::test]
    async fn reserved_events_are_rejected() {
        let log = Arc::new(MemoryLog::new());
        let err = Emitter::new(log.clone())
            .emit("disconnect", vec![])
            .await
            .expect_err("reserved event");
        assert!(matches!(err, AdapterError::ReservedEvent(name) if name == "disconnect"));
        assert!(log.is_empty());
        assert!(check_event_name("newListener").is_err());
        assert!(check_event_name("message").is_ok());
    }

    #[tokio::test]
    async fn membership_operations_publish_records() {
        let log = Arc::new(MemoryLog::new());
        let emitter = Emitter::new(log.clone()).with_created_at_field(true).in_room("r1");
        emitter.socket_join(vec!["r9".into()]).await.expect("join");
        emitter.socket_leave(vec!["r9".into()]).await.expect("leave");
        emitter.disconnect_sockets(true).await.expect("disconnect");
        emitter
            .server_side_emit("sync", vec![json!(1)])
            .await
            .expect("server side emit");

        let records = log
            .find_after(LogPosition(0), &LogQuery::new())
            .await
            .expect("scan should work");
        assert_eq!(records.len(), 4);
        assert!(records.iter().all(|(_, r)| r.created_at.is_some()));
    }
}
