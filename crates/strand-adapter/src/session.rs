//! Session persistence and recovery over the shared log.
//!
//! A session is written as a SESSION record when a client disconnects and
//! consumed (deleted) by the first successful restore. Restore replays the
//! broadcasts the client would have received since its last offset.

use serde_json::Value;
use strand_codec::{EventKind, EventPayload};
use strand_core::{BroadcastOptions, LogPosition, NamespaceName, Packet, PacketKind, Session};
use strand_log::{LogQuery, LogStore};
use tracing::debug;

use crate::error::{AdapterError, RestoreError};
use crate::publish::Publisher;

/// Appends `position` to an event packet so the client can present it as
/// its recovery offset. Ack-expecting and volatile packets are left alone.
pub(crate) fn stamp_offset(packet: &mut Packet, opts: &BroadcastOptions, position: LogPosition) {
    if packet.kind == PacketKind::Event && packet.id.is_none() && !opts.flags.volatile {
        packet.data.push(Value::String(position.to_string()));
    }
}

pub async fn persist_session(
    publisher: &Publisher,
    session: Session,
) -> Result<LogPosition, AdapterError> {
    debug!(
        namespace = %publisher.namespace(),
        session_id = %session.session_id,
        "persisting session"
    );
    publisher.publish(EventPayload::Session(session)).await
}

/// Restores the session stored under `private_id` and fills its
/// `missed_packets` with the namespace's broadcasts after `offset` that
/// reached one of its rooms, each stamped with its own position.
pub async fn restore_session(
    log: &dyn LogStore,
    namespace: &NamespaceName,
    private_id: &str,
    offset: &str,
) -> Result<Session, RestoreError> {
    let offset: LogPosition = offset
        .parse()
        .map_err(|_| RestoreError::InvalidOffset(offset.to_string()))?;

    let session_query = LogQuery::new().session(private_id);
    let offset_query = LogQuery::new().kind(EventKind::Broadcast);
    let (stored, at_offset) = tokio::join!(
        log.find_one_and_delete(&session_query),
        log.find_at(offset, &offset_query),
    );
    let stored = stored.map_err(RestoreError::Io)?;
    let at_offset = at_offset.map_err(RestoreError::Io)?;

    let (Some((_, record)), Some(_)) = (stored, at_offset) else {
        return Err(RestoreError::SessionNotFound);
    };
    let EventPayload::Session(mut session) = record.payload else {
        return Err(RestoreError::SessionNotFound);
    };

    let missed = log
        .find_after(
            offset,
            &LogQuery::new()
                .kind(EventKind::Broadcast)
                .namespace(namespace.clone()),
        )
        .await
        .map_err(RestoreError::Io)?;
    for (position, record) in missed {
        if let EventPayload::Broadcast {
            mut packet, opts, ..
        } = record.payload
        {
            if opts.reaches_rooms(&session.rooms) {
                stamp_offset(&mut packet, &opts, position);
                session.missed_packets.push(packet.data);
            }
        }
    }

    debug!(
        namespace = %namespace,
        session_id = %session.session_id,
        missed = session.missed_packets.len(),
        "session restored"
    );
    Ok(session)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use strand_codec::EventPayload;
    use strand_core::{BroadcastOptions, NamespaceName, OriginId, Packet, Session};
    use strand_log::{LogError, MemoryLog};

    use super::{persist_session, restore_session};
    use crate::error::RestoreError;
    use crate::publish::Publisher;

    fn publisher(log: &Arc<MemoryLog>) -> Publisher {
        Publisher::new(log.clone(), OriginId::new("a"), NamespaceName::default(), false)
    }

    async fn broadcast(publisher: &Publisher, n: u64, opts: BroadcastOptions) -> String {
        publisher
            .publish(EventPayload::Broadcast {
                packet: Packet::event("/", "tick", vec![json!(n)]),
                opts,
                request_id: None,
            })
            .await
            .expect("publish should work")
            .to_string()
    }

    #[tokio::test]
    async fn replays_only_packets_for_session_rooms() {
        let log = Arc::new(MemoryLog::new());
        let publisher = publisher(&log);
        let offset = broadcast(&publisher, 0, BroadcastOptions::default()).await;
        persist_session(&publisher, Session::new("pid", "sid").with_rooms(["r1"]))
            .await
            .expect("persist should work");

        let first = broadcast(&publisher, 1, BroadcastOptions::default()).await;
        let second = broadcast(&publisher, 2, BroadcastOptions::default().to("r1")).await;
        broadcast(&publisher, 3, BroadcastOptions::default().to("r2")).await;
        broadcast(&publisher, 4, BroadcastOptions::default().except("r1")).await;

        let session = restore_session(log.as_ref(), &NamespaceName::default(), "pid", &offset)
            .await
            .expect("restore should work");
        assert_eq!(
            session.missed_packets,
            vec![
                vec![json!("tick"), json!(1), json!(first)],
                vec![json!("tick"), json!(2), json!(second)],
            ]
        );

        let again = restore_session(log.as_ref(), &NamespaceName::default(), "pid", &offset).await;
        assert!(matches!(again, Err(RestoreError::SessionNotFound)));
    }

    #[tokio::test]
    async fn replayed_packets_carry_their_offsets() {
        let log = Arc::new(MemoryLog::new());
        let publisher = publisher(&log);
        let offset = broadcast(&publisher, 0, BroadcastOptions::default()).await;
        persist_session(&publisher, Session::new("pid", "sid"))
            .await
            .expect("persist should work");
        broadcast(&publisher, 1, BroadcastOptions::default()).await;
        broadcast(&publisher, 2, BroadcastOptions::default().volatile()).await;

        let session = restore_session(log.as_ref(), &NamespaceName::default(), "pid", &offset)
            .await
            .expect("restore should work");
        assert_eq!(session.missed_packets.len(), 2);
        assert_eq!(session.missed_packets[1], vec![json!("tick"), json!(2)]);
        let last_offset = session.missed_packets[0]
            .last()
            .and_then(|v| v.as_str())
            .expect("replayed packet should carry its offset")
            .to_string();
        assert_eq!(last_offset, "0000000000000003");

        persist_session(&publisher, Session::new("pid", "sid"))
            .await
            .expect("persist should work");
        broadcast(&publisher, 3, BroadcastOptions::default()).await;
        let session = restore_session(log.as_ref(), &NamespaceName::default(), "pid", &last_offset)
            .await
            .expect("second restore should work");
        assert_eq!(session.missed_packets.len(), 2);
        assert_eq!(session.missed_packets[0], vec![json!("tick"), json!(2)]);
        assert_eq!(session.missed_packets[1][1], json!(3));
    }

    #[tokio::test]
    async fn malformed_offset_is_rejected() {
        let log = Arc::new(MemoryLog::new());
        let err = restore_session(log.as_ref(), &NamespaceName::default(), "pid", "not-hex")
            .await
            .expect_err("offset should be invalid");
        assert!(matches!(err, RestoreError::InvalidOffset(_)));
    }

    #[tokio::test]
    async fn unknown_offset_record_is_not_found() {
        let log = Arc::new(MemoryLog::new());
        let publisher = publisher(&log);
        persist_session(&publisher, Session::new("pid", "sid"))
            .await
            .expect("persist should work");
        let err = restore_session(
            log.as_ref(),
            &NamespaceName::default(),
            "pid",
            "00000000000000ff",
        )
        .await
        .expect_err("offset record is missing");
        assert!(matches!(err, RestoreError::SessionNotFound));
    }

    #[tokio::test]
    async fn log_failures_surface_as_io() {
        let log = Arc::new(MemoryLog::new());
        log.set_unavailable(Some("down".into()));
        let err = restore_session(
            log.as_ref(),
            &NamespaceName::default(),
            "pid",
            "0000000000000001",
        )
        .await
        .expect_err("log is down");
        assert!(matches!(err, RestoreError::Io(LogError::Unavailable(_))));
    }
}
