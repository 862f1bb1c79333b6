use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use strand_codec::{EventPayload, EventRecord};
use strand_core::{
    BroadcastOptions, LogPosition, NamespaceName, OriginId, Packet, RemoteSocket,
    RequestId, Session,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::ack::{AckAggregator, AckFn, ClientCountFn};
use crate::cluster::Cluster;
use crate::config::AdapterConfig;
use crate::emitter::check_event_name;
use crate::error::{AdapterError, RequestError, RestoreError};
use crate::feed::RecordSink;
use crate::heartbeat::spawn_heartbeat;
use crate::liveness::PeerLiveness;
use crate::local::{LocalAdapter, Responder};
use crate::publish::Publisher;
use crate::request::Correlator;
use crate::session::{persist_session, restore_session, stamp_offset};

/// Cluster-aware adapter for one namespace.
///
/// Wraps a [`LocalAdapter`]: every operation performs its local effect and,
/// unless the options carry the `local` flag, replicates it through the
/// shared log. Peer records arrive through [`RecordSink::on_record`].
pub struct NamespaceAdapter {
    cluster: Weak<Cluster>,
    namespace: NamespaceName,
    config: AdapterConfig,
    local: Arc<dyn LocalAdapter>,
    publisher: Arc<Publisher>,
    liveness: Mutex<PeerLiveness>,
    fetch_requests: Correlator<RemoteSocket>,
    emit_requests: Correlator<Value>,
    acks: AckAggregator,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl NamespaceAdapter {
    pub(crate) fn new(
        cluster: &Arc<Cluster>,
        namespace: NamespaceName,
        local: Arc<dyn LocalAdapter>,
    ) -> Arc<Self> {
        let config = cluster.config().clone();
        let publisher = Arc::new(Publisher::new(
            Arc::clone(cluster.log()),
            config.uid.clone(),
            namespace.clone(),
            config.add_created_at_field,
        ));
        let heartbeat = spawn_heartbeat(Arc::clone(&publisher), config.heartbeat_interval);
        Arc::new(Self {
            cluster: Arc::downgrade(cluster),
            namespace,
            liveness: Mutex::new(PeerLiveness::new(
                config.uid.clone(),
                config.heartbeat_timeout,
            )),
            config,
            local,
            publisher,
            fetch_requests: Correlator::new(),
            emit_requests: Correlator::new(),
            acks: AckAggregator::new(),
            heartbeat: Mutex::new(Some(heartbeat)),
        })
    }

    pub fn namespace(&self) -> &NamespaceName {
        &self.namespace
    }

    pub fn uid(&self) -> &OriginId {
        &self.config.uid
    }

    pub fn local(&self) -> &Arc<dyn LocalAdapter> {
        &self.local
    }

    pub fn is_closed(&self) -> bool {
        self.publisher.is_closed()
    }

    fn liveness(&self) -> MutexGuard<'_, PeerLiveness> {
        self.liveness.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expected_peer_count(&self) -> usize {
        self.liveness().expected_peer_count(Instant::now())
    }

    /// This process plus every peer heard from within the heartbeat timeout.
    pub fn server_count(&self) -> usize {
        1 + self.expected_peer_count()
    }

    pub(crate) async fn announce(&self) -> Result<LogPosition, AdapterError> {
        self.publisher.publish(EventPayload::InitialHeartbeat).await
    }

    /// Appends the record position to event packets when the local side
    /// tracks recovery offsets.
    fn stamp_offset(&self, packet: &mut Packet, opts: &BroadcastOptions, position: LogPosition) {
        if self.local.connection_state_recovery() {
            stamp_offset(packet, opts, position);
        }
    }

    pub async fn broadcast(
        &self,
        mut packet: Packet,
        opts: &BroadcastOptions,
    ) -> Result<(), AdapterError> {
        if !opts.flags.local {
            let position = self
                .publisher
                .publish(EventPayload::Broadcast {
                    packet: packet.clone(),
                    opts: opts.clone(),
                    request_id: None,
                })
                .await?;
            self.stamp_offset(&mut packet, opts, position);
        }
        self.local.broadcast(&packet, opts);
        Ok(())
    }

    /// Broadcasts and collects client acknowledgements from every process.
    ///
    /// Remote counts and acks are delivered until `flags.timeout` (default
    /// `requests_timeout`) elapses; later ones are dropped.
    pub async fn broadcast_with_ack(
        &self,
        packet: Packet,
        opts: &BroadcastOptions,
        on_client_count: ClientCountFn,
        on_ack: AckFn,
    ) -> Result<(), AdapterError> {
        if !opts.flags.local {
            let request_id = RequestId::random();
            let timeout = opts.flags.timeout.unwrap_or(self.config.requests_timeout);
            self.acks.register(
                request_id.clone(),
                timeout,
                Arc::clone(&on_client_count),
                Arc::clone(&on_ack),
            );
            let published = self
                .publisher
                .publish(EventPayload::Broadcast {
                    packet: packet.clone(),
                    opts: opts.clone(),
                    request_id: Some(request_id.clone()),
                })
                .await;
            if let Err(err) = published {
                self.acks.cancel(&request_id);
                return Err(err);
            }
        }
        self.local
            .broadcast_with_ack(&packet, opts, on_client_count, on_ack);
        Ok(())
    }

    pub async fn add_sockets(
        &self,
        opts: &BroadcastOptions,
        rooms: Vec<String>,
    ) -> Result<(), AdapterError> {
        self.local.add_sockets(opts, &rooms);
        if opts.flags.local {
            return Ok(());
        }
        self.publisher
            .publish(EventPayload::SocketsJoin {
                opts: opts.clone(),
                rooms,
            })
            .await?;
        Ok(())
    }

    pub async fn del_sockets(
        &self,
        opts: &BroadcastOptions,
        rooms: Vec<String>,
    ) -> Result<(), AdapterError> {
        self.local.del_sockets(opts, &rooms);
        if opts.flags.local {
            return Ok(());
        }
        self.publisher
            .publish(EventPayload::SocketsLeave {
                opts: opts.clone(),
                rooms,
            })
            .await?;
        Ok(())
    }

    pub async fn disconnect_sockets(
        &self,
        opts: &BroadcastOptions,
        close: bool,
    ) -> Result<(), AdapterError> {
        self.local.disconnect_sockets(opts, close);
        if opts.flags.local {
            return Ok(());
        }
        self.publisher
            .publish(EventPayload::DisconnectSockets {
                opts: opts.clone(),
                close,
            })
            .await?;
        Ok(())
    }

    /// Sockets matching `opts` across the cluster, local ones first.
    pub async fn fetch_sockets(
        &self,
        opts: &BroadcastOptions,
    ) -> Result<Vec<RemoteSocket>, RequestError<RemoteSocket>> {
        let local = self.local.fetch_sockets(opts);
        if opts.flags.local {
            return Ok(local);
        }
        let expected = self.expected_peer_count();
        if expected == 0 {
            return Ok(local);
        }

        let request_id = RequestId::random();
        let pending = self
            .fetch_requests
            .register(request_id.clone(), expected, local);
        let published = self
            .publisher
            .publish(EventPayload::FetchSockets {
                opts: opts.clone(),
                request_id,
            })
            .await;
        if let Err(err) = published {
            pending.cancel();
            return Err(err.into());
        }
        pending.wait(self.config.requests_timeout).await
    }

    /// Sends `[event, args...]` to every peer.
    pub async fn server_side_emit(&self, packet: Vec<Value>) -> Result<(), AdapterError> {
        if let Some(event) = packet.first().and_then(Value::as_str) {
            check_event_name(event)?;
        }
        self.publisher
            .publish(EventPayload::ServerSideEmit {
                packet,
                request_id: None,
            })
            .await?;
        Ok(())
    }

    /// Sends `[event, args...]` to every peer and collects one reply from
    /// each.
    pub async fn server_side_emit_with_ack(
        &self,
        packet: Vec<Value>,
    ) -> Result<Vec<Value>, RequestError<Value>> {
        if let Some(event) = packet.first().and_then(Value::as_str) {
            check_event_name(event)?;
        }
        let expected = self.expected_peer_count();
        if expected == 0 {
            return Ok(Vec::new());
        }

        let request_id = RequestId::random();
        let pending = self
            .emit_requests
            .register(request_id.clone(), expected, Vec::new());
        let published = self
            .publisher
            .publish(EventPayload::ServerSideEmit {
                packet,
                request_id: Some(request_id),
            })
            .await;
        if let Err(err) = published {
            pending.cancel();
            return Err(err.into());
        }
        pending.wait(self.config.requests_timeout).await
    }

    pub async fn persist_session(&self, session: Session) -> Result<LogPosition, AdapterError> {
        persist_session(&self.publisher, session).await
    }

    pub async fn restore_session(
        &self,
        private_id: &str,
        offset: &str,
    ) -> Result<Session, RestoreError> {
        restore_session(
            self.publisher.log().as_ref(),
            &self.namespace,
            private_id,
            offset,
        )
        .await
    }

    /// Stops publishing and heartbeats, fails in-flight requests and
    /// detaches from the cluster.
    pub async fn close(&self) {
        self.publisher.close();
        let dropped = self.fetch_requests.close_all() + self.emit_requests.close_all();
        if dropped > 0 {
            debug!(namespace = %self.namespace, dropped, "failed pending requests on close");
        }
        let heartbeat = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = heartbeat {
            handle.abort();
        }
        if let Some(cluster) = self.cluster.upgrade() {
            cluster.detach(&self.namespace).await;
        }
    }

    async fn publish_or_warn(&self, payload: EventPayload) {
        let kind = payload.kind();
        if let Err(err) = self.publisher.publish(payload).await {
            warn!(namespace = %self.namespace, kind = %kind, error = %err, "reply publish failed");
        }
    }

    /// Applies an acknowledged broadcast from a peer and streams the client
    /// count and acks back in order.
    fn apply_ack_broadcast(&self, packet: Packet, opts: BroadcastOptions, request_id: RequestId) {
        let (tx, mut rx) = mpsc::unbounded_channel::<EventPayload>();

        let count_tx = tx.clone();
        let count_id = request_id.clone();
        let on_client_count: ClientCountFn = Arc::new(move |client_count| {
            let _ = count_tx.send(EventPayload::BroadcastClientCount {
                request_id: count_id.clone(),
                client_count,
            });
        });
        let on_ack: AckFn = Arc::new(move |packet| {
            let _ = tx.send(EventPayload::BroadcastAck {
                request_id: request_id.clone(),
                packet,
            });
        });

        let publisher = Arc::clone(&self.publisher);
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                if let Err(err) = publisher.publish(payload).await {
                    warn!(namespace = %publisher.namespace(), error = %err, "ack publish failed");
                }
            }
        });

        self.local
            .broadcast_with_ack(&packet, &opts, on_client_count, on_ack);
    }

    fn responder(&self, request_id: RequestId) -> Responder {
        let publisher = Arc::clone(&self.publisher);
        let runtime = tokio::runtime::Handle::current();
        Responder::new(move |packet| {
            runtime.spawn(async move {
                let reply = EventPayload::ServerSideEmitResponse { request_id, packet };
                if let Err(err) = publisher.publish(reply).await {
                    warn!(namespace = %publisher.namespace(), error = %err, "server side reply failed");
                }
            });
        })
    }
}

#[async_trait]
impl RecordSink for NamespaceAdapter {
    async fn on_record(&self, position: LogPosition, record: EventRecord) {
        if record.origin == self.config.uid {
            return;
        }
        self.liveness().observe(&record.origin, Instant::now());
        debug!(
            namespace = %self.namespace,
            origin = %record.origin,
            kind = %record.kind(),
            position = %position,
            "received record"
        );

        match record.payload {
            EventPayload::InitialHeartbeat => {
                self.publish_or_warn(EventPayload::Heartbeat).await;
            }
            EventPayload::Heartbeat => {}
            EventPayload::Broadcast {
                mut packet,
                opts,
                request_id: None,
            } => {
                self.stamp_offset(&mut packet, &opts, position);
                self.local.broadcast(&packet, &opts);
            }
            EventPayload::Broadcast {
                packet,
                opts,
                request_id: Some(request_id),
            } => self.apply_ack_broadcast(packet, opts, request_id),
            EventPayload::SocketsJoin { opts, rooms } => self.local.add_sockets(&opts, &rooms),
            EventPayload::SocketsLeave { opts, rooms } => self.local.del_sockets(&opts, &rooms),
            EventPayload::DisconnectSockets { opts, close } => {
                self.local.disconnect_sockets(&opts, close)
            }
            EventPayload::FetchSockets { opts, request_id } => {
                let sockets = self.local.fetch_sockets(&opts);
                self.publish_or_warn(EventPayload::FetchSocketsResponse {
                    request_id,
                    sockets,
                })
                .await;
            }
            EventPayload::FetchSocketsResponse {
                request_id,
                sockets,
            } => {
                self.fetch_requests.on_response(&request_id, sockets);
            }
            EventPayload::ServerSideEmit { packet, request_id } => {
                let responder = request_id.map(|id| self.responder(id));
                self.local.on_server_side_emit(packet, responder);
            }
            EventPayload::ServerSideEmitResponse { request_id, packet } => {
                self.emit_requests.on_response(&request_id, [packet]);
            }
            EventPayload::BroadcastClientCount {
                request_id,
                client_count,
            } => {
                self.acks.on_client_count(&request_id, client_count);
            }
            EventPayload::BroadcastAck { request_id, packet } => {
                self.acks.on_ack(&request_id, packet);
            }
            EventPayload::Session(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use strand_codec::{EventKind, EventPayload, EventRecord};
    use strand_core::{BroadcastOptions, LogPosition, NamespaceName, OriginId, Packet, Session};
    use strand_log::{LogQuery, LogStore, MemoryLog};

    use crate::cluster::Cluster;
    use crate::config::AdapterConfig;
    use crate::error::{AdapterError, RequestError};
    use crate::feed::RecordSink;
    use crate::local::{LocalSocket, MemoryLocalAdapter};

    async fn single_node(
        local: Arc<MemoryLocalAdapter>,
    ) -> (Arc<MemoryLog>, Arc<Cluster>, Arc<super::NamespaceAdapter>) {
        let log = Arc::new(MemoryLog::new());
        let config = AdapterConfig::default()
            .with_uid(OriginId::new("me"))
            .with_requests_timeout(Duration::from_millis(100));
        let cluster = Cluster::with_feed_backoff(log.clone(), config, Duration::from_millis(20));
        let adapter = cluster.attach(NamespaceName::default(), local).await;
        (log, cluster, adapter)
    }

    fn peer_record(payload: EventPayload) -> EventRecord {
        EventRecord {
            origin: OriginId::new("peer"),
            namespace: NamespaceName::default(),
            created_at: None,
            payload,
        }
    }

    async fn count(log: &MemoryLog, kind: EventKind) -> usize {
        log.find_after(LogPosition(0), &LogQuery::new().kind(kind))
            .await
            .expect("scan should work")
            .len()
    }

    #[tokio::test]
    async fn local_flag_skips_replication() {
        let local = Arc::new(MemoryLocalAdapter::new());
        local.connect(LocalSocket::new("s1"));
        let (log, _cluster, adapter) = single_node(local.clone()).await;

        adapter
            .broadcast(
                Packet::event("/", "hi", vec![]),
                &BroadcastOptions::default().local(),
            )
            .await
            .expect("broadcast should work");
        assert_eq!(local.inbox("s1").len(), 1);
        assert_eq!(count(&log, EventKind::Broadcast).await, 0);

        adapter
            .broadcast(Packet::event("/", "hi", vec![]), &BroadcastOptions::default())
            .await
            .expect("broadcast should work");
        assert_eq!(count(&log, EventKind::Broadcast).await, 1);
        adapter.close().await;
    }

    #[tokio::test]
    async fn recovery_stamps_offsets_on_event_packets() {
        let local = Arc::new(MemoryLocalAdapter::new().with_recovery(true));
        local.connect(LocalSocket::new("s1"));
        let (_log, _cluster, adapter) = single_node(local.clone()).await;

        adapter
            .broadcast(Packet::event("/", "a", vec![]), &BroadcastOptions::default())
            .await
            .expect("broadcast should work");
        adapter
            .broadcast(
                Packet::event("/", "b", vec![]),
                &BroadcastOptions::default().volatile(),
            )
            .await
            .expect("broadcast should work");

        let position = LogPosition(42);
        adapter
            .on_record(
                position,
                peer_record(EventPayload::Broadcast {
                    packet: Packet::event("/", "c", vec![]),
                    opts: BroadcastOptions::default(),
                    request_id: None,
                }),
            )
            .await;

        let inbox = local.inbox("s1");
        assert_eq!(inbox[0].len(), 2);
        assert_eq!(inbox[1].len(), 1);
        assert_eq!(inbox[2], vec![json!("c"), json!(position.to_string())]);
        adapter.close().await;
    }

    #[tokio::test]
    async fn own_records_are_ignored() {
        let local = Arc::new(MemoryLocalAdapter::new());
        local.connect(LocalSocket::new("s1"));
        let (_log, _cluster, adapter) = single_node(local.clone()).await;

        let mut own = peer_record(EventPayload::Broadcast {
            packet: Packet::event("/", "echo", vec![]),
            opts: BroadcastOptions::default(),
            request_id: None,
        });
        own.origin = OriginId::new("me");
        adapter.on_record(LogPosition(1), own).await;
        assert!(local.inbox("s1").is_empty());
        assert_eq!(adapter.server_count(), 1);
        adapter.close().await;
    }

    #[tokio::test]
    async fn peers_and_emitter_affect_server_count_differently() {
        let (_log, _cluster, adapter) = single_node(Arc::new(MemoryLocalAdapter::new())).await;
        adapter
            .on_record(LogPosition(1), peer_record(EventPayload::Heartbeat))
            .await;
        let mut from_emitter = peer_record(EventPayload::SocketsJoin {
            opts: BroadcastOptions::default(),
            rooms: vec!["r1".into()],
        });
        from_emitter.origin = OriginId::emitter();
        adapter.on_record(LogPosition(2), from_emitter).await;
        assert_eq!(adapter.server_count(), 2);
        adapter.close().await;
    }

    #[tokio::test]
    async fn initial_heartbeat_is_answered() {
        let (log, _cluster, adapter) = single_node(Arc::new(MemoryLocalAdapter::new())).await;
        adapter
            .on_record(LogPosition(1), peer_record(EventPayload::InitialHeartbeat))
            .await;
        assert_eq!(count(&log, EventKind::Heartbeat).await, 1);
        adapter.close().await;
    }

    #[tokio::test]
    async fn fetch_sockets_without_peers_is_local() {
        let local = Arc::new(MemoryLocalAdapter::new());
        local.connect(LocalSocket::new("s1").in_rooms(["r1"]));
        let (log, _cluster, adapter) = single_node(local).await;

        let sockets = adapter
            .fetch_sockets(&BroadcastOptions::default())
            .await
            .expect("fetch should work");
        assert_eq!(sockets.len(), 1);
        assert_eq!(count(&log, EventKind::FetchSockets).await, 0);
        adapter.close().await;
    }

    #[tokio::test]
    async fn fetch_sockets_times_out_with_local_partials() {
        let local = Arc::new(MemoryLocalAdapter::new());
        local.connect(LocalSocket::new("s1"));
        let (_log, _cluster, adapter) = single_node(local).await;
        adapter
            .on_record(LogPosition(1), peer_record(EventPayload::Heartbeat))
            .await;

        let err = adapter
            .fetch_sockets(&BroadcastOptions::default())
            .await
            .expect_err("silent peer should time out");
        match err {
            RequestError::Timeout {
                received,
                expected,
                partial,
            } => {
                assert_eq!((received, expected), (0, 1));
                assert_eq!(partial.len(), 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        adapter.close().await;
    }

    #[tokio::test]
    async fn close_fails_in_flight_requests() {
        let log = Arc::new(MemoryLog::new());
        let config = AdapterConfig::default()
            .with_uid(OriginId::new("me"))
            .with_requests_timeout(Duration::from_secs(5));
        let cluster = Cluster::with_feed_backoff(log, config, Duration::from_millis(20));
        let adapter = cluster
            .attach(NamespaceName::default(), Arc::new(MemoryLocalAdapter::new()))
            .await;
        adapter
            .on_record(LogPosition(1), peer_record(EventPayload::Heartbeat))
            .await;

        let fetching = {
            let adapter = Arc::clone(&adapter);
            tokio::spawn(async move { adapter.fetch_sockets(&BroadcastOptions::default()).await })
        };
        let emitting = {
            let adapter = Arc::clone(&adapter);
            tokio::spawn(async move {
                adapter
                    .server_side_emit_with_ack(vec![json!("sync")])
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        adapter.close().await;

        let fetched = tokio::time::timeout(Duration::from_secs(1), fetching)
            .await
            .expect("fetch should finish before its timeout")
            .expect("fetch task should not panic");
        assert!(matches!(
            fetched,
            Err(RequestError::Adapter(AdapterError::Closed))
        ));
        let emitted = tokio::time::timeout(Duration::from_secs(1), emitting)
            .await
            .expect("emit should finish before its timeout")
            .expect("emit task should not panic");
        assert!(matches!(
            emitted,
            Err(RequestError::Adapter(AdapterError::Closed))
        ));
    }

    #[tokio::test]
    async fn reserved_server_side_events_are_rejected() {
        let (_log, _cluster, adapter) = single_node(Arc::new(MemoryLocalAdapter::new())).await;
        let err = adapter
            .server_side_emit(vec![json!("connect")])
            .await
            .expect_err("reserved event");
        assert!(matches!(err, AdapterError::ReservedEvent(_)));
        adapter.close().await;
    }

    #[tokio::test]
    async fn closed_adapter_rejects_operations() {
        let (log, _cluster, adapter) = single_node(Arc::new(MemoryLocalAdapter::new())).await;
        adapter.close().await;
        assert!(adapter.is_closed());

        let err = adapter
            .persist_session(Session::new("pid", "sid"))
            .await
            .expect_err("closed adapter should reject");
        assert!(matches!(err, AdapterError::Closed));
        assert_eq!(count(&log, EventKind::Session).await, 0);
    }
}
