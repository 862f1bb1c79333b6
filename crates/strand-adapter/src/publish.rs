use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use strand_codec::{EventPayload, EventRecord};
use strand_core::{now_millis, LogPosition, NamespaceName, OriginId};
use strand_log::LogStore;
use tokio::sync::watch;
use tracing::debug;

use crate::error::AdapterError;

/// Appends records for one namespace on behalf of one process.
///
/// Origin, namespace and `created_at` are always stamped here.
pub struct Publisher {
    log: Arc<dyn LogStore>,
    origin: OriginId,
    namespace: NamespaceName,
    add_created_at_field: bool,
    closed: AtomicBool,
    last_publish: watch::Sender<Instant>,
}

impl Publisher {
    pub fn new(
        log: Arc<dyn LogStore>,
        origin: OriginId,
        namespace: NamespaceName,
        add_created_at_field: bool,
    ) -> Self {
        let (last_publish, _) = watch::channel(Instant::now());
        Self {
            log,
            origin,
            namespace,
            add_created_at_field,
            closed: AtomicBool::new(false),
            last_publish,
        }
    }

    pub fn origin(&self) -> &OriginId {
        &self.origin
    }

    pub fn namespace(&self) -> &NamespaceName {
        &self.namespace
    }

    pub fn log(&self) -> &Arc<dyn LogStore> {
        &self.log
    }

    pub fn adds_created_at(&self) -> bool {
        self.add_created_at_field
    }

    /// Builds the record `payload` would be published as.
    pub fn stamp(&self, payload: EventPayload) -> EventRecord {
        EventRecord {
            origin: self.origin.clone(),
            namespace: self.namespace.clone(),
            created_at: self.add_created_at_field.then(now_millis),
            payload,
        }
    }

    /// Appends `payload` to the log. Rejected once the publisher is closed.
    pub async fn publish(&self, payload: EventPayload) -> Result<LogPosition, AdapterError> {
        if self.is_closed() {
            return Err(AdapterError::Closed);
        }
        let record = self.stamp(payload);
        let kind = record.kind();
        let position = self.log.append(&record).await?;
        self.last_publish.send_replace(Instant::now());
        debug!(
            namespace = %self.namespace,
            kind = %kind,
            position = %position,
            "published record"
        );
        Ok(position)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Notified on every successful publish.
    pub fn activity(&self) -> watch::Receiver<Instant> {
        self.last_publish.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use strand_codec::EventPayload;
    use strand_core::{NamespaceName, OriginId};
    use strand_log::{LogQuery, LogStore, MemoryLog};

    use super::Publisher;
    use crate::error::AdapterError;

    #[tokio::test]
    async fn stamps_origin_namespace_and_timestamp() {
        let log = Arc::new(MemoryLog::new());
        let publisher = Publisher::new(
            log.clone(),
            OriginId::new("node-a"),
            NamespaceName::from("/chat"),
            true,
        );
        let position = publisher
            .publish(EventPayload::Heartbeat)
            .await
            .expect("publish should work");

        let record = log
            .find_at(position, &LogQuery::new())
            .await
            .expect("lookup should work")
            .expect("record should exist");
        assert_eq!(record.origin, OriginId::new("node-a"));
        assert_eq!(record.namespace, NamespaceName::from("/chat"));
        assert!(record.created_at.is_some());
    }

    #[tokio::test]
    async fn rejects_after_close() {
        let log = Arc::new(MemoryLog::new());
        let publisher = Publisher::new(log.clone(), OriginId::new("a"), NamespaceName::default(), false);
        publisher.close();
        let err = publisher
            .publish(EventPayload::Heartbeat)
            .await
            .expect_err("closed publisher should reject");
        assert!(matches!(err, AdapterError::Closed));
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn failed_append_does_not_mark_activity() {
        let log = Arc::new(MemoryLog::new());
        let publisher = Publisher::new(log.clone(), OriginId::new("a"), NamespaceName::default(), false);
        let mut activity = publisher.activity();
        activity.borrow_and_update();

        log.set_unavailable(Some("down".into()));
        publisher
            .publish(EventPayload::Heartbeat)
            .await
            .expect_err("append should fail");
        assert!(!activity.has_changed().expect("sender alive"));

        log.set_unavailable(None);
        publisher
            .publish(EventPayload::Heartbeat)
            .await
            .expect("publish should work");
        assert!(activity.has_changed().expect("sender alive"));
    }

    #[tokio::test]
    async fn publish_marks_activity() {
        let publisher = Publisher::new(
            Arc::new(MemoryLog::new()),
            OriginId::new("a"),
            NamespaceName::default(),
            false,
        );
        let mut activity = publisher.activity();
        activity.borrow_and_update();
        publisher
            .publish(EventPayload::Heartbeat)
            .await
            .expect("publish should work");
        assert!(activity.has_changed().expect("sender alive"));
    }
}
