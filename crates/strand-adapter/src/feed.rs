use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use strand_codec::EventRecord;
use strand_core::{LogPosition, NamespaceName, OriginId};
use strand_log::{ChangeOperation, FeedFilter, LogStore};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Delay before re-subscribing after the feed ends.
pub const FEED_RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Consumer of records delivered for one namespace.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn on_record(&self, position: LogPosition, record: EventRecord);
}

/// Namespace to sink routing shared with the feed task.
#[derive(Clone, Default)]
pub struct Registry {
    sinks: Arc<Mutex<HashMap<NamespaceName, Arc<dyn RecordSink>>>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("namespaces", &self.lock().len())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<NamespaceName, Arc<dyn RecordSink>>> {
        self.sinks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, namespace: NamespaceName, sink: Arc<dyn RecordSink>) {
        self.lock().insert(namespace, sink);
    }

    pub fn remove(&self, namespace: &NamespaceName) -> Option<Arc<dyn RecordSink>> {
        self.lock().remove(namespace)
    }

    pub fn get(&self, namespace: &NamespaceName) -> Option<Arc<dyn RecordSink>> {
        self.lock().get(namespace).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lifecycle of the change feed subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Disconnected,
    Subscribing,
    Active,
    /// Terminal.
    Closed,
}

/// Background task following the log's change feed for one process and
/// dispatching peer records to the registered namespaces.
#[derive(Debug)]
pub struct FeedConsumer {
    shutdown_tx: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
    state: watch::Receiver<FeedState>,
}

impl FeedConsumer {
    /// Spawns the feed task. Must be called inside a tokio runtime.
    pub fn start(
        log: Arc<dyn LogStore>,
        origin: OriginId,
        registry: Registry,
        backoff: Duration,
    ) -> Self {
        let (state_tx, state) = watch::channel(FeedState::Disconnected);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let worker = tokio::spawn(run_feed(
            log,
            origin,
            registry,
            backoff,
            state_tx,
            shutdown_rx,
        ));
        Self {
            shutdown_tx: Some(shutdown_tx),
            worker: Some(worker),
            state,
        }
    }

    pub fn state(&self) -> FeedState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<FeedState> {
        self.state.clone()
    }

    /// Stops the task and waits for it to release the subscription.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }
}

impl Drop for FeedConsumer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Waits until `state` reports `target`, at most `timeout`.
pub async fn wait_for_state(
    mut state: watch::Receiver<FeedState>,
    target: FeedState,
    timeout: Duration,
) -> bool {
    matches!(
        tokio::time::timeout(timeout, state.wait_for(|s| *s == target)).await,
        Ok(Ok(_))
    )
}

async fn dispatch(registry: &Registry, position: LogPosition, record: EventRecord) {
    match registry.get(&record.namespace) {
        Some(sink) => sink.on_record(position, record).await,
        None => debug!(
            namespace = %record.namespace,
            position = %position,
            "no adapter for namespace, skipping record"
        ),
    }
}

async fn run_feed(
    log: Arc<dyn LogStore>,
    origin: OriginId,
    registry: Registry,
    backoff: Duration,
    state_tx: watch::Sender<FeedState>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut cursor: Option<LogPosition> = None;

    'outer: loop {
        state_tx.send_replace(FeedState::Subscribing);
        let opened = tokio::select! {
            _ = &mut shutdown_rx => break 'outer,
            opened = log.open_change_feed(FeedFilter::peers_of(origin.clone()), cursor) => opened,
        };

        match opened {
            Ok(mut feed) => {
                state_tx.send_replace(FeedState::Active);
                info!(
                    origin = %origin,
                    resume_after = ?cursor.map(|p| p.to_string()),
                    "change feed subscribed"
                );
                loop {
                    tokio::select! {
                        _ = &mut shutdown_rx => break 'outer,
                        next = feed.next() => match next {
                            Some(Ok(change)) => {
                                if change.operation != ChangeOperation::Insert {
                                    continue;
                                }
                                let Some(record) = change.record else {
                                    continue;
                                };
                                cursor = Some(change.position);
                                dispatch(&registry, change.position, record).await;
                            }
                            Some(Err(err)) => {
                                warn!(origin = %origin, error = %err, "change feed error");
                                if !err.is_resumable() {
                                    cursor = None;
                                }
                                break;
                            }
                            None => {
                                debug!(origin = %origin, "change feed ended");
                                break;
                            }
                        }
                    }
                }
            }
            Err(err) => {
                warn!(origin = %origin, error = %err, "failed to open change feed");
            }
        }

        state_tx.send_replace(FeedState::Disconnected);
        tokio::select! {
            _ = &mut shutdown_rx => break 'outer,
            _ = tokio::time::sleep(backoff) => {}
        }
    }

    state_tx.send_replace(FeedState::Closed);
    info!(origin = %origin, "change feed closed");
}
