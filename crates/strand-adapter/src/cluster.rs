use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use strand_core::{NamespaceName, OriginId};
use strand_log::LogStore;
use tracing::{info, warn};

use crate::config::AdapterConfig;
use crate::feed::{wait_for_state, FeedConsumer, FeedState, Registry, FEED_RECONNECT_BACKOFF};
use crate::local::LocalAdapter;
use crate::namespace::NamespaceAdapter;

#[derive(Default)]
struct ClusterState {
    adapters: HashMap<NamespaceName, Arc<NamespaceAdapter>>,
    consumer: Option<FeedConsumer>,
}

/// One process's membership in a cluster sharing one log.
///
/// Owns the namespace registry and the single change feed consumer. The
/// consumer starts with the first attached namespace and stops when the
/// last one detaches.
pub struct Cluster {
    log: Arc<dyn LogStore>,
    config: AdapterConfig,
    feed_backoff: Duration,
    registry: Registry,
    state: Mutex<ClusterState>,
}

impl Cluster {
    pub fn new(log: Arc<dyn LogStore>, config: AdapterConfig) -> Arc<Self> {
        Self::with_feed_backoff(log, config, FEED_RECONNECT_BACKOFF)
    }

    /// Like [`Cluster::new`] with a custom re-subscribe delay.
    pub fn with_feed_backoff(
        log: Arc<dyn LogStore>,
        config: AdapterConfig,
        feed_backoff: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            log,
            config,
            feed_backoff,
            registry: Registry::new(),
            state: Mutex::new(ClusterState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn uid(&self) -> &OriginId {
        &self.config.uid
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn log(&self) -> &Arc<dyn LogStore> {
        &self.log
    }

    /// Current feed state; `Closed` while no namespace is attached.
    pub fn feed_state(&self) -> FeedState {
        self.lock()
            .consumer
            .as_ref()
            .map_or(FeedState::Closed, FeedConsumer::state)
    }

    pub fn namespaces(&self) -> Vec<NamespaceName> {
        self.lock().adapters.keys().cloned().collect()
    }

    pub fn adapter(&self, namespace: &NamespaceName) -> Option<Arc<NamespaceAdapter>> {
        self.lock().adapters.get(namespace).cloned()
    }

    /// Creates the adapter for `namespace` and announces this process to
    /// its peers. An already attached namespace returns its existing
    /// adapter and `local` is dropped.
    pub async fn attach(
        self: &Arc<Self>,
        namespace: NamespaceName,
        local: Arc<dyn LocalAdapter>,
    ) -> Arc<NamespaceAdapter> {
        let (adapter, feed_state) = {
            let mut state = self.lock();
            if let Some(existing) = state.adapters.get(&namespace) {
                return Arc::clone(existing);
            }
            let adapter = NamespaceAdapter::new(self, namespace.clone(), local);
            state.adapters.insert(namespace.clone(), Arc::clone(&adapter));
            self.registry.insert(namespace.clone(), adapter.clone());
            let consumer = state.consumer.get_or_insert_with(|| {
                FeedConsumer::start(
                    Arc::clone(&self.log),
                    self.config.uid.clone(),
                    self.registry.clone(),
                    self.feed_backoff,
                )
            });
            (adapter, consumer.state_watch())
        };

        if !wait_for_state(feed_state, FeedState::Active, self.config.requests_timeout).await {
            warn!(namespace = %namespace, "change feed not active yet, announcing anyway");
        }
        if let Err(err) = adapter.announce().await {
            warn!(namespace = %namespace, error = %err, "initial heartbeat failed");
        }
        info!(namespace = %namespace, uid = %self.config.uid, "namespace attached");
        adapter
    }

    pub(crate) async fn detach(&self, namespace: &NamespaceName) {
        let consumer = {
            let mut state = self.lock();
            if state.adapters.remove(namespace).is_none() {
                return;
            }
            self.registry.remove(namespace);
            if state.adapters.is_empty() {
                state.consumer.take()
            } else {
                None
            }
        };
        info!(namespace = %namespace, "namespace detached");
        if let Some(consumer) = consumer {
            consumer.shutdown().await;
        }
    }

    /// Closes every attached namespace adapter.
    pub async fn close(&self) {
        let adapters: Vec<Arc<NamespaceAdapter>> = self.lock().adapters.values().cloned().collect();
        for adapter in adapters {
            adapter.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use strand_core::NamespaceName;
    use strand_log::MemoryLog;

    use super::Cluster;
    use crate::config::AdapterConfig;
    use crate::feed::FeedState;
    use crate::local::MemoryLocalAdapter;

    fn cluster() -> Arc<Cluster> {
        Cluster::with_feed_backoff(
            Arc::new(MemoryLog::new()),
            AdapterConfig::default(),
            Duration::from_millis(20),
        )
    }

    #[tokio::test]
    async fn feed_follows_namespace_lifecycle() {
        let cluster = cluster();
        assert_eq!(cluster.feed_state(), FeedState::Closed);

        let root = cluster
            .attach(NamespaceName::default(), Arc::new(MemoryLocalAdapter::new()))
            .await;
        let chat = cluster
            .attach(NamespaceName::from("/chat"), Arc::new(MemoryLocalAdapter::new()))
            .await;
        assert_eq!(cluster.feed_state(), FeedState::Active);
        assert_eq!(cluster.namespaces().len(), 2);

        root.close().await;
        assert_eq!(cluster.feed_state(), FeedState::Active);
        chat.close().await;
        assert_eq!(cluster.feed_state(), FeedState::Closed);

        cluster
            .attach(NamespaceName::default(), Arc::new(MemoryLocalAdapter::new()))
            .await;
        assert_eq!(cluster.feed_state(), FeedState::Active);
        cluster.close().await;
        assert!(cluster.namespaces().is_empty());
    }

    #[tokio::test]
    async fn attach_is_idempotent_per_namespace() {
        let cluster = cluster();
        let first = cluster
            .attach(NamespaceName::default(), Arc::new(MemoryLocalAdapter::new()))
            .await;
        let second = cluster
            .attach(NamespaceName::default(), Arc::new(MemoryLocalAdapter::new()))
            .await;
        assert!(Arc::ptr_eq(&first, &second));
        cluster.close().await;
    }
}
