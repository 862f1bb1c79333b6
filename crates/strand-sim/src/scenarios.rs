use std::sync::Arc;
use std::time::{Duration, Instant};

use strand_adapter::{AdapterConfig, Cluster, MemoryLocalAdapter, NamespaceAdapter};
use strand_core::{NamespaceName, OriginId};
use strand_log::{MemoryLog, Retention};
use tracing::info;

/// Shape of a simulated cluster.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub nodes: usize,
    pub namespace: NamespaceName,
    pub requests_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub feed_backoff: Duration,
    pub recovery: bool,
    pub retention: Retention,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            nodes: 3,
            namespace: NamespaceName::default(),
            requests_timeout: Duration::from_millis(500),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(10),
            feed_backoff: Duration::from_millis(50),
            recovery: false,
            retention: Retention::Unbounded,
        }
    }
}

impl SimConfig {
    pub fn with_nodes(mut self, nodes: usize) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn with_requests_timeout(mut self, timeout: Duration) -> Self {
        self.requests_timeout = timeout;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_recovery(mut self, enabled: bool) -> Self {
        self.recovery = enabled;
        self
    }

    pub fn adapter_config(&self, index: usize) -> AdapterConfig {
        AdapterConfig::default()
            .with_uid(OriginId::new(format!("node-{index}")))
            .with_requests_timeout(self.requests_timeout)
            .with_heartbeat_interval(self.heartbeat_interval)
            .with_heartbeat_timeout(self.heartbeat_timeout)
            .with_created_at_field(matches!(self.retention, Retention::Ttl { .. }))
    }
}

/// One simulated server process.
pub struct SimNode {
    pub cluster: Arc<Cluster>,
    pub local: Arc<MemoryLocalAdapter>,
    pub adapter: Arc<NamespaceAdapter>,
}

/// N processes sharing one [`MemoryLog`].
pub struct SimCluster {
    pub log: Arc<MemoryLog>,
    pub nodes: Vec<SimNode>,
    config: SimConfig,
}

impl SimCluster {
    /// Starts every node in turn; each announces itself on attach.
    pub async fn start(config: SimConfig) -> Self {
        let log = Arc::new(MemoryLog::with_retention(config.retention));
        let mut sim = Self {
            log,
            nodes: Vec::with_capacity(config.nodes),
            config,
        };
        for _ in 0..sim.config.nodes {
            sim.add_node().await;
        }
        sim
    }

    /// Starts one more node and returns its index.
    pub async fn add_node(&mut self) -> usize {
        let index = self.nodes.len();
        let cluster = Cluster::with_feed_backoff(
            self.log.clone(),
            self.config.adapter_config(index),
            self.config.feed_backoff,
        );
        let local = Arc::new(MemoryLocalAdapter::new().with_recovery(self.config.recovery));
        let adapter = cluster
            .attach(self.config.namespace.clone(), local.clone())
            .await;
        info!(node = index, uid = %cluster.uid(), "simulated node started");
        self.nodes.push(SimNode {
            cluster,
            local,
            adapter,
        });
        index
    }

    pub fn node(&self, index: usize) -> &SimNode {
        &self.nodes[index]
    }

    /// Waits until every open node counts every open node.
    pub async fn wait_for_convergence(&self, timeout: Duration) -> bool {
        let live = self
            .nodes
            .iter()
            .filter(|n| !n.adapter.is_closed())
            .count();
        wait_until(timeout, || {
            self.nodes
                .iter()
                .filter(|n| !n.adapter.is_closed())
                .all(|n| n.adapter.server_count() == live)
        })
        .await
    }

    pub async fn shutdown(self) {
        for node in &self.nodes {
            node.cluster.close().await;
        }
    }
}

/// Polls `condition` every 10ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{wait_until, SimConfig};

    #[test]
    fn node_configs_get_distinct_uids() {
        let config = SimConfig::default();
        assert_ne!(config.adapter_config(0).uid, config.adapter_config(1).uid);
        assert_eq!(
            config.adapter_config(2).requests_timeout,
            Duration::from_millis(500)
        );
    }

    #[tokio::test]
    async fn wait_until_gives_up_after_timeout() {
        assert!(!wait_until(Duration::from_millis(30), || false).await);
        assert!(wait_until(Duration::from_millis(30), || true).await);
    }
}
