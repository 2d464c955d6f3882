//! Cluster management using Chitchat.
//!
//! Each node publishes its own contribution to every bucket counter in its
//! chitchat key-value state. A counter's total is the sum of the contributions
//! of all live nodes, so increments never conflict.

use std::net::SocketAddr;
use std::time::Duration;

use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig,
};
use thiserror::Error;
use tracing::{debug, info};

/// Prefix of every counter key published in chitchat state.
const COUNTER_PREFIX: &str = "counter|";

/// Errors that can occur in cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Failed to start cluster: {0}")]
    StartError(String),
    #[error("Failed to stop cluster: {0}")]
    ShutdownError(String),
    #[error("Invalid cluster configuration: {0}")]
    InvalidConfig(String),
}

/// Configuration for the cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Unique node identifier.
    pub node_id: String,
    /// The address to listen on for gossip.
    pub listen_addr: SocketAddr,
    /// The address to advertise to other nodes.
    pub advertise_addr: SocketAddr,
    /// Seed nodes to bootstrap cluster membership.
    pub seed_nodes: Vec<String>,
    /// Cluster identifier (nodes must have matching cluster IDs).
    pub cluster_id: String,
    /// How often to gossip with peers.
    pub gossip_interval: Duration,
    /// Grace period before considering a dead node's state deletable.
    pub dead_node_grace_period: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let default_addr = SocketAddr::from(([0, 0, 0, 0], 7946));
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            listen_addr: default_addr,
            advertise_addr: default_addr,
            seed_nodes: Vec::new(),
            cluster_id: "synclimit".to_string(),
            gossip_interval: Duration::from_millis(100),
            dead_node_grace_period: Duration::from_secs(3600),
        }
    }
}

/// Convert a counter store key to its chitchat key.
fn chitchat_key(store_key: &str) -> String {
    format!("{}{}", COUNTER_PREFIX, store_key)
}

/// The cluster handle for distributed counter state.
pub struct Cluster {
    node_id: String,
    handle: ChitchatHandle,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl Cluster {
    /// Create and start a new cluster node.
    pub async fn start(config: ClusterConfig) -> Result<Self, ClusterError> {
        info!(
            node_id = %config.node_id,
            listen_addr = %config.listen_addr,
            advertise_addr = %config.advertise_addr,
            seed_nodes = ?config.seed_nodes,
            cluster_id = %config.cluster_id,
            "Starting cluster node"
        );

        let chitchat_id = ChitchatId {
            node_id: config.node_id.clone(),
            generation_id: 0,
            gossip_advertise_addr: config.advertise_addr,
        };

        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: config.cluster_id.clone(),
            gossip_interval: config.gossip_interval,
            listen_addr: config.listen_addr,
            seed_nodes: config.seed_nodes.clone(),
            failure_detector_config: FailureDetectorConfig {
                initial_interval: config.gossip_interval,
                ..Default::default()
            },
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let handle = spawn_chitchat(chitchat_config, Vec::new(), &UdpTransport)
            .await
            .map_err(|e| ClusterError::StartError(e.to_string()))?;

        info!("Cluster node started successfully");

        Ok(Self {
            node_id: config.node_id,
            handle,
        })
    }

    /// Get our node ID.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Add `amount` to our contribution for a counter and return the cluster total.
    pub async fn increment_counter(&self, store_key: &str, amount: i64) -> i64 {
        let key = chitchat_key(store_key);
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        let current_local: i64 = chitchat
            .self_node_state()
            .get(&key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let new_local = current_local + amount;
        chitchat.self_node_state().set(&key, new_local.to_string());

        debug!(key = %key, local_value = new_local, "Incremented local contribution");

        // Our own state is always present, so the sum exists.
        sum_counter(&chitchat, &key).unwrap_or(new_local)
    }

    /// Sum a counter across live nodes, or `None` when no live node publishes it.
    pub async fn counter_total(&self, store_key: &str) -> Option<i64> {
        let key = chitchat_key(store_key);
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        sum_counter(&chitchat, &key)
    }

    /// Withdraw our contribution for the given counters.
    pub async fn forget_counters<'a, I>(&self, store_keys: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        let state = chitchat.self_node_state();
        for store_key in store_keys {
            state.delete(&chitchat_key(store_key));
        }
    }

    /// Get the number of live nodes in the cluster.
    pub async fn live_node_count(&self) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat.live_nodes().count()
    }

    /// Shutdown the cluster node gracefully.
    pub async fn shutdown(self) -> Result<(), ClusterError> {
        info!(node_id = %self.node_id, "Shutting down cluster node");
        self.handle
            .shutdown()
            .await
            .map_err(|e| ClusterError::ShutdownError(format!("{:?}", e)))
    }
}

fn sum_counter(chitchat: &chitchat::Chitchat, key: &str) -> Option<i64> {
    let mut total: Option<i64> = None;

    for node_id in chitchat.live_nodes() {
        let Some(node_state) = chitchat.node_state(node_id) else {
            continue;
        };
        if let Some(count) = node_state.get(key).and_then(|v| v.parse::<i64>().ok()) {
            *total.get_or_insert(0) += count;
        }
    }

    total
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(port: u16) -> ClusterConfig {
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        ClusterConfig {
            node_id: format!("test-node-{}", port),
            listen_addr: addr,
            advertise_addr: addr,
            seed_nodes: Vec::new(),
            cluster_id: "test-cluster".to_string(),
            gossip_interval: Duration::from_millis(50),
            dead_node_grace_period: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_chitchat_key() {
        assert_eq!(chitchat_key("api_1000"), "counter|api_1000");
    }

    #[tokio::test]
    async fn test_cluster_start() {
        let cluster = Cluster::start(test_config(17946)).await.unwrap();

        assert_eq!(cluster.node_id(), "test-node-17946");
        assert_eq!(cluster.live_node_count().await, 1);

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cluster_increment_counter() {
        let cluster = Cluster::start(test_config(17947)).await.unwrap();

        assert_eq!(cluster.counter_total("k_1000").await, None);
        assert_eq!(cluster.increment_counter("k_1000", 5).await, 5);
        assert_eq!(cluster.increment_counter("k_1000", 3).await, 8);
        assert_eq!(cluster.counter_total("k_1000").await, Some(8));

        cluster.forget_counters(["k_1000"]).await;
        assert_eq!(cluster.counter_total("k_1000").await, None);

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cluster_two_nodes() {
        let cluster1 = Cluster::start(test_config(17948)).await.unwrap();

        let mut config2 = test_config(17949);
        config2.seed_nodes = vec!["127.0.0.1:17948".to_string()];
        let cluster2 = Cluster::start(config2).await.unwrap();

        // Give them time to discover each other
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(cluster1.live_node_count().await, 2);
        assert_eq!(cluster2.live_node_count().await, 2);

        cluster1.increment_counter("shared_1000", 10).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(cluster2.counter_total("shared_1000").await, Some(10));

        cluster2.increment_counter("shared_1000", 5).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(cluster1.counter_total("shared_1000").await, Some(15));
        assert_eq!(cluster2.counter_total("shared_1000").await, Some(15));

        cluster1.shutdown().await.unwrap();
        cluster2.shutdown().await.unwrap();
    }
}
