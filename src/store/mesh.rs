//! Gossip-backed counter store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use super::{format_key, CounterStore, StoreError};
use crate::mesh::Cluster;

/// A [`CounterStore`] backed by chitchat cluster state.
///
/// Totals are eventually consistent: increments from other nodes become visible
/// after they have been gossiped. Our contribution to a counter is withdrawn
/// once it has not been incremented for `ttl`.
pub struct MeshStore {
    cluster: Arc<Cluster>,
    ttl: Duration,
    /// Expiry of every counter we contribute to.
    written: DashMap<String, Instant>,
}

impl MeshStore {
    /// Create a store on top of a started cluster node.
    pub fn new(cluster: Arc<Cluster>, ttl: Duration) -> Self {
        Self {
            cluster,
            ttl,
            written: DashMap::new(),
        }
    }

    /// The underlying cluster node.
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Withdraw our expired contributions from the cluster state.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.written.retain(|key, expires_at| {
            if *expires_at <= now {
                expired.push(key.clone());
                false
            } else {
                true
            }
        });

        if !expired.is_empty() {
            trace!(count = expired.len(), "Withdrawing expired mesh counters");
            self.cluster
                .forget_counters(expired.iter().map(String::as_str))
                .await;
        }
        expired.len()
    }

    /// Withdraw our contribution to `full_key` if it has outlived the TTL.
    async fn expire_stale(&self, full_key: &str) {
        let now = Instant::now();
        if self
            .written
            .remove_if(full_key, |_, expires_at| *expires_at <= now)
            .is_some()
        {
            trace!(key = %full_key, "Withdrawing expired mesh counter");
            self.cluster.forget_counters([full_key]).await;
        }
    }
}

#[async_trait]
impl CounterStore for MeshStore {
    async fn add(&self, key: &str, start: i64, value: i64) -> Result<i64, StoreError> {
        let full_key = format_key(key, start);
        if !self.written.contains_key(&full_key) {
            self.purge_expired().await;
        } else {
            self.expire_stale(&full_key).await;
        }

        let total = self.cluster.increment_counter(&full_key, value).await;
        self.written.insert(full_key, Instant::now() + self.ttl);
        Ok(total)
    }

    async fn get(&self, key: &str, start: i64) -> Result<i64, StoreError> {
        let full_key = format_key(key, start);
        self.expire_stale(&full_key).await;
        self.cluster
            .counter_total(&full_key)
            .await
            .ok_or(StoreError::NotFound(full_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::ClusterConfig;
    use std::net::SocketAddr;

    fn test_cluster_config(port: u16) -> ClusterConfig {
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        ClusterConfig {
            node_id: format!("mesh-store-{}", port),
            listen_addr: addr,
            advertise_addr: addr,
            seed_nodes: Vec::new(),
            cluster_id: "mesh-store-test".to_string(),
            gossip_interval: Duration::from_millis(50),
            dead_node_grace_period: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_mesh_store_add_then_get() {
        let cluster = Arc::new(Cluster::start(test_cluster_config(18946)).await.unwrap());

        {
            let store = MeshStore::new(cluster.clone(), Duration::from_secs(10));

            assert_eq!(store.add("k", 100, 5).await.unwrap(), 5);
            assert_eq!(store.add("k", 100, 3).await.unwrap(), 8);
            assert_eq!(store.get("k", 100).await.unwrap(), 8);
            assert!(matches!(
                store.get("k", 999).await,
                Err(StoreError::NotFound(_))
            ));
        }

        Arc::try_unwrap(cluster).unwrap().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_mesh_store_expires_contribution() {
        let cluster = Arc::new(Cluster::start(test_cluster_config(18947)).await.unwrap());

        {
            let store = MeshStore::new(cluster.clone(), Duration::from_millis(20));

            store.add("k", 1, 4).await.unwrap();
            tokio::time::sleep(Duration::from_millis(40)).await;

            assert_eq!(store.purge_expired().await, 1);
            assert!(matches!(store.get("k", 1).await, Err(StoreError::NotFound(_))));
        }

        Arc::try_unwrap(cluster).unwrap().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_mesh_store_expired_counter_restarts() {
        let cluster = Arc::new(Cluster::start(test_cluster_config(18948)).await.unwrap());

        {
            let store = MeshStore::new(cluster.clone(), Duration::from_millis(20));

            assert_eq!(store.add("k", 1, 4).await.unwrap(), 4);
            tokio::time::sleep(Duration::from_millis(40)).await;

            // No sweep in between: the lapsed counter reads as missing and
            // a fresh increment starts from zero.
            assert!(matches!(store.get("k", 1).await, Err(StoreError::NotFound(_))));
            assert_eq!(store.add("k", 1, 3).await.unwrap(), 3);

            store.add("k", 2, 5).await.unwrap();
            tokio::time::sleep(Duration::from_millis(40)).await;
            assert_eq!(store.add("k", 2, 1).await.unwrap(), 1);
            assert_eq!(store.get("k", 2).await.unwrap(), 1);
        }

        Arc::try_unwrap(cluster).unwrap().shutdown().await.unwrap();
    }
}
