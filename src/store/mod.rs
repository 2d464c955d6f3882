//! Shared counter stores.
//!
//! A counter store holds one integer per `(logical key, bucket start)` pair and is
//! shared by every limiter instance that enforces the same threshold. Limiters never
//! call a store directly; all store traffic goes through a
//! [`Synchronizer`](crate::ratelimit::Synchronizer) worker.

mod memory;
mod mesh;
mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{StoreBackend, StoreConfig};
use crate::mesh::Cluster;

pub use self::memory::MemoryStore;
pub use self::mesh::MeshStore;
pub use self::redis::RedisStore;

/// Errors returned by counter stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No counter exists yet for the key and bucket start.
    #[error("counter not found: {0}")]
    NotFound(String),

    /// The store did not answer within the per-call deadline.
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Redis protocol or connection error.
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Capability a shared counter backend must provide.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add `value` to the counter for `(key, start)` and return the new total.
    ///
    /// Creates the counter if needed and refreshes its expiry.
    async fn add(&self, key: &str, start: i64, value: i64) -> Result<i64, StoreError>;

    /// Read the counter for `(key, start)`.
    ///
    /// Returns [`StoreError::NotFound`] when the counter does not exist, which is
    /// distinct from a counter holding zero.
    async fn get(&self, key: &str, start: i64) -> Result<i64, StoreError>;
}

/// Compose the store key for a logical key and bucket start.
pub fn format_key(key: &str, start: i64) -> String {
    format!("{}_{}", key, start)
}

/// A connected store together with the resources backing it.
pub struct StoreHandle {
    store: Arc<dyn CounterStore>,
    cluster: Option<Arc<Cluster>>,
}

impl StoreHandle {
    /// A shared reference to the store.
    pub fn store(&self) -> Arc<dyn CounterStore> {
        self.store.clone()
    }

    /// Release the store, leaving the gossip cluster when there is one.
    ///
    /// Synchronizer workers drop their store references as they exit, so the
    /// cluster is given a short while to become unshared.
    pub async fn shutdown(self) -> crate::error::Result<()> {
        let Self { store, cluster } = self;
        drop(store);
        let Some(mut cluster) = cluster else {
            return Ok(());
        };

        for _ in 0..50 {
            match Arc::try_unwrap(cluster) {
                Ok(cluster) => {
                    cluster.shutdown().await?;
                    return Ok(());
                }
                Err(shared) => {
                    cluster = shared;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            }
        }

        warn!(
            node_id = %cluster.node_id(),
            "Cluster still in use, skipping graceful shutdown"
        );
        Ok(())
    }
}

/// Build the store selected by the configuration.
///
/// Network backends are checked for connectivity here; failure is a startup error.
pub async fn connect(config: &StoreConfig) -> crate::error::Result<StoreHandle> {
    let ttl = config.expire_ttl();
    let mut cluster = None;
    let store: Arc<dyn CounterStore> = match config.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new(ttl)),
        StoreBackend::Redis => Arc::new(
            RedisStore::connect(&config.redis.url, ttl, config.redis.op_timeout()).await?,
        ),
        StoreBackend::Mesh => {
            let node = Arc::new(Cluster::start(config.mesh.cluster_config()?).await?);
            cluster = Some(node.clone());
            Arc::new(MeshStore::new(node, ttl))
        }
    };

    info!(backend = ?config.backend, ttl_ms = ttl.as_millis() as u64, "Counter store ready");
    Ok(StoreHandle { store, cluster })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_key() {
        assert_eq!(format_key("api", 1704067200000), "api_1704067200000");
        assert_eq!(format_key("", 0), "_0");
    }

    #[tokio::test]
    async fn test_connect_memory() {
        let config = StoreConfig::default();
        let handle = connect(&config).await.unwrap();
        let store = handle.store();

        assert_eq!(store.add("k", 1, 2).await.unwrap(), 2);
        assert_eq!(store.get("k", 1).await.unwrap(), 2);

        drop(store);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_mesh_shutdown_releases_port() {
        let mut config = StoreConfig {
            backend: StoreBackend::Mesh,
            ..Default::default()
        };
        config.mesh.listen_addr = ([127, 0, 0, 1], 18949).into();
        config.mesh.cluster_id = "connect-test".to_string();

        let handle = connect(&config).await.unwrap();
        let store = handle.store();
        assert_eq!(store.add("k", 1, 3).await.unwrap(), 3);

        // A lingering reference is released while shutdown waits.
        let lingering = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(store);
        });
        handle.shutdown().await.unwrap();
        lingering.await.unwrap();

        // The gossip socket is free again.
        let again = connect(&config).await.unwrap();
        assert!(matches!(
            again.store().get("k", 1).await,
            Err(StoreError::NotFound(_))
        ));
        again.shutdown().await.unwrap();
    }
}
