//! Redis-backed counter store.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Client;
use tracing::{debug, info};

use super::{format_key, CounterStore, StoreError};

/// A [`CounterStore`] shared across processes through Redis.
///
/// Counters are plain integer keys updated with `INCRBY` and refreshed with
/// `PEXPIRE` in one `MULTI` block. Every call is bounded by `op_timeout`.
#[derive(Clone)]
pub struct RedisStore {
    connection_manager: ConnectionManager,
    ttl: Duration,
    op_timeout: Duration,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("ttl", &self.ttl)
            .field("op_timeout", &self.op_timeout)
            .finish()
    }
}

impl RedisStore {
    /// Connect to Redis at `url` and verify it answers a `PING`.
    pub async fn connect(url: &str, ttl: Duration, op_timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection_manager = with_deadline(op_timeout, client.get_connection_manager())
            .await
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", url, e)))?;

        let store = Self {
            connection_manager,
            ttl,
            op_timeout,
        };
        store
            .ping()
            .await
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", url, e)))?;

        info!(url = %url, "Connected to redis counter store");
        Ok(store)
    }

    /// Round-trip a `PING`.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection_manager.clone();
        let _: String = with_deadline(self.op_timeout, redis::cmd("PING").query_async(&mut conn)).await?;
        Ok(())
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn add(&self, key: &str, start: i64, value: i64) -> Result<i64, StoreError> {
        let full_key = format_key(key, start);
        let mut conn = self.connection_manager.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("INCRBY")
            .arg(&full_key)
            .arg(value)
            .cmd("PEXPIRE")
            .arg(&full_key)
            .arg(self.ttl.as_millis() as u64)
            .ignore();

        let (count,): (i64,) = with_deadline(self.op_timeout, pipe.query_async(&mut conn)).await?;
        debug!(key = %full_key, value, count, "Incremented redis counter");
        Ok(count)
    }

    async fn get(&self, key: &str, start: i64) -> Result<i64, StoreError> {
        let full_key = format_key(key, start);
        let mut conn = self.connection_manager.clone();

        let value: Option<i64> = with_deadline(
            self.op_timeout,
            redis::cmd("GET").arg(&full_key).query_async(&mut conn),
        )
        .await?;

        value.ok_or(StoreError::NotFound(full_key))
    }
}

async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, redis::RedisError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result.map_err(StoreError::from),
        Err(_) => Err(StoreError::Timeout(deadline)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Redis-backed tests only run when REDIS_URL is set (e.g. redis://127.0.0.1:6379/).
    fn redis_url() -> Option<String> {
        std::env::var("REDIS_URL").ok()
    }

    fn unique_key() -> String {
        format!("synclimit_test_{}", uuid::Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_connect_unreachable_fails() {
        let result = RedisStore::connect(
            "redis://127.0.0.1:1/",
            Duration::from_secs(2),
            Duration::from_millis(200),
        )
        .await;

        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_url() {
        let result = RedisStore::connect(
            "not-a-redis-url",
            Duration::from_secs(2),
            Duration::from_millis(200),
        )
        .await;

        assert!(matches!(result, Err(StoreError::Redis(_))));
    }

    #[tokio::test]
    async fn test_add_then_get() {
        let Some(url) = redis_url() else {
            return;
        };
        let store = RedisStore::connect(&url, Duration::from_secs(5), Duration::from_secs(1))
            .await
            .unwrap();
        let key = unique_key();

        assert_eq!(store.add(&key, 100, 5).await.unwrap(), 5);
        assert_eq!(store.add(&key, 100, 3).await.unwrap(), 8);
        assert_eq!(store.get(&key, 100).await.unwrap(), 8);
        assert!(matches!(
            store.get(&key, 999).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_counter_expires() {
        let Some(url) = redis_url() else {
            return;
        };
        let store = RedisStore::connect(&url, Duration::from_millis(100), Duration::from_secs(1))
            .await
            .unwrap();
        let key = unique_key();

        store.add(&key, 1, 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert!(matches!(store.get(&key, 1).await, Err(StoreError::NotFound(_))));
    }
}
