//! Process-local counter store.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use super::{format_key, CounterStore, StoreError};

struct Entry {
    value: i64,
    expires_at: Instant,
}

/// An in-memory [`CounterStore`] with per-counter expiry.
///
/// Useful for a single process running several limiters, and for tests. Expired
/// counters behave exactly like missing ones.
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    ttl: Duration,
}

impl MemoryStore {
    /// Create a store whose counters expire `ttl` after their last increment.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Drop every expired counter.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            trace!(purged, "Purged expired counters");
        }
        purged
    }

    /// Number of counters currently held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no counters.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn add(&self, key: &str, start: i64, value: i64) -> Result<i64, StoreError> {
        let full_key = format_key(key, start);
        let now = Instant::now();

        // A new bucket is a good moment to sweep old ones. Must run before taking
        // the entry guard below.
        if !self.entries.contains_key(&full_key) {
            self.purge_expired();
        }

        let mut entry = self.entries.entry(full_key).or_insert(Entry {
            value: 0,
            expires_at: now,
        });
        if entry.expires_at <= now {
            entry.value = 0;
        }
        entry.value += value;
        entry.expires_at = now + self.ttl;

        Ok(entry.value)
    }

    async fn get(&self, key: &str, start: i64) -> Result<i64, StoreError> {
        let full_key = format_key(key, start);
        match self.entries.get(&full_key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(entry.value),
            _ => Err(StoreError::NotFound(full_key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_add_then_get() {
        let store = MemoryStore::new(Duration::from_secs(10));

        assert_eq!(assert_ok!(store.add("k", 100, 5).await), 5);
        assert_eq!(assert_ok!(store.add("k", 100, 3).await), 8);
        assert_eq!(assert_ok!(store.get("k", 100).await), 8);

        let err = assert_err!(store.get("k", 999).await);
        assert!(matches!(err, StoreError::NotFound(ref k) if k == "k_999"));
    }

    #[tokio::test]
    async fn test_keys_and_starts_are_separate() {
        let store = MemoryStore::new(Duration::from_secs(10));

        store.add("a", 1, 2).await.unwrap();
        store.add("a", 2, 7).await.unwrap();
        store.add("b", 1, 4).await.unwrap();

        assert_eq!(store.get("a", 1).await.unwrap(), 2);
        assert_eq!(store.get("a", 2).await.unwrap(), 7);
        assert_eq!(store.get("b", 1).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_zero_is_not_missing() {
        let store = MemoryStore::new(Duration::from_secs(10));

        store.add("k", 1, 0).await.unwrap();
        assert_eq!(assert_ok!(store.get("k", 1).await), 0);
    }

    #[tokio::test]
    async fn test_expired_counter_is_not_found() {
        let store = MemoryStore::new(Duration::from_millis(20));

        store.add("k", 1, 5).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(matches!(
            store.get("k", 1).await,
            Err(StoreError::NotFound(_))
        ));

        // Re-adding starts from zero rather than the stale value.
        assert_eq!(store.add("k", 1, 2).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_new_bucket_purges_expired() {
        let store = MemoryStore::new(Duration::from_millis(20));

        store.add("k", 1, 1).await.unwrap();
        store.add("k", 2, 1).await.unwrap();
        assert_eq!(store.len(), 2);

        tokio::time::sleep(Duration::from_millis(40)).await;
        store.add("k", 3, 1).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.purge_expired(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds() {
        let store = Arc::new(MemoryStore::new(Duration::from_secs(10)));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    for _ in 0..100 {
                        store.add("k", 1, 1).await.unwrap();
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(store.get("k", 1).await.unwrap(), 800);
    }
}
