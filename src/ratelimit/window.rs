//! Counting buckets.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::trace;

use super::sync::{SyncRequest, SyncResponse, Synchronizer};
use crate::error::Result;
use crate::store::CounterStore;

/// A counting bucket for one logical key.
///
/// Tracks the admissions made in the bucket (`count`), the part of them not yet
/// acknowledged by the shared store (`delta`), and the time of the last
/// admission. With a [`Synchronizer`] attached, the window periodically pushes
/// its delta and folds in what other instances contributed to the same bucket.
#[derive(Debug)]
pub struct Window {
    key: String,
    start: DateTime<Utc>,
    count: i64,
    delta: i64,
    last_time: Option<DateTime<Utc>>,
    /// Round of the last reconciliation applied.
    applied_round: u64,
    synchronizer: Option<Synchronizer>,
}

/// Point-in-time copy of a window's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    /// Bucket start
    pub start: DateTime<Utc>,
    /// Admissions in the bucket
    pub count: i64,
    /// Admissions not yet acknowledged by the store
    pub delta: i64,
}

impl Window {
    /// Create a window for `key` starting now.
    pub fn new(key: impl Into<String>) -> Self {
        Self::starting_at(key, Utc::now())
    }

    /// Create a window for `key` starting at `start`.
    pub fn starting_at(key: impl Into<String>, start: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            start,
            count: 0,
            delta: 0,
            last_time: None,
            applied_round: 0,
            synchronizer: None,
        }
    }

    /// Reconcile this window with `store` at most once per `sync_interval`.
    ///
    /// Must be called within a tokio runtime, which hosts the worker task.
    pub fn with_synchronizer(
        mut self,
        store: Arc<dyn CounterStore>,
        sync_interval: Duration,
    ) -> Result<Self> {
        self.synchronizer = Some(Synchronizer::start(store, sync_interval)?);
        Ok(self)
    }

    /// A window with the same counters and no synchronizer.
    pub(crate) fn detached(&self) -> Self {
        Self {
            key: self.key.clone(),
            start: self.start,
            count: self.count,
            delta: self.delta,
            last_time: self.last_time,
            applied_round: self.applied_round,
            synchronizer: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn count(&self) -> i64 {
        self.count
    }

    pub fn delta(&self) -> i64 {
        self.delta
    }

    pub fn last_time(&self) -> Option<DateTime<Utc>> {
        self.last_time
    }

    pub fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            start: self.start,
            count: self.count,
            delta: self.delta,
        }
    }

    /// Record `n` admissions made at `now`.
    pub fn add_count(&mut self, n: i64, now: DateTime<Utc>) {
        self.count += n;
        self.delta += n;
        self.last_time = Some(now);
    }

    /// Move the bucket to `start` holding `count`. Pending delta is kept.
    pub fn reset(&mut self, start: DateTime<Utc>, count: i64) {
        self.start = start;
        self.count = count;
    }

    /// Stop the attached synchronizer, if any.
    pub fn stop_sync(&self) {
        if let Some(sync) = &self.synchronizer {
            sync.stop();
        }
    }

    /// Run one non-blocking reconciliation step.
    pub fn sync(&mut self, now: DateTime<Utc>) {
        let Some(mut sync) = self.synchronizer.take() else {
            return;
        };

        if let Some(response) = sync.sync(now, || self.sync_request()) {
            self.handle_sync_response(&response);
        }
        self.synchronizer = Some(sync);
    }

    pub(crate) fn sync_request(&self) -> SyncRequest {
        SyncRequest {
            key: self.key.clone(),
            start: self.start.timestamp_millis(),
            count: self.count,
            delta: self.delta,
            round: 0,
        }
    }

    /// Apply a reconciliation result if it belongs to the live bucket.
    ///
    /// Returns whether the response was applied. A response for another bucket,
    /// an unsuccessful one, or one already applied changes nothing.
    pub(crate) fn handle_sync_response(&mut self, response: &SyncResponse) -> bool {
        if !response.success
            || response.start != self.start.timestamp_millis()
            || response.round <= self.applied_round
        {
            trace!(
                key = %self.key,
                start = response.start,
                round = response.round,
                success = response.success,
                "Discarding sync response"
            );
            return false;
        }

        self.count = (self.count + response.counterpart_delta).max(0);
        self.delta -= response.local_delta;
        self.applied_round = response.round;
        true
    }
}
