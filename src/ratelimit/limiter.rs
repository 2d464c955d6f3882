//! Sliding-window rate limiter.

use std::time::Duration;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::window::{Window, WindowSnapshot};
use crate::error::{Result, SynclimitError};

/// A sliding-window rate limiter over two adjacent buckets.
///
/// The admitted volume over the last `stat_interval` is estimated as the
/// current bucket's count plus the previous bucket's count weighted by how much
/// of it still overlaps the sliding window. Each decision is taken under one
/// lock; reconciliation with other instances happens in the background through
/// the current window's synchronizer and never delays a decision.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct Limiter {
    stat_interval: TimeDelta,
    threshold: i64,
    limit_evenly: bool,
    windows: Mutex<Windows>,
}

struct Windows {
    curr: Window,
    prev: Window,
}

impl Limiter {
    /// Create a limiter admitting at most `threshold` per `stat_interval`.
    ///
    /// `window` becomes the current bucket, moved back to the boundary of the
    /// bucket containing its start so that every instance shares the same
    /// bucket keys. Attach a synchronizer to it to share the threshold with
    /// other instances.
    pub fn new(stat_interval: Duration, threshold: u64, mut window: Window) -> Result<Self> {
        let stat_interval = TimeDelta::from_std(stat_interval)
            .map_err(|e| SynclimitError::InvalidLimiter(format!("stat interval: {}", e)))?;
        if stat_interval.num_milliseconds() <= 0 {
            return Err(SynclimitError::InvalidLimiter(
                "stat interval must be at least one millisecond".to_string(),
            ));
        }
        let threshold = i64::try_from(threshold)
            .ok()
            .filter(|t| *t > 0)
            .ok_or_else(|| {
                SynclimitError::InvalidLimiter(format!("threshold out of range: {}", threshold))
            })?;

        let start = bucket_start(window.start_time(), stat_interval);
        window.reset(start, window.count());
        let mut prev = window.detached();
        prev.reset(start - stat_interval, 0);

        Ok(Self {
            stat_interval,
            threshold,
            limit_evenly: false,
            windows: Mutex::new(Windows { curr: window, prev }),
        })
    }

    /// Enforce a minimum spacing of `stat_interval / threshold` between admissions.
    pub fn with_limit_evenly(mut self, limit_evenly: bool) -> Self {
        self.limit_evenly = limit_evenly;
        self
    }

    pub fn threshold(&self) -> u64 {
        self.threshold as u64
    }

    pub fn stat_interval(&self) -> Duration {
        self.stat_interval.to_std().unwrap_or_default()
    }

    pub fn limit_evenly(&self) -> bool {
        self.limit_evenly
    }

    /// Admit one unit of work now.
    pub fn allow(&self) -> bool {
        self.allow_n(Utc::now(), 1)
    }

    /// Decide whether `n` units of work may be admitted at `now`.
    pub fn allow_n(&self, now: DateTime<Utc>, n: u32) -> bool {
        let mut windows = self.windows.lock();
        let allowed = self.decide(&mut windows, now, i64::from(n));
        windows.curr.sync(now);
        allowed
    }

    /// The current bucket's counters.
    pub fn current(&self) -> WindowSnapshot {
        self.windows.lock().curr.snapshot()
    }

    /// The previous bucket's counters.
    pub fn previous(&self) -> WindowSnapshot {
        self.windows.lock().prev.snapshot()
    }

    /// Stop reconciling with the shared store.
    pub fn stop_sync(&self) {
        self.windows.lock().curr.stop_sync();
    }

    fn decide(&self, windows: &mut Windows, now: DateTime<Utc>, n: i64) -> bool {
        if self.limit_evenly && self.too_soon(&windows.curr, now) {
            trace!(key = %windows.curr.key(), "Rejected by pacing");
            return false;
        }

        self.rotate(windows, now);

        let estimate = self.estimate(windows, now);
        if estimate + n > self.threshold {
            debug!(
                key = %windows.curr.key(),
                estimate,
                hits = n,
                threshold = self.threshold,
                "Rate limit exceeded"
            );
            return false;
        }

        windows.curr.add_count(n, now);
        true
    }

    fn too_soon(&self, curr: &Window, now: DateTime<Utc>) -> bool {
        let Some(last) = curr.last_time() else {
            return false;
        };
        let spacing_ms = self.stat_interval.num_milliseconds() / self.threshold;
        (now - last).num_milliseconds() < spacing_ms
    }

    fn rotate(&self, windows: &mut Windows, now: DateTime<Utc>) {
        let new_start = bucket_start(now, self.stat_interval);
        let span = (new_start - windows.curr.start_time()).num_milliseconds()
            / self.stat_interval.num_milliseconds();
        if span < 1 {
            return;
        }

        // Only an adjacent bucket carries over; after a gap the previous one is empty.
        let prev_count = if span == 1 { windows.curr.count() } else { 0 };
        windows.prev.reset(new_start - self.stat_interval, prev_count);
        windows.curr.reset(new_start, 0);

        trace!(
            key = %windows.curr.key(),
            start = new_start.timestamp_millis(),
            span,
            prev_count,
            "Rotated window"
        );
    }

    fn estimate(&self, windows: &Windows, now: DateTime<Utc>) -> i64 {
        let interval_ms = self.stat_interval.num_milliseconds() as f64;
        let elapsed_ms = (now - windows.curr.start_time()).num_milliseconds() as f64;
        let weight = ((interval_ms - elapsed_ms) / interval_ms).clamp(0.0, 1.0);

        let carried = (weight * windows.prev.count() as f64).floor() as i64;
        carried.max(0) + windows.curr.count()
    }
}

/// Start of the bucket containing `now`, aligned to the Unix epoch.
fn bucket_start(now: DateTime<Utc>, interval: TimeDelta) -> DateTime<Utc> {
    // Only fails for timestamps outside chrono's nanosecond range.
    now.duration_trunc(interval).unwrap_or(now)
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("stat_interval", &self.stat_interval)
            .field("threshold", &self.threshold)
            .field("limit_evenly", &self.limit_evenly)
            .finish()
    }
}
