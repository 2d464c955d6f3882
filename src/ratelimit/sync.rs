//! Background reconciliation with the shared counter store.
//!
//! A [`Synchronizer`] moves every store call off the admission path. The caller
//! side and the worker task exchange one request and one response through two
//! capacity-1 mailboxes, using only non-blocking `try_send` / `try_recv` on the
//! caller side. At most one exchange is outstanding at a time.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::error::{Result, SynclimitError};
use crate::store::{CounterStore, StoreError};

/// Snapshot of a window sent to the store side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    /// Logical limiter key
    pub key: String,
    /// Bucket start, Unix milliseconds
    pub start: i64,
    /// Admissions counted locally in the bucket
    pub count: i64,
    /// Admissions not yet acknowledged by the store
    pub delta: i64,
    /// Exchange number, stamped by the synchronizer
    pub round: u64,
}

/// Result of one reconciliation round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncResponse {
    /// Whether the store call succeeded
    pub success: bool,
    /// Bucket start the response was computed for
    pub start: i64,
    /// Part of the local delta the store acknowledged
    pub local_delta: i64,
    /// Admissions contributed by other instances since the last round
    pub counterpart_delta: i64,
    /// Exchange number of the request this answers
    pub round: u64,
}

impl SyncResponse {
    /// An unsuccessful response, ignored by every window.
    pub fn failed() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncState {
    Idle,
    Requesting,
}

/// Caller-side handle of a reconciliation worker.
///
/// Dropping the synchronizer stops its worker.
pub struct Synchronizer {
    requests: mpsc::Sender<SyncRequest>,
    responses: mpsc::Receiver<SyncResponse>,
    shutdown: watch::Sender<bool>,
    sync_interval: TimeDelta,
    state: SyncState,
    last_synced: Option<DateTime<Utc>>,
    rounds: u64,
}

impl std::fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchronizer")
            .field("sync_interval", &self.sync_interval)
            .field("state", &self.state)
            .field("last_synced", &self.last_synced)
            .finish()
    }
}

impl Synchronizer {
    /// Spawn a worker on the current tokio runtime.
    pub fn start(store: Arc<dyn CounterStore>, sync_interval: Duration) -> Result<Self> {
        let handle = Handle::try_current().map_err(|_| SynclimitError::NoRuntime)?;
        Self::start_on(&handle, store, sync_interval)
    }

    /// Spawn a worker on the given runtime.
    pub fn start_on(
        handle: &Handle,
        store: Arc<dyn CounterStore>,
        sync_interval: Duration,
    ) -> Result<Self> {
        let sync_interval = TimeDelta::from_std(sync_interval)
            .map_err(|e| SynclimitError::InvalidLimiter(format!("sync interval: {}", e)))?;

        let (request_tx, request_rx) = mpsc::channel(1);
        let (response_tx, response_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        handle.spawn(run_worker(store, request_rx, response_tx, shutdown_rx));
        debug!(sync_interval_ms = sync_interval.num_milliseconds(), "Synchronizer started");

        Ok(Self {
            requests: request_tx,
            responses: response_rx,
            shutdown: shutdown_tx,
            sync_interval,
            state: SyncState::Idle,
            last_synced: None,
            rounds: 0,
        })
    }

    /// Signal the worker to exit. Idempotent.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    /// Whether a request is outstanding.
    pub fn is_requesting(&self) -> bool {
        self.state == SyncState::Requesting
    }

    /// Run one non-blocking step of the protocol.
    ///
    /// Hands `request()` to the worker when idle and the sync interval has
    /// elapsed, then returns a completed response if one is ready. Never waits.
    pub fn sync<F>(&mut self, now: DateTime<Utc>, request: F) -> Option<SyncResponse>
    where
        F: FnOnce() -> SyncRequest,
    {
        if self.could_sync(now) {
            let request = SyncRequest {
                round: self.rounds + 1,
                ..request()
            };
            match self.requests.try_send(request) {
                Ok(()) => {
                    self.rounds += 1;
                    self.state = SyncState::Requesting;
                    self.last_synced = Some(now);
                }
                Err(TrySendError::Full(req)) => {
                    trace!(key = %req.key, "Synchronizer busy, skipping round");
                }
                Err(TrySendError::Closed(req)) => {
                    trace!(key = %req.key, "Synchronizer stopped, skipping round");
                }
            }
        }

        if self.state == SyncState::Requesting {
            match self.responses.try_recv() {
                Ok(response) => {
                    self.state = SyncState::Idle;
                    return Some(response);
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    self.state = SyncState::Idle;
                }
            }
        }

        None
    }

    fn could_sync(&self, now: DateTime<Utc>) -> bool {
        self.state == SyncState::Idle
            && self
                .last_synced
                .map_or(true, |last| now - last >= self.sync_interval)
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Last store total observed for a bucket.
#[derive(Debug, Default)]
struct Baseline {
    start: i64,
    total: i64,
}

async fn run_worker(
    store: Arc<dyn CounterStore>,
    mut requests: mpsc::Receiver<SyncRequest>,
    responses: mpsc::Sender<SyncResponse>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut baseline = Baseline::default();

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            request = requests.recv() => {
                let Some(request) = request else {
                    break;
                };
                let response = reconcile(store.as_ref(), &request, &mut baseline).await;
                if responses.send(response).await.is_err() {
                    break;
                }
            }
        }
    }

    debug!("Synchronizer worker stopped");
}

/// Perform the single store call for a request.
///
/// Pushes the delta when there is one, otherwise only reads. The counterpart
/// delta is the growth of the store total since the previous round on the same
/// bucket, minus what this round contributed.
async fn reconcile(
    store: &dyn CounterStore,
    request: &SyncRequest,
    baseline: &mut Baseline,
) -> SyncResponse {
    let result = if request.delta > 0 {
        store.add(&request.key, request.start, request.delta).await
    } else {
        store.get(&request.key, request.start).await
    };

    let total = match result {
        Ok(total) => total,
        Err(StoreError::NotFound(key)) => {
            trace!(key = %key, "No shared counter yet");
            return SyncResponse::failed();
        }
        Err(err) => {
            warn!(
                key = %request.key,
                start = request.start,
                delta = request.delta,
                error = %err,
                "Reconciliation round failed"
            );
            return SyncResponse::failed();
        }
    };

    if baseline.start != request.start {
        *baseline = Baseline {
            start: request.start,
            total: 0,
        };
    }
    let counterpart_delta = total - request.delta - baseline.total;
    baseline.total = total;

    trace!(
        key = %request.key,
        start = request.start,
        count = request.count,
        delta = request.delta,
        total,
        counterpart_delta,
        "Reconciled window"
    );

    SyncResponse {
        success: true,
        start: request.start,
        local_delta: request.delta,
        counterpart_delta,
        round: request.round,
    }
}
