//! Concurrent block/log retrieval with rate limiting and pause/resume.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                             Fetcher                                │
//! │                                                                    │
//! │  schedule(a, b) ──▶ jobs channel ──▶ worker pool (N workers)       │
//! │       │                                  │                         │
//! │       │ watermark check                  │ per job:                │
//! │       │ 5s merge window                  │   limiter wait          │
//! │       │ range splitting                  │   getLogs (range)       │
//! │       │                                  │   header per block      │
//! │       ▼                                  ▼                         │
//! │  BackpressureBlocked            results channel (BlockData)        │
//! │                                          │                         │
//! │                                          ▼                         │
//! │                                      Sequencer                     │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Results are ordered by arrival, not height; ordering is the
//! sequencer's job. A full results channel blocks the workers, which
//! throttles RPC calls, which cascades to scheduling.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use alloy::rpc::types::Log;
use evm_pool::{ClientPool, LogFilter, PoolError};
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::FetcherSettings;
use crate::control::backpressure::BackpressureGauge;
use crate::error::{AppError, Result};
use crate::types::chain::{BlockData, BlockHeader};
use crate::types::primitives::BlockNumber;

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Window within which overlapping schedule requests are collapsed.
const MERGE_WINDOW: std::time::Duration = std::time::Duration::from_secs(5);

/// Jobs channel depth; small, scheduling is cheap to retry.
const JOBS_CAPACITY: usize = 256;

// ═══════════════════════════════════════════════════════════════════════════════
// FETCH JOB
// ═══════════════════════════════════════════════════════════════════════════════

/// An inclusive block range handed to one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FetchJob {
    from: u64,
    to: u64,
}

/// Split `[from, to]` into jobs no longer than `cap` blocks.
fn split_range(from: u64, to: u64, cap: u64) -> Vec<(u64, u64)> {
    let cap = cap.max(1);
    let mut jobs = Vec::new();
    let mut start = from;
    while start <= to {
        let end = start.saturating_add(cap - 1).min(to);
        jobs.push((start, end));
        if end == u64::MAX {
            break;
        }
        start = end + 1;
    }
    jobs
}

// ═══════════════════════════════════════════════════════════════════════════════
// SHARED STATE / HANDLE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
struct FetcherShared {
    pool: Arc<ClientPool>,
    gauge: Arc<BackpressureGauge>,
    settings: FetcherSettings,
    jobs_tx: mpsc::Sender<FetchJob>,
    paused: AtomicBool,
    resume_notify: Notify,
    last_scheduled: AtomicU64,
    /// Recently scheduled ranges, for the merge window.
    recent: Mutex<Vec<(u64, u64, Instant)>>,
    cancel: CancellationToken,
}

/// Cloneable control surface over the fetcher.
///
/// The sequencer uses it for gap refills and reorg suspension, the lazy
/// manager for pause/resume, tail-follow for head scheduling.
#[derive(Debug, Clone)]
pub struct FetcherHandle {
    shared: Arc<FetcherShared>,
}

impl FetcherHandle {
    /// Enqueue block numbers `[start, end]` for fetching.
    ///
    /// Overlapping requests within a 5-second window are collapsed, and
    /// ranges are split to honor both `max_sync_batch` and the provider
    /// `getLogs` ceiling.
    ///
    /// # Errors
    /// [`AppError::BackpressureBlocked`] when the results queue is above
    /// its watermark or the jobs queue is full; callers retry with
    /// exponential backoff.
    #[instrument(skip(self), fields(start = %start, end = %end))]
    pub fn schedule(&self, start: BlockNumber, end: BlockNumber) -> Result<()> {
        if start > end {
            return Ok(());
        }

        if let Err(backoff) = self.shared.gauge.admit() {
            return Err(AppError::BackpressureBlocked {
                retry_after_ms: u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
            });
        }

        let (from, to) = (start.value(), end.value());
        if self.is_duplicate(from, to) {
            debug!(from, to, "schedule collapsed by merge window");
            return Ok(());
        }

        let chunk = self
            .shared
            .settings
            .get_logs_range_cap
            .min(self.shared.settings.max_sync_batch);
        for (job_from, job_to) in split_range(from, to, chunk) {
            let job = FetchJob {
                from: job_from,
                to: job_to,
            };
            if self.shared.jobs_tx.try_send(job).is_err() {
                // Queue full: the caller backs off and re-schedules the
                // whole remainder; the merge window absorbs the overlap.
                return Err(AppError::BackpressureBlocked {
                    retry_after_ms: 100,
                });
            }
        }

        self.shared.last_scheduled.fetch_max(to, Ordering::Relaxed);
        self.remember(from, to);
        Ok(())
    }

    /// Highest block number ever scheduled.
    #[must_use]
    pub fn last_scheduled(&self) -> BlockNumber {
        BlockNumber::new(self.shared.last_scheduled.load(Ordering::Relaxed))
    }

    /// Stop dequeuing jobs. In-flight jobs drain normally.
    pub fn pause(&self) {
        if !self.shared.paused.swap(true, Ordering::SeqCst) {
            info!("fetcher paused");
        }
    }

    /// Resume dequeuing jobs.
    pub fn resume(&self) {
        if self.shared.paused.swap(false, Ordering::SeqCst) {
            info!("fetcher resumed");
        }
        self.shared.resume_notify.notify_waiters();
    }

    /// Whether the fetcher is currently paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Hot-swap the rate limiter bucket.
    pub fn set_rate_limit(&self, rps: u32) {
        self.shared.pool.set_rate_limit(rps);
    }

    fn is_duplicate(&self, from: u64, to: u64) -> bool {
        let now = Instant::now();
        let mut recent = self.shared.recent.lock();
        recent.retain(|&(_, _, at)| now.duration_since(at) < MERGE_WINDOW);
        recent
            .iter()
            .any(|&(r_from, r_to, _)| r_from <= from && to <= r_to)
    }

    fn remember(&self, from: u64, to: u64) {
        self.shared.recent.lock().push((from, to, Instant::now()));
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FETCHER
// ═══════════════════════════════════════════════════════════════════════════════

/// Worker pool pulling headers and logs for scheduled ranges.
#[derive(Debug)]
pub struct Fetcher {
    shared: Arc<FetcherShared>,
    jobs_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<FetchJob>>>,
    results_tx: mpsc::Sender<BlockData>,
}

impl Fetcher {
    /// Build a fetcher and the results channel the sequencer consumes.
    #[must_use]
    pub fn new(
        pool: Arc<ClientPool>,
        gauge: Arc<BackpressureGauge>,
        settings: FetcherSettings,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<BlockData>) {
        let (jobs_tx, jobs_rx) = mpsc::channel(JOBS_CAPACITY);
        let (results_tx, results_rx) = mpsc::channel(gauge.capacity());

        let shared = Arc::new(FetcherShared {
            pool,
            gauge,
            settings,
            jobs_tx,
            paused: AtomicBool::new(false),
            resume_notify: Notify::new(),
            last_scheduled: AtomicU64::new(0),
            recent: Mutex::new(Vec::new()),
            cancel,
        });

        (
            Self {
                shared,
                jobs_rx: Arc::new(tokio::sync::Mutex::new(jobs_rx)),
                results_tx,
            },
            results_rx,
        )
    }

    /// Control handle for other components.
    #[must_use]
    pub fn handle(&self) -> FetcherHandle {
        FetcherHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Spawn the worker pool. Workers exit on cancellation.
    pub fn spawn_workers(&self) {
        for worker_id in 0..self.shared.settings.concurrency.max(1) {
            let shared = Arc::clone(&self.shared);
            let jobs_rx = Arc::clone(&self.jobs_rx);
            let results_tx = self.results_tx.clone();
            tokio::spawn(async move {
                worker_loop(worker_id, shared, jobs_rx, results_tx).await;
            });
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WORKER
// ═══════════════════════════════════════════════════════════════════════════════

async fn worker_loop(
    worker_id: usize,
    shared: Arc<FetcherShared>,
    jobs_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<FetchJob>>>,
    results_tx: mpsc::Sender<BlockData>,
) {
    debug!(worker_id, "fetch worker started");
    loop {
        // A paused fetcher stops dequeuing; in-flight work has already
        // drained by the time we get back here.
        while shared.paused.load(Ordering::SeqCst) {
            tokio::select! {
                () = shared.cancel.cancelled() => return,
                () = shared.resume_notify.notified() => {}
            }
        }

        let job = {
            let mut rx = jobs_rx.lock().await;
            tokio::select! {
                () = shared.cancel.cancelled() => return,
                job = rx.recv() => job,
            }
        };
        let Some(job) = job else {
            debug!(worker_id, "jobs channel closed, worker exiting");
            return;
        };

        fetch_job(&shared, job, &results_tx).await;
    }
}

/// Fetch one range: logs once for the whole span, then a header per
/// block, and emit a `BlockData` for every height in the job.
#[instrument(skip(shared, results_tx), fields(from = job.from, to = job.to))]
async fn fetch_job(
    shared: &FetcherShared,
    job: FetchJob,
    results_tx: &mpsc::Sender<BlockData>,
) {
    let filter = LogFilter::range(job.from, job.to);
    let logs = match shared.pool.get_logs(filter).await {
        Ok(logs) => logs,
        Err(err) => {
            warn!(error = %err, "getLogs failed for range, emitting failed entries");
            for number in job.from..=job.to {
                emit(shared, results_tx, BlockData::failed(
                    BlockNumber::new(number),
                    format!("getLogs failed: {err}"),
                ))
                .await;
            }
            return;
        }
    };

    let mut by_block: std::collections::BTreeMap<u64, Vec<Log>> = std::collections::BTreeMap::new();
    for log in logs {
        if let Some(number) = log.block_number {
            by_block.entry(number).or_default().push(log);
        }
    }

    for number in job.from..=job.to {
        let block_logs = by_block.remove(&number).unwrap_or_default();
        let data = fetch_block(shared, number, block_logs).await;
        emit(shared, results_tx, data).await;
    }
}

async fn fetch_block(shared: &FetcherShared, number: u64, logs: Vec<Log>) -> BlockData {
    let mut last_err: Option<PoolError> = None;

    for attempt in 0..=shared.settings.header_retries {
        match shared.pool.get_block(number, true).await {
            Ok(Some(block)) => {
                let header = BlockHeader::from(&block);
                if header.is_self_referential() {
                    warn!(number, hash = %header.hash, "self-referential header rejected");
                    return BlockData::failed(
                        BlockNumber::new(number),
                        "self-referential header",
                    );
                }
                metrics::counter!("fetcher_blocks_fetched_total").increment(1);
                return BlockData::new(header, logs, block.transactions);
            }
            Ok(None) => {
                // Nil header. If the range query saw logs for this
                // height the sequencer can still use them; otherwise
                // report the failure so the gap logic drives a refetch.
                if logs.is_empty() {
                    warn!(number, "nil header from provider, skipping block");
                    return BlockData::failed(BlockNumber::new(number), "nil header");
                }
                warn!(number, logs = logs.len(), "nil header with logs, emitting headerless");
                return BlockData::headerless(BlockNumber::new(number), logs);
            }
            Err(err) if err.is_retryable() && attempt < shared.settings.header_retries => {
                debug!(number, attempt, error = %err, "transient header failure, retrying");
                last_err = Some(err);
            }
            Err(err) => {
                last_err = Some(err);
                break;
            }
        }
    }

    let reason = last_err.map_or_else(|| "unknown".to_string(), |e| e.to_string());
    BlockData::failed(BlockNumber::new(number), reason)
}

async fn emit(shared: &FetcherShared, results_tx: &mpsc::Sender<BlockData>, data: BlockData) {
    shared.gauge.incr();
    tokio::select! {
        () = shared.cancel.cancelled() => {
            shared.gauge.decr();
        }
        sent = results_tx.send(data) => {
            if sent.is_err() {
                shared.gauge.decr();
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use evm_pool::PoolConfig;

    fn settings() -> FetcherSettings {
        FetcherSettings {
            concurrency: 2,
            max_sync_batch: 500,
            get_logs_range_cap: 2000,
            header_retries: 1,
        }
    }

    fn test_fetcher(capacity: usize) -> (Fetcher, mpsc::Receiver<BlockData>, FetcherHandle) {
        // Pool never dialed in these tests; the URL is just a placeholder.
        let pool = ClientPool::from_urls(
            &["http://localhost:1".into()],
            PoolConfig::default(),
            CancellationToken::new(),
        )
        .unwrap();
        let gauge = Arc::new(BackpressureGauge::with_capacity(capacity));
        let (fetcher, results) =
            Fetcher::new(pool, gauge, settings(), CancellationToken::new());
        let handle = fetcher.handle();
        (fetcher, results, handle)
    }

    #[test]
    fn split_respects_cap() {
        assert_eq!(split_range(0, 4999, 2000), vec![(0, 1999), (2000, 3999), (4000, 4999)]);
        assert_eq!(split_range(10, 10, 2000), vec![(10, 10)]);
    }

    #[test]
    fn no_single_job_exceeds_provider_cap() {
        for (from, to) in split_range(0, 100_000, 2000) {
            assert!(to - from + 1 <= 2000);
        }
    }

    #[tokio::test]
    async fn schedule_rejects_above_watermark() {
        let (_fetcher, _results, handle) = test_fetcher(10);
        // Fill the gauge past its watermark by hand.
        for _ in 0..9 {
            handle.shared.gauge.incr();
        }

        let err = handle
            .schedule(BlockNumber::new(1), BlockNumber::new(5))
            .unwrap_err();
        assert!(matches!(err, AppError::BackpressureBlocked { .. }));
    }

    #[tokio::test]
    async fn merge_window_collapses_duplicate_ranges() {
        let (_fetcher, _results, handle) = test_fetcher(1000);

        handle
            .schedule(BlockNumber::new(100), BlockNumber::new(200))
            .unwrap();
        let before = handle.last_scheduled();

        // Fully covered by the range above, within the window.
        handle
            .schedule(BlockNumber::new(150), BlockNumber::new(180))
            .unwrap();
        assert_eq!(handle.last_scheduled(), before);
    }

    #[tokio::test]
    async fn inverted_range_is_a_noop() {
        let (_fetcher, _results, handle) = test_fetcher(1000);
        handle
            .schedule(BlockNumber::new(10), BlockNumber::new(5))
            .unwrap();
        assert_eq!(handle.last_scheduled().value(), 0);
    }

    #[tokio::test]
    async fn pause_and_resume_flip_state() {
        let (_fetcher, _results, handle) = test_fetcher(1000);
        assert!(!handle.is_paused());
        handle.pause();
        assert!(handle.is_paused());
        handle.resume();
        assert!(!handle.is_paused());
    }
}
