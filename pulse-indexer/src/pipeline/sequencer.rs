//! Deterministic ordering with gap detection, bypass and reorg recovery.
//!
//! The sequencer is a single task; its serial discipline is what turns
//! the fetcher's arrival-ordered output into strictly monotonic
//! processing. Do not parallelize it - order is the whole point.
//!
//! # Algorithm
//!
//! ```text
//! on BlockData d:
//!   d.number < expected  → drop (already processed)
//!   d.number = expected  → process; expected++; drain consecutive buffer
//!   d.number > expected  → buffer; gap logic may request a refill
//!
//! gap persists past the detect window → re-schedule [expected, lowest)
//! 3 failed refills → bypass (lab) or alert (production)
//! reorg from processor → pause fetcher, roll back, clear, resume
//! ```
//!
//! The watchdog reaches in through [`SequencerHandle`]; interventions
//! take the same mutex as the run loop, so `reset_expected` and
//! `clear_buffer` are serialized against block processing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::SequencerSettings;
use crate::control::backpressure::BackpressureGauge;
use crate::control::oracle::HeightOracle;
use crate::error::{AppError, ReorgError, Result};
use crate::events::EventHub;
use crate::pipeline::fetcher::FetcherHandle;
use crate::pipeline::processor::Processor;
use crate::ports::{IndexerStore, SkippedRange};
use crate::types::chain::BlockData;
use crate::types::events::{IndexerEvent, LinearityStatus};
use crate::types::primitives::BlockNumber;

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Housekeeping cadence for gap/stall checks.
const TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Grace period for draining buffered blocks on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

// ═══════════════════════════════════════════════════════════════════════════════
// SHARED STATE / HANDLE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
struct SeqState {
    expected: BlockNumber,
    buffer: BTreeMap<u64, BlockData>,
    last_progress: Instant,
    gap_first_seen: Option<Instant>,
    gap_fill_count: u32,
}

impl SeqState {
    fn new(start: BlockNumber) -> Self {
        Self {
            expected: start,
            buffer: BTreeMap::new(),
            last_progress: Instant::now(),
            gap_first_seen: None,
            gap_fill_count: 0,
        }
    }

    fn lowest_buffered(&self) -> Option<BlockNumber> {
        self.buffer.keys().next().copied().map(BlockNumber::new)
    }

    fn mark_progress(&mut self) {
        self.last_progress = Instant::now();
        self.gap_first_seen = None;
        self.gap_fill_count = 0;
    }
}

/// Watchdog-facing surface over the sequencer state.
///
/// All methods take the same mutex as the run loop.
#[derive(Debug, Clone)]
pub struct SequencerHandle {
    state: Arc<Mutex<SeqState>>,
}

impl SequencerHandle {
    /// Standalone handle for exercising watchdog interventions without
    /// a running sequencer.
    #[cfg(any(test, feature = "test-utils"))]
    #[must_use]
    pub fn new_for_tests(start: BlockNumber) -> Self {
        Self {
            state: Arc::new(Mutex::new(SeqState::new(start))),
        }
    }

    /// Time since the last processed block.
    #[must_use]
    pub fn idle_time(&self) -> Duration {
        self.state.lock().last_progress.elapsed()
    }

    /// The next block number the processor will receive.
    #[must_use]
    pub fn expected_block(&self) -> BlockNumber {
        self.state.lock().expected
    }

    /// Number of buffered out-of-order blocks.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.state.lock().buffer.len()
    }

    /// Force the expected block (watchdog realignment).
    pub fn reset_expected(&self, block: BlockNumber) {
        let mut state = self.state.lock();
        warn!(from = %state.expected, to = %block, "expected block reset");
        state.expected = block;
        state.mark_progress();
    }

    /// Drop every buffered entry (watchdog realignment).
    pub fn clear_buffer(&self) {
        let mut state = self.state.lock();
        let dropped = state.buffer.len();
        state.buffer.clear();
        if dropped > 0 {
            warn!(dropped, "sequencer buffer cleared");
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SEQUENCER
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration resolved at startup (settings + mode flags).
#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// Tunables from the settings file.
    pub settings: SequencerSettings,
    /// Whether unfillable gaps may be bypassed.
    pub bypass_enabled: bool,
    /// Lab mode allows the forced skip on stall.
    pub lab_mode: bool,
    /// Processor batch size for buffer drains.
    pub batch_size: usize,
}

/// Single-task orderer between fetcher and processor.
pub struct Sequencer<S> {
    state: Arc<Mutex<SeqState>>,
    config: SequencerConfig,
    processor: Arc<Processor<S>>,
    store: Arc<S>,
    fetcher: FetcherHandle,
    gauge: Arc<BackpressureGauge>,
    oracle: Arc<HeightOracle>,
    hub: EventHub,
    chain_id: u64,
}

impl<S> std::fmt::Debug for Sequencer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequencer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S> Sequencer<S>
where
    S: IndexerStore,
{
    /// Build a sequencer starting at `start`.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        start: BlockNumber,
        config: SequencerConfig,
        processor: Arc<Processor<S>>,
        store: Arc<S>,
        fetcher: FetcherHandle,
        gauge: Arc<BackpressureGauge>,
        oracle: Arc<HeightOracle>,
        hub: EventHub,
        chain_id: u64,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(SeqState::new(start))),
            config,
            processor,
            store,
            fetcher,
            gauge,
            oracle,
            hub,
            chain_id,
        }
    }

    /// The watchdog-facing handle.
    #[must_use]
    pub fn handle(&self) -> SequencerHandle {
        SequencerHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Consume the results channel until cancellation.
    ///
    /// Takes the receiver by reference so the supervisor can restart
    /// the loop without losing buffered results.
    ///
    /// # Errors
    /// Returns an error only on unrecoverable internal failures; the
    /// supervisor restarts the loop in that case.
    pub async fn run(
        &self,
        results: &mut mpsc::Receiver<BlockData>,
        cancel: CancellationToken,
    ) -> Result<()> {
        info!(start = %self.handle().expected_block(), "sequencer started");
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    self.drain_on_shutdown().await;
                    return Ok(());
                }
                maybe = results.recv() => {
                    let Some(data) = maybe else {
                        debug!("results channel closed");
                        return Ok(());
                    };
                    self.gauge.decr();
                    self.on_block(data).await?;
                }
                _ = ticker.tick() => {
                    self.on_tick().await?;
                }
            }
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // BLOCK HANDLING
    // ───────────────────────────────────────────────────────────────────────────

    #[instrument(skip(self, data), fields(number = %data.number))]
    async fn on_block(&self, data: BlockData) -> Result<()> {
        let expected = self.handle().expected_block();

        if data.number < expected {
            debug!("stale block dropped");
            return Ok(());
        }

        if data.number > expected {
            if self.buffer_ahead(data) {
                // Buffer ceiling reached with bypass allowed: skip ahead
                // rather than letting memory grow without bound.
                self.gap_exhausted(expected).await?;
            }
            return Ok(());
        }

        // data.number == expected
        if data.is_ok() {
            self.process_ready(vec![data]).await?;
            self.drain_buffer().await?;
        } else {
            self.on_fetch_failure(expected).await?;
        }
        Ok(())
    }

    /// Buffer an ahead-of-order arrival. Returns `true` when the buffer
    /// ceiling was hit and a bypass escalation is due.
    fn buffer_ahead(&self, data: BlockData) -> bool {
        let mut state = self.state.lock();
        let at_cap = state.buffer.len() >= self.config.settings.buffer_cap;
        if at_cap {
            warn!(
                cap = self.config.settings.buffer_cap,
                "sequencer buffer at capacity"
            );
            if !self.config.bypass_enabled {
                // Production: refuse the newest arrival and alert; the
                // tail-follow loop re-schedules it once the gap heals.
                drop(state);
                self.emit_linearity();
                return false;
            }
        }
        if state.gap_first_seen.is_none() {
            state.gap_first_seen = Some(Instant::now());
        }
        state.buffer.insert(data.number.value(), data);
        at_cap
    }

    /// Process a run of ready, consecutive blocks.
    async fn process_ready(&self, blocks: Vec<BlockData>) -> Result<()> {
        let Some(last) = blocks.last().map(|b| b.number) else {
            return Ok(());
        };

        match self.processor.process_batch(&blocks).await {
            Ok(()) => {
                let mut state = self.state.lock();
                state.expected = last.next();
                state.mark_progress();
                Ok(())
            }
            Err(AppError::Reorg(reorg)) => {
                self.handle_reorg(&reorg).await?;
                Ok(())
            }
            Err(err) if err.is_block_local() => {
                // Persistence failed; the blocks are retried from the
                // fetcher on re-schedule. expected does not advance.
                let first = blocks.first().map_or(last, |b| b.number);
                warn!(error = %err, from = %first, to = %last, "processing failed, re-scheduling");
                self.request_refill(first, last.next());
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Drain consecutive buffered entries in processor-batch chunks.
    async fn drain_buffer(&self) -> Result<()> {
        loop {
            let batch = {
                let mut state = self.state.lock();
                let mut batch = Vec::new();
                while batch.len() < self.config.batch_size.max(1) {
                    let next = state.expected.value() + batch.len() as u64;
                    let Some(entry) = state.buffer.get(&next) else { break };
                    if !entry.is_ok() {
                        break;
                    }
                    // Checked is_ok above; remove returns the same entry.
                    if let Some(data) = state.buffer.remove(&next) {
                        batch.push(data);
                    }
                }
                batch
            };

            if batch.is_empty() {
                // A buffered failed entry at the head still needs refetch.
                let failed_at_head = {
                    let state = self.state.lock();
                    state
                        .buffer
                        .get(&state.expected.value())
                        .is_some_and(|d| !d.is_ok())
                };
                if failed_at_head {
                    let expected = {
                        let mut state = self.state.lock();
                        let expected_value = state.expected.value();
                        state.buffer.remove(&expected_value);
                        state.expected
                    };
                    self.on_fetch_failure(expected).await?;
                }
                return Ok(());
            }

            self.process_ready(batch).await?;
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // GAPS, FAILURES, BYPASS
    // ───────────────────────────────────────────────────────────────────────────

    /// The expected block itself could not be fetched.
    async fn on_fetch_failure(&self, expected: BlockNumber) -> Result<()> {
        let attempts = {
            let mut state = self.state.lock();
            state.gap_fill_count += 1;
            state.gap_fill_count
        };

        if attempts < self.config.settings.max_gap_fill_attempts {
            debug!(block = %expected, attempts, "re-scheduling failed block");
            self.request_refill(expected, expected.next());
            return Ok(());
        }

        self.gap_exhausted(expected).await
    }

    /// Refill attempts are exhausted: bypass in lab mode, alert in
    /// production.
    async fn gap_exhausted(&self, from: BlockNumber) -> Result<()> {
        let to = self
            .handle_lowest_buffered()
            .unwrap_or_else(|| from.next());

        if !self.config.bypass_enabled {
            error!(from = %from, to = %to, "unfillable gap; bypass disabled, alerting");
            self.emit_linearity();
            // Keep trying: production liveness comes from the provider
            // eventually answering, not from skipping data.
            self.request_refill(from, to);
            return Ok(());
        }

        warn!(from = %from, to = %to, "bypassing unfillable gap");
        metrics::counter!("sequencer_bypass_total").increment(1);
        self.store
            .record_skip(SkippedRange {
                from,
                to,
                reason: "gap_bypass".into(),
            })
            .await?;

        {
            let mut state = self.state.lock();
            state.expected = to;
            state.mark_progress();
        }
        self.emit_linearity();

        // Schedule an asynchronous repair attempt for the skipped range.
        self.request_refill(from, to);

        Box::pin(self.drain_buffer()).await
    }

    fn handle_lowest_buffered(&self) -> Option<BlockNumber> {
        self.state.lock().lowest_buffered()
    }

    /// Ask the fetcher for `[from, to)` again, tolerating backpressure.
    fn request_refill(&self, from: BlockNumber, to: BlockNumber) {
        if to <= from {
            return;
        }
        match self.fetcher.schedule(from, to.prev()) {
            Ok(()) => {}
            Err(AppError::BackpressureBlocked { retry_after_ms }) => {
                debug!(retry_after_ms, "refill deferred by backpressure");
            }
            Err(err) => warn!(error = %err, "refill scheduling failed"),
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // TICK: GAP WINDOW + STALL DETECTION
    // ───────────────────────────────────────────────────────────────────────────

    async fn on_tick(&self) -> Result<()> {
        let (gap_request, stalled) = {
            let mut state = self.state.lock();
            let gap_request = state.lowest_buffered().and_then(|lowest| {
                let gap = lowest.distance_from(state.expected);
                let persisted = state
                    .gap_first_seen
                    .is_some_and(|at| at.elapsed() >= self.config.settings.gap_detect_window());
                if gap > self.config.settings.gap_threshold && persisted {
                    state.gap_first_seen = Some(Instant::now());
                    state.gap_fill_count += 1;
                    Some((state.expected, lowest, state.gap_fill_count))
                } else {
                    None
                }
            });
            let stalled =
                state.last_progress.elapsed() >= self.config.settings.stall_threshold();
            (gap_request, stalled)
        };

        if let Some((expected, lowest, attempts)) = gap_request {
            if attempts >= self.config.settings.max_gap_fill_attempts {
                self.gap_exhausted(expected).await?;
            } else {
                info!(
                    from = %expected,
                    to = %lowest,
                    attempts,
                    "gap detected, requesting refill"
                );
                self.request_refill(expected, lowest);
            }
        }

        if stalled {
            self.on_stall().await?;
        }
        Ok(())
    }

    async fn on_stall(&self) -> Result<()> {
        let handle = self.handle();
        warn!(
            expected = %handle.expected_block(),
            idle_secs = handle.idle_time().as_secs(),
            buffered = handle.buffered(),
            "sequencer stalled"
        );
        self.emit_linearity();

        // Lab mode trades exactness for liveness with a forced skip.
        if self.config.lab_mode {
            if let Some(lowest) = self.handle_lowest_buffered() {
                let expected = handle.expected_block();
                if lowest > expected {
                    warn!(from = %expected, to = %lowest, "forced skip after stall");
                    return self.gap_exhausted(expected).await;
                }
            }
            // Nothing buffered: progress depends on new schedules, so
            // reset the clock instead of skipping into the void.
            self.state.lock().mark_progress();
        }
        Ok(())
    }

    fn emit_linearity(&self) {
        let state = self.state.lock();
        self.hub.emit(IndexerEvent::LinearityStatus(LinearityStatus {
            expected_block: state.expected,
            buffered: state.buffer.len(),
            gap_fill_count: state.gap_fill_count,
        }));
    }

    // ───────────────────────────────────────────────────────────────────────────
    // REORG REALIGNMENT
    // ───────────────────────────────────────────────────────────────────────────

    /// Five-step recovery: pause, roll back, clear, reset, resume.
    #[instrument(skip(self), fields(at = %reorg.at_block))]
    async fn handle_reorg(&self, reorg: &ReorgError) -> Result<()> {
        let divergence = reorg.at_block;
        warn!(
            expected_parent = %reorg.expected_parent,
            observed_parent = %reorg.observed_parent,
            "reorg detected, realigning"
        );

        // 1. Stop new fetches landing mid-rollback.
        self.fetcher.pause();

        // 2. Delete persisted blocks at and above the divergence point;
        //    transfers cascade, the checkpoint rewinds.
        self.store.rollback_to(self.chain_id, divergence).await?;

        // 3. Drop buffered entries at and above the divergence.
        {
            let mut state = self.state.lock();
            state.buffer.retain(|&n, _| n < divergence.value());
            // 4. Reprocess from the divergence point.
            state.expected = divergence;
            state.mark_progress();
        }
        self.oracle.set_sync_cursor(divergence.prev());

        // 5. Resume fetching the replacement chain.
        self.fetcher.resume();
        let head = self.oracle.snapshot().chain_head;
        if head >= divergence {
            self.request_refill(divergence, head.next());
        }

        self.emit_linearity();
        info!(divergence = %divergence, "reorg realignment complete");
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────────────────
    // SHUTDOWN
    // ───────────────────────────────────────────────────────────────────────────

    /// Drain whatever consecutive blocks are already buffered, bounded
    /// by the grace deadline.
    async fn drain_on_shutdown(&self) {
        info!("draining sequencer buffer before shutdown");
        let result = tokio::time::timeout(SHUTDOWN_GRACE, self.drain_buffer()).await;
        match result {
            Ok(Ok(())) => info!("shutdown drain complete"),
            Ok(Err(e)) => warn!(error = %e, "shutdown drain failed"),
            Err(_) => warn!("shutdown drain exceeded grace period"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
//
// End-to-end ordering scenarios live in tests/pipeline.rs; these cover
// the state surface the watchdog depends on.

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_reset_and_clear_share_state() {
        let state = Arc::new(Mutex::new(SeqState::new(BlockNumber::new(10))));
        let handle = SequencerHandle {
            state: Arc::clone(&state),
        };

        state
            .lock()
            .buffer
            .insert(15, BlockData::failed(BlockNumber::new(15), "x"));

        assert_eq!(handle.expected_block().value(), 10);
        assert_eq!(handle.buffered(), 1);

        handle.reset_expected(BlockNumber::new(100));
        handle.clear_buffer();

        assert_eq!(state.lock().expected.value(), 100);
        assert!(state.lock().buffer.is_empty());
    }

    #[test]
    fn idle_time_tracks_progress() {
        let state = Arc::new(Mutex::new(SeqState::new(BlockNumber::new(0))));
        let handle = SequencerHandle { state };
        assert!(handle.idle_time() < Duration::from_secs(1));
    }

    #[test]
    fn lowest_buffered_is_ordered() {
        let mut state = SeqState::new(BlockNumber::new(0));
        state
            .buffer
            .insert(20, BlockData::failed(BlockNumber::new(20), "x"));
        state
            .buffer
            .insert(12, BlockData::failed(BlockNumber::new(12), "x"));
        assert_eq!(state.lowest_buffered(), Some(BlockNumber::new(12)));
    }
}
