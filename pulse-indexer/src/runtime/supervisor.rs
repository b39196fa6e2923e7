//! Tail-follow loop and the restart supervisor.
//!
//! # Supervisor state machine
//!
//! ```text
//! RUNNING ──(error / panic)──▶ CRASHED ──▶ RESTARTING(3s) ──▶ RUNNING
//!    │
//!    └──(cancellation)──▶ terminal
//! ```
//!
//! Long-lived tasks (sequencer, tail-follow) run inside
//! [`run_supervised`]; a crash emits an `engine_panic` event, waits
//! three seconds and re-enters unless the root token is cancelled.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use evm_pool::ClientPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::control::lazy::LazyManager;
use crate::control::oracle::HeightOracle;
use crate::error::AppError;
use crate::events::EventHub;
use crate::pipeline::FetcherHandle;
use crate::types::events::{IndexerEvent, PanicEvent};
use crate::types::primitives::BlockNumber;

/// Delay between crash and restart.
const RESTART_DELAY: Duration = Duration::from_secs(3);

// ═══════════════════════════════════════════════════════════════════════════════
// SUPERVISOR
// ═══════════════════════════════════════════════════════════════════════════════

/// Run a task in a restart loop until the token is cancelled.
///
/// The factory is invoked per attempt; panics inside the task are
/// caught at the join boundary and treated like errors.
pub async fn run_supervised<F, Fut>(
    name: &'static str,
    cancel: CancellationToken,
    hub: EventHub,
    factory: F,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = crate::error::Result<()>> + Send + 'static,
{
    loop {
        if cancel.is_cancelled() {
            return;
        }
        info!(worker = name, "supervised task running");

        let outcome = tokio::spawn(factory()).await;
        if cancel.is_cancelled() {
            return;
        }

        let rendered = match outcome {
            Ok(Ok(())) => {
                // Long-lived tasks only return cleanly on shutdown;
                // anything else is a crash worth restarting.
                "task returned unexpectedly".to_string()
            }
            Ok(Err(AppError::ShutdownRequested)) => return,
            Ok(Err(err)) => err.to_string(),
            Err(join_err) if join_err.is_panic() => format!("panic: {join_err}"),
            Err(join_err) => join_err.to_string(),
        };

        error!(worker = name, error = %rendered, "supervised task crashed");
        hub.emit(IndexerEvent::EnginePanic(PanicEvent {
            worker: name.to_string(),
            error: rendered,
        }));

        warn!(worker = name, delay_secs = RESTART_DELAY.as_secs(), "restarting");
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(RESTART_DELAY) => {}
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TAIL-FOLLOW
// ═══════════════════════════════════════════════════════════════════════════════

/// Continuously schedules blocks near the chain head.
pub struct TailFollow {
    pool: Arc<ClientPool>,
    oracle: Arc<HeightOracle>,
    fetcher: FetcherHandle,
    lazy: Arc<LazyManager>,
    confirmation_depth: u64,
    poll_interval: Duration,
}

impl std::fmt::Debug for TailFollow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TailFollow")
            .field("confirmation_depth", &self.confirmation_depth)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl TailFollow {
    /// Create the tail-follow loop.
    #[must_use]
    pub fn new(
        pool: Arc<ClientPool>,
        oracle: Arc<HeightOracle>,
        fetcher: FetcherHandle,
        lazy: Arc<LazyManager>,
        confirmation_depth: u64,
        poll_interval: Duration,
    ) -> Self {
        Self {
            pool,
            oracle,
            fetcher,
            lazy,
            confirmation_depth,
            poll_interval,
        }
    }

    /// Sample the head and schedule the tail until cancellation.
    ///
    /// # Errors
    /// Never returns an error today; the signature matches the
    /// supervisor contract.
    pub async fn run(&self, cancel: CancellationToken) -> crate::error::Result<()> {
        info!(
            interval_ms = self.poll_interval.as_millis() as u64,
            depth = self.confirmation_depth,
            "tail-follow started"
        );
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    #[instrument(skip(self))]
    async fn tick(&self) {
        let head = match self.pool.latest_block_number().await {
            Ok(head) => BlockNumber::new(head),
            Err(err) => {
                debug!(error = %err, "head sample failed");
                return;
            }
        };

        self.oracle.set_chain_head(head);
        // Lag feeds the catch-up boost.
        self.pool.limiter().retune(self.oracle.lag());

        if !self.lazy.is_active() || self.fetcher.is_paused() {
            return;
        }

        let safe_head = BlockNumber::new(head.value().saturating_sub(self.confirmation_depth));
        let next = self
            .fetcher
            .last_scheduled()
            .next()
            .max(safe_head);

        // Never schedule past the head itself.
        if next > head {
            return;
        }

        match self.fetcher.schedule(next, head) {
            Ok(()) => debug!(from = %next, to = %head, "tail range scheduled"),
            Err(AppError::BackpressureBlocked { retry_after_ms }) => {
                debug!(retry_after_ms, "tail schedule refused, retrying next tick");
            }
            Err(err) => warn!(error = %err, "tail scheduling failed"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
