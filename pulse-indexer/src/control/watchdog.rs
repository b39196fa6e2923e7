//! Deadlock watchdog: stall detection and three-step realignment.
//!
//! The watchdog only ever mutates state in lab mode (chain 31337 or
//! demo override) - production deployments get the diagnosis, never
//! the surgery. On each tick it checks the sequencer's idle time and,
//! when the pipeline is provably wedged in a "space-time tear" (the
//! sequencer expects a block thousands behind the head while the store
//! is nearly empty), realigns in three steps:
//!
//! 1. `checkpoint = chain_head - 1`
//! 2. `sequencer.reset_expected(chain_head)`
//! 3. `sequencer.clear_buffer()`
//!
//! Counters are Prometheus-scrapable: `watchdog_triggered_total`,
//! `watchdog_success_total`, `watchdog_failure_total`.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::WatchdogSettings;
use crate::control::oracle::HeightOracle;
use crate::events::EventHub;
use crate::pipeline::SequencerHandle;
use crate::ports::IndexerStore;
use crate::types::events::{HealingEvent, IndexerEvent};
use crate::types::primitives::BlockNumber;

/// Head-to-expected distance that qualifies as a space-time tear.
const TEAR_THRESHOLD: u64 = 2000;

/// Outcome of a single watchdog tick, for tests and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogVerdict {
    /// Pipeline is making progress; nothing to do.
    Healthy,
    /// Idle, but the geometry does not match a known failure.
    StalledUnclassified,
    /// Realignment performed.
    Healed,
    /// Realignment attempted and failed.
    HealFailed,
}

/// Stall detector and self-healer over the sequencer and store.
///
/// # Type Parameters
///
/// * `S` - Store used to read/force the checkpoint
pub struct DeadlockWatchdog<S> {
    store: Arc<S>,
    sequencer: SequencerHandle,
    oracle: Arc<HeightOracle>,
    hub: EventHub,
    settings: WatchdogSettings,
    chain_id: u64,
    /// Interventions are gated to lab mode; never auto-mutate production.
    lab_mode: bool,
}

impl<S> std::fmt::Debug for DeadlockWatchdog<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadlockWatchdog")
            .field("chain_id", &self.chain_id)
            .field("lab_mode", &self.lab_mode)
            .finish_non_exhaustive()
    }
}

impl<S> DeadlockWatchdog<S>
where
    S: IndexerStore,
{
    /// Create a watchdog.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        sequencer: SequencerHandle,
        oracle: Arc<HeightOracle>,
        hub: EventHub,
        settings: WatchdogSettings,
        chain_id: u64,
        lab_mode: bool,
    ) -> Self {
        Self {
            store,
            sequencer,
            oracle,
            hub,
            settings,
            chain_id,
            lab_mode,
        }
    }

    /// Run the check loop until cancellation.
    pub async fn run(&self, cancel: CancellationToken) {
        if !self.settings.enabled {
            info!("watchdog disabled by configuration");
            return;
        }
        info!(
            interval_secs = self.settings.check_interval().as_secs(),
            stall_secs = self.settings.stall_threshold().as_secs(),
            lab_mode = self.lab_mode,
            "deadlock watchdog started"
        );
        let mut ticker = tokio::time::interval(self.settings.check_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let _ = self.check_once().await;
                }
            }
        }
    }

    /// One watchdog tick. Public so tests can drive it directly.
    #[instrument(skip(self))]
    pub async fn check_once(&self) -> WatchdogVerdict {
        let idle = self.sequencer.idle_time();
        if idle < self.settings.stall_threshold() {
            return WatchdogVerdict::Healthy;
        }

        let head = self.oracle.snapshot().chain_head;
        let expected = self.sequencer.expected_block();
        let max_stored = self
            .store
            .max_stored_block()
            .await
            .ok()
            .flatten()
            .unwrap_or(BlockNumber::new(0));
        let gap = head.distance_from(max_stored);

        warn!(
            idle_secs = idle.as_secs(),
            head = %head,
            expected = %expected,
            max_stored = %max_stored,
            gap,
            "sequencer idle past stall threshold"
        );

        if !self.lab_mode {
            // Safety rail: diagnosis only outside the lab.
            return WatchdogVerdict::StalledUnclassified;
        }

        // Space-time tear: the sequencer expects a block far behind the
        // head while the store holds (almost) nothing - the classic
        // wiped-database-under-a-running-indexer shape.
        let tear = head.distance_from(expected) > TEAR_THRESHOLD && max_stored < expected;
        if !tear {
            debug!("stall does not match a known failure geometry");
            return WatchdogVerdict::StalledUnclassified;
        }

        metrics::counter!("watchdog_triggered_total").increment(1);
        match self.realign(head, expected).await {
            Ok(()) => {
                metrics::counter!("watchdog_success_total").increment(1);
                WatchdogVerdict::Healed
            }
            Err(e) => {
                metrics::counter!("watchdog_failure_total").increment(1);
                error!(error = %e, "watchdog realignment failed");
                WatchdogVerdict::HealFailed
            }
        }
    }

    /// The three-step realignment.
    async fn realign(&self, head: BlockNumber, before: BlockNumber) -> crate::error::Result<()> {
        warn!(head = %head, expected = %before, "space-time tear, realigning");

        // 1. Checkpoint to just below the head.
        self.store.set_checkpoint(self.chain_id, head.prev()).await?;
        // 2. Point the sequencer at the head.
        self.sequencer.reset_expected(head);
        // 3. Drop everything buffered against the old timeline.
        self.sequencer.clear_buffer();

        self.hub.emit(IndexerEvent::SystemHealing(HealingEvent {
            reason: "space-time tear".into(),
            before,
            after: head,
        }));
        info!(resumed_at = %head, "watchdog realignment complete");
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
