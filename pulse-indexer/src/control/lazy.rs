//! Activity-driven run/pause decisions.
//!
//! When nobody is looking - no API traffic, no heartbeats, no fresh
//! blocks being consumed - there is no reason to hammer the provider.
//! The lazy manager pauses the fetcher after an idle window and resumes
//! it on the next sign of life. Chain 31337 and the explicit override
//! keep the pipeline always active.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{LAB_CHAIN_ID, LazySettings};
use crate::events::EventHub;
use crate::pipeline::FetcherHandle;
use crate::types::events::{IndexerEvent, LazyStatus};

/// Decision cadence.
const DECIDE_INTERVAL: Duration = Duration::from_secs(1);

/// Process-wide activity tracker driving fetcher pause/resume.
#[derive(Debug)]
pub struct LazyManager {
    last_activity: Mutex<Instant>,
    always_active: bool,
    idle_timeout: Duration,
    /// Current state; `true` = active. Transitions are logged once.
    active: AtomicBool,
}

impl LazyManager {
    /// Build from settings; chain 31337 or the explicit override pin
    /// the manager to always-active.
    #[must_use]
    pub fn new(chain_id: u64, settings: &LazySettings) -> Self {
        let always_active =
            chain_id == LAB_CHAIN_ID || settings.force_always_active || settings.demo_mode;
        Self {
            last_activity: Mutex::new(Instant::now()),
            always_active,
            idle_timeout: settings.idle_timeout(),
            active: AtomicBool::new(true),
        }
    }

    /// Record activity: an API/WS request, a heartbeat, or a freshly
    /// processed block.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Seconds since the last recorded activity.
    #[must_use]
    pub fn idle(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Whether the pipeline is currently held active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Run the 1-second decision loop until cancellation.
    pub async fn run(
        self: Arc<Self>,
        fetcher: FetcherHandle,
        hub: EventHub,
        cancel: CancellationToken,
    ) {
        info!(
            always_active = self.always_active,
            idle_timeout_secs = self.idle_timeout.as_secs(),
            "lazy manager started"
        );
        let mut ticker = tokio::time::interval(DECIDE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = ticker.tick() => self.decide(&fetcher, &hub),
            }
        }
    }

    /// One decision: transitions are idempotent and only logged when
    /// the state actually flips.
    fn decide(&self, fetcher: &FetcherHandle, hub: &EventHub) {
        let idle = self.idle();
        let should_be_active = self.always_active || idle < self.idle_timeout;

        let was_active = self.active.swap(should_be_active, Ordering::SeqCst);
        if was_active == should_be_active {
            // Steady state. No fetcher call: a reorg-suspended fetcher
            // must stay paused until the sequencer resumes it.
            return;
        }

        if should_be_active {
            info!("activity resumed, waking fetcher");
            fetcher.resume();
        } else {
            info!(idle_secs = idle.as_secs(), "idle timeout, pausing fetcher");
            fetcher.pause();
        }
        debug!(active = should_be_active, "lazy state transition");
        hub.emit(IndexerEvent::LazyStatus(LazyStatus {
            state: if should_be_active { "active" } else { "sleep" }.into(),
            idle_secs: idle.as_secs(),
        }));
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(idle_secs: u64) -> LazySettings {
        LazySettings {
            demo_mode: false,
            force_always_active: false,
            idle_timeout_secs: idle_secs,
        }
    }

    #[test]
    fn lab_chain_is_always_active() {
        let manager = LazyManager::new(LAB_CHAIN_ID, &settings(300));
        assert!(manager.always_active);
    }

    #[test]
    fn force_override_is_always_active() {
        let mut cfg = settings(300);
        cfg.force_always_active = true;
        let manager = LazyManager::new(1, &cfg);
        assert!(manager.always_active);
    }

    #[test]
    fn mainnet_defaults_to_lazy() {
        let manager = LazyManager::new(1, &settings(300));
        assert!(!manager.always_active);
    }

    #[test]
    fn touch_resets_idle_clock() {
        let manager = LazyManager::new(1, &settings(300));
        std::thread::sleep(Duration::from_millis(10));
        assert!(manager.idle() >= Duration::from_millis(10));
        manager.touch();
        assert!(manager.idle() < Duration::from_millis(10));
    }
}
