//! Memory-aware channel sizing and schedule refusal.
//!
//! Channel capacity is derived from available system memory at startup:
//! `min(100_000, mem_gb * 1000)`, watermark at 80%. The results channel
//! stays the natural blocking backpressure point; this layer adds an
//! explicit, advisory refusal for `schedule` callers that can back off
//! instead of blocking.
//!
//! Retry guidance follows `100ms * 2^k`, capped at 3.2s; the level
//! resets once depth drops back below the watermark.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use tracing::info;

/// Hard ceiling on the results-channel capacity.
const MAX_CAPACITY: usize = 100_000;

/// Base backoff for refused schedules.
const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Backoff cap (100ms * 2^5).
const BACKOFF_CAP: Duration = Duration::from_millis(3200);

/// Capacity derived from total system memory.
#[must_use]
pub fn detect_capacity() -> usize {
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    let mem_gb = (system.total_memory() / (1024 * 1024 * 1024)).max(1);
    capacity_for_mem_gb(mem_gb)
}

/// `min(100_000, mem_gb * 1000)`, never below 1000.
#[must_use]
pub fn capacity_for_mem_gb(mem_gb: u64) -> usize {
    usize::try_from(mem_gb.saturating_mul(1000))
        .unwrap_or(MAX_CAPACITY)
        .clamp(1000, MAX_CAPACITY)
}

// ═══════════════════════════════════════════════════════════════════════════════
// BACKPRESSURE GAUGE
// ═══════════════════════════════════════════════════════════════════════════════

/// Shared depth gauge for the results channel.
///
/// The fetcher increments on send and the sequencer decrements on
/// receive, so `schedule` can observe the real queue depth without
/// touching channel internals.
#[derive(Debug)]
pub struct BackpressureGauge {
    capacity: usize,
    watermark: usize,
    depth: AtomicUsize,
    /// Consecutive refused schedules, drives the advisory backoff.
    level: AtomicU32,
}

impl BackpressureGauge {
    /// Gauge sized from detected system memory.
    #[must_use]
    pub fn from_system() -> Self {
        let capacity = detect_capacity();
        info!(capacity, "sized results channel from system memory");
        Self::with_capacity(capacity)
    }

    /// Gauge with an explicit capacity; watermark at 80%.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            watermark: capacity * 4 / 5,
            depth: AtomicUsize::new(0),
            level: AtomicU32::new(0),
        }
    }

    /// Configured channel capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Refusal threshold (80% of capacity).
    #[must_use]
    pub const fn watermark(&self) -> usize {
        self.watermark
    }

    /// Current observed depth.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Record an enqueue.
    pub fn incr(&self) {
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!("results_channel_depth").set(depth as f64);
    }

    /// Record a dequeue.
    pub fn decr(&self) {
        let previous = self.depth.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(previous > 0, "gauge underflow");
        metrics::gauge!("results_channel_depth").set((previous.saturating_sub(1)) as f64);
        if previous.saturating_sub(1) < self.watermark {
            self.level.store(0, Ordering::Relaxed);
        }
    }

    /// Whether a new schedule should be admitted right now.
    ///
    /// Above the watermark the refusal escalates the backoff level and
    /// returns the advisory delay for the caller.
    pub fn admit(&self) -> Result<(), Duration> {
        if self.depth() < self.watermark {
            self.level.store(0, Ordering::Relaxed);
            return Ok(());
        }
        let level = self.level.fetch_add(1, Ordering::Relaxed).min(5);
        Err(backoff_for_level(level))
    }
}

/// `100ms * 2^level`, capped at 3.2s.
#[must_use]
pub fn backoff_for_level(level: u32) -> Duration {
    BACKOFF_BASE
        .saturating_mul(2_u32.saturating_pow(level))
        .min(BACKOFF_CAP)
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_scales_with_memory_and_caps() {
        assert_eq!(capacity_for_mem_gb(4), 4000);
        assert_eq!(capacity_for_mem_gb(64), 64_000);
        assert_eq!(capacity_for_mem_gb(512), 100_000);
        // Tiny machines still get a workable channel.
        assert_eq!(capacity_for_mem_gb(0), 1000);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_for_level(0), Duration::from_millis(100));
        assert_eq!(backoff_for_level(1), Duration::from_millis(200));
        assert_eq!(backoff_for_level(4), Duration::from_millis(1600));
        assert_eq!(backoff_for_level(5), Duration::from_millis(3200));
        assert_eq!(backoff_for_level(9), Duration::from_millis(3200));
    }

    #[test]
    fn admits_below_watermark() {
        let gauge = BackpressureGauge::with_capacity(10);
        assert_eq!(gauge.watermark(), 8);
        for _ in 0..7 {
            gauge.incr();
        }
        assert!(gauge.admit().is_ok());
    }

    #[test]
    fn refuses_above_watermark_with_escalating_backoff() {
        let gauge = BackpressureGauge::with_capacity(10);
        for _ in 0..9 {
            gauge.incr();
        }
        let first = gauge.admit().unwrap_err();
        let second = gauge.admit().unwrap_err();
        assert_eq!(first, Duration::from_millis(100));
        assert_eq!(second, Duration::from_millis(200));
    }

    #[test]
    fn level_resets_when_depth_drops() {
        let gauge = BackpressureGauge::with_capacity(10);
        for _ in 0..9 {
            gauge.incr();
        }
        let _ = gauge.admit();
        let _ = gauge.admit();

        // Drain below the watermark.
        for _ in 0..5 {
            gauge.decr();
        }
        assert!(gauge.admit().is_ok());

        // Climbing back over the watermark starts from the base backoff.
        for _ in 0..5 {
            gauge.incr();
        }
        assert_eq!(gauge.admit().unwrap_err(), Duration::from_millis(100));
    }
}
