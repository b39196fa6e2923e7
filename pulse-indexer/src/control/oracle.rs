//! Height oracle: the single source of truth for chain height state.
//!
//! Dashboards, the watchdog and the rate-limiter retune loop all read
//! lag from here; no other component computes lag from private state.
//! Writes are serialized under the internal lock, reads return a value
//! copy.

use parking_lot::RwLock;

use crate::types::chain::HeightSnapshot;
use crate::types::primitives::BlockNumber;

/// Process-wide publisher of `(chain_head, sync_cursor, lag)`.
///
/// Initialized once at startup and shared via `Arc`. Tests inject their
/// own instance; nothing touches a global.
#[derive(Debug, Default)]
pub struct HeightOracle {
    inner: RwLock<HeightSnapshot>,
}

impl HeightOracle {
    /// New oracle with both heights at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly observed chain head.
    ///
    /// Heads only move forward; a lagging provider response never
    /// rewinds the published head.
    pub fn set_chain_head(&self, head: BlockNumber) {
        let mut inner = self.inner.write();
        if head > inner.chain_head {
            inner.chain_head = head;
            metrics::gauge!("height_chain_head").set(head.value() as f64);
            metrics::gauge!("height_lag").set(inner.lag() as f64);
        }
    }

    /// Record the highest fully processed block.
    pub fn set_sync_cursor(&self, cursor: BlockNumber) {
        let mut inner = self.inner.write();
        inner.sync_cursor = cursor;
        metrics::gauge!("height_sync_cursor").set(cursor.value() as f64);
        metrics::gauge!("height_lag").set(inner.lag() as f64);
    }

    /// Value copy of the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> HeightSnapshot {
        *self.inner.read()
    }

    /// Convenience accessor for `max(0, head - cursor)`.
    #[must_use]
    pub fn lag(&self) -> u64 {
        self.inner.read().lag()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_a_value_copy() {
        let oracle = HeightOracle::new();
        oracle.set_chain_head(BlockNumber::new(100));
        let snapshot = oracle.snapshot();

        oracle.set_chain_head(BlockNumber::new(200));
        assert_eq!(snapshot.chain_head.value(), 100);
        assert_eq!(oracle.snapshot().chain_head.value(), 200);
    }

    #[test]
    fn head_never_rewinds() {
        let oracle = HeightOracle::new();
        oracle.set_chain_head(BlockNumber::new(500));
        oracle.set_chain_head(BlockNumber::new(400));
        assert_eq!(oracle.snapshot().chain_head.value(), 500);
    }

    #[test]
    fn lag_tracks_cursor_and_head() {
        let oracle = HeightOracle::new();
        oracle.set_chain_head(BlockNumber::new(1000));
        oracle.set_sync_cursor(BlockNumber::new(900));
        assert_eq!(oracle.lag(), 100);

        oracle.set_sync_cursor(BlockNumber::new(1000));
        assert_eq!(oracle.lag(), 0);
    }
}
