//! Lag-aware token-bucket rate limiting.
//!
//! Every outbound RPC call blocks on [`SmartLimiter::wait`]. The target
//! rate is a function of the endpoint class, the observed sync lag and
//! the user-configured cap:
//!
//! - local endpoints run up to 500 rps, commercial ones 15 rps nominal
//! - when the indexer is more than 1000 blocks behind, the rate doubles
//!   up to the class ceiling ("catch-up boost")
//! - otherwise the user cap applies, clamped to the class ceiling
//!
//! A second, slower bucket can be layered on top to pace emission for
//! demos; the two compose by sequential waits.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::EndpointClass;
use crate::error::{PoolError, Result};

/// Direct (un-keyed) governor limiter.
type Bucket = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Lag above which the catch-up boost kicks in.
const CATCH_UP_LAG: u64 = 1000;

fn build_bucket(rps: u32) -> Arc<Bucket> {
    // Quota rejects zero; a stalled limiter is never what anyone wants.
    let rate = NonZeroU32::new(rps.max(1)).unwrap_or(NonZeroU32::MIN);
    Arc::new(RateLimiter::direct(Quota::per_second(rate)))
}

/// Compute the target rate for the given conditions.
///
/// Exposed for the pool's retune loop and for tests.
#[must_use]
pub fn target_rate(class: EndpointClass, lag: u64, user_cap: u32) -> u32 {
    let base = if user_cap > 0 {
        user_cap.min(class.ceiling_rps())
    } else {
        class.nominal_rps()
    };

    if lag > CATCH_UP_LAG {
        (base * 2).min(class.ceiling_rps())
    } else {
        base
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SMART LIMITER
// ═══════════════════════════════════════════════════════════════════════════════

/// Shared, hot-swappable token bucket for a client pool.
pub struct SmartLimiter {
    /// Endpoint class driving the rate ceiling.
    class: EndpointClass,
    /// User-configured rps cap (0 = class nominal).
    user_cap: u32,
    /// The active bucket. Replaced wholesale on retune.
    bucket: RwLock<Arc<Bucket>>,
    /// Currently selected rate, for observability and change detection.
    current_rps: AtomicU32,
    /// Optional secondary pacing bucket (demo throughput limiter).
    throughput: RwLock<Option<Arc<Bucket>>>,
}

impl std::fmt::Debug for SmartLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartLimiter")
            .field("class", &self.class)
            .field("current_rps", &self.current_rps.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl SmartLimiter {
    /// Create a limiter for the given endpoint class and user cap.
    #[must_use]
    pub fn new(class: EndpointClass, user_cap: u32) -> Self {
        let rps = target_rate(class, 0, user_cap);
        Self {
            class,
            user_cap,
            bucket: RwLock::new(build_bucket(rps)),
            current_rps: AtomicU32::new(rps),
            throughput: RwLock::new(None),
        }
    }

    /// The currently selected rate in requests per second.
    #[must_use]
    pub fn current_rps(&self) -> u32 {
        self.current_rps.load(Ordering::Relaxed)
    }

    /// Re-evaluate the target rate against the observed lag.
    ///
    /// Swaps the bucket only when the selected rate actually changed, so
    /// accumulated burst capacity is not discarded on every tick.
    pub fn retune(&self, lag: u64) {
        let rps = target_rate(self.class, lag, self.user_cap);
        if rps != self.current_rps.swap(rps, Ordering::Relaxed) {
            info!(rps, lag, "rate limiter retuned");
            *self.bucket.write() = build_bucket(rps);
        }
    }

    /// Hot-swap the bucket to an explicit rate, ignoring class heuristics.
    pub fn set_rate(&self, rps: u32) {
        let clamped = rps.min(self.class.ceiling_rps()).max(1);
        if clamped != self.current_rps.swap(clamped, Ordering::Relaxed) {
            debug!(rps = clamped, "rate limiter set explicitly");
            *self.bucket.write() = build_bucket(clamped);
        }
    }

    /// Attach a secondary pacing bucket of `rps` requests per second.
    pub fn set_throughput_pacing(&self, rps: Option<u32>) {
        *self.throughput.write() = rps.map(build_bucket);
    }

    /// Block until a token is available, honoring cancellation.
    ///
    /// # Errors
    /// Returns [`PoolError::Cancelled`] when the token fires first.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        let bucket = Arc::clone(&self.bucket.read());
        tokio::select! {
            () = cancel.cancelled() => return Err(PoolError::Cancelled),
            () = bucket.until_ready() => {}
        }

        // Secondary bucket composes by a sequential wait.
        let pacing = self.throughput.read().clone();
        if let Some(pacing) = pacing {
            tokio::select! {
                () = cancel.cancelled() => return Err(PoolError::Cancelled),
                () = pacing.until_ready() => {}
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[test]
    fn nominal_rate_without_cap() {
        assert_eq!(target_rate(EndpointClass::Commercial, 0, 0), 15);
        assert_eq!(target_rate(EndpointClass::Local, 0, 0), 500);
    }

    #[test]
    fn user_cap_clamped_to_ceiling() {
        assert_eq!(target_rate(EndpointClass::Commercial, 0, 10), 10);
        assert_eq!(target_rate(EndpointClass::Commercial, 0, 9999), 30);
    }

    #[test]
    fn catch_up_boost_doubles_up_to_ceiling() {
        // 15 nominal doubles to 30, which is exactly the commercial ceiling.
        assert_eq!(target_rate(EndpointClass::Commercial, 5000, 0), 30);
        // A cap of 20 doubles to 40 but clamps at 30.
        assert_eq!(target_rate(EndpointClass::Commercial, 5000, 20), 30);
        // Local nominal is already at the ceiling.
        assert_eq!(target_rate(EndpointClass::Local, 5000, 0), 500);
    }

    #[test]
    fn boost_requires_large_lag() {
        assert_eq!(target_rate(EndpointClass::Commercial, 1000, 0), 15);
        assert_eq!(target_rate(EndpointClass::Commercial, 1001, 0), 30);
    }

    #[tokio::test]
    async fn wait_grants_token() {
        let limiter = SmartLimiter::new(EndpointClass::Local, 0);
        let cancel = CancellationToken::new();
        assert_ok!(limiter.wait(&cancel).await);
    }

    #[tokio::test]
    async fn wait_honors_cancellation() {
        // 1 rps bucket: the first token is free, the second waits ~1s.
        let limiter = SmartLimiter::new(EndpointClass::Commercial, 1);
        let cancel = CancellationToken::new();
        limiter.wait(&cancel).await.unwrap_or_default();

        cancel.cancel();
        let result = limiter.wait(&cancel).await;
        assert!(matches!(result, Err(PoolError::Cancelled)));
    }

    #[test]
    fn retune_switches_rate_on_lag_change() {
        let limiter = SmartLimiter::new(EndpointClass::Commercial, 0);
        assert_eq!(limiter.current_rps(), 15);

        limiter.retune(50_000);
        assert_eq!(limiter.current_rps(), 30);

        limiter.retune(0);
        assert_eq!(limiter.current_rps(), 15);
    }

    #[test]
    fn set_rate_clamps_to_class_ceiling() {
        let limiter = SmartLimiter::new(EndpointClass::Commercial, 0);
        limiter.set_rate(10_000);
        assert_eq!(limiter.current_rps(), 30);
    }
}
