//! WebSocket new-head listener.
//!
//! Push-driven companion to the tail-follow loop: when the provider
//! exposes a WSS endpoint, `newHeads` notifications update the oracle
//! and nudge the fetcher as soon as a block exists, instead of waiting
//! for the next poll tick. The poll loop stays on as a fallback, so a
//! dropped subscription degrades latency, never correctness.
//!
//! Reconnects are bounded with a cancellation-aware delay, and a
//! keep-alive ping guards against half-open connections.

use std::sync::Arc;
use std::time::Duration;

use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use futures::StreamExt;
use tokio::time::{interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::control::oracle::HeightOracle;
use crate::error::{AppError, InfraError, Result};
use crate::pipeline::FetcherHandle;
use crate::types::primitives::BlockNumber;

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Timeout for the initial WebSocket connection.
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay before a reconnection attempt.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Reconnection attempts before giving up (the poll loop still runs).
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Keep-alive ping interval.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);

// ═══════════════════════════════════════════════════════════════════════════════
// WSS LISTENER
// ═══════════════════════════════════════════════════════════════════════════════

/// Subscribes to `newHeads` and triggers fetch scheduling on push.
pub struct WssListener {
    ws_url: String,
    oracle: Arc<HeightOracle>,
    fetcher: FetcherHandle,
    confirmation_depth: u64,
}

impl std::fmt::Debug for WssListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WssListener")
            .field("ws_url", &self.ws_url)
            .field("confirmation_depth", &self.confirmation_depth)
            .finish_non_exhaustive()
    }
}

impl WssListener {
    /// Create a listener for the given WSS endpoint.
    #[must_use]
    pub fn new(
        ws_url: impl Into<String>,
        oracle: Arc<HeightOracle>,
        fetcher: FetcherHandle,
        confirmation_depth: u64,
    ) -> Self {
        Self {
            ws_url: ws_url.into(),
            oracle,
            fetcher,
            confirmation_depth,
        }
    }

    /// Run with bounded reconnects until cancellation.
    ///
    /// # Errors
    /// Returns the last connection error once the reconnect budget is
    /// exhausted.
    #[instrument(skip(self, cancel), fields(ws_url = %self.ws_url))]
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut attempts = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            match self.run_subscription(&cancel).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    attempts += 1;
                    if attempts > MAX_RECONNECT_ATTEMPTS {
                        warn!(attempts, "WSS reconnect budget exhausted, poll-only from here");
                        return Err(e);
                    }
                    warn!(
                        attempt = attempts,
                        max = MAX_RECONNECT_ATTEMPTS,
                        error = %e,
                        "WSS disconnected, reconnecting"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => return Ok(()),
                        () = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }
    }

    async fn run_subscription(&self, cancel: &CancellationToken) -> Result<()> {
        let ws = WsConnect::new(&self.ws_url);
        let provider = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            connected = timeout(CONNECTION_TIMEOUT, ProviderBuilder::new().connect_ws(ws)) => {
                connected
                    .map_err(|_| InfraError::Timeout("WSS connection timed out".into()))?
                    .map_err(|e| InfraError::Internal(format!("WSS connect: {e}")))?
            }
        };
        info!("WSS connected, subscribing to newHeads");

        let subscription = provider
            .subscribe_blocks()
            .await
            .map_err(|e| InfraError::Internal(format!("newHeads subscribe: {e}")))?;
        let mut heads = subscription.into_stream();

        let mut keepalive = interval(KEEPALIVE_INTERVAL);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keepalive.reset();

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),

                _ = keepalive.tick() => {
                    if let Err(e) = provider.get_chain_id().await {
                        warn!(error = %e, "WSS keep-alive failed, reconnecting");
                        return Err(InfraError::Internal("keep-alive failed".into()).into());
                    }
                    debug!("WSS keep-alive ok");
                }

                maybe_head = heads.next() => {
                    let Some(header) = maybe_head else {
                        return Err(InfraError::Internal("newHeads stream ended".into()).into());
                    };
                    self.on_new_head(header.number);
                }
            }
        }
    }

    /// React to one pushed head: publish it, schedule the fresh tail.
    fn on_new_head(&self, number: u64) {
        let head = BlockNumber::new(number);
        debug!(head = %head, "newHeads push");
        self.oracle.set_chain_head(head);

        if self.fetcher.is_paused() {
            return;
        }

        let safe_head = BlockNumber::new(number.saturating_sub(self.confirmation_depth));
        let next = self.fetcher.last_scheduled().next().max(safe_head);
        if next > head {
            return;
        }

        match self.fetcher.schedule(next, head) {
            Ok(()) | Err(AppError::BackpressureBlocked { .. }) => {}
            Err(err) => warn!(error = %err, "push scheduling failed"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keepalive_stays_under_provider_idle_window() {
        // Most gateways drop idle subscriptions after 30 seconds.
        assert!(KEEPALIVE_INTERVAL < Duration::from_secs(30));
        assert!(KEEPALIVE_INTERVAL >= Duration::from_secs(10));
    }

    #[test]
    fn reconnect_budget_is_bounded() {
        assert!(MAX_RECONNECT_ATTEMPTS >= 3);
        assert!(MAX_RECONNECT_ATTEMPTS <= 100);
        assert!(RECONNECT_DELAY >= Duration::from_millis(100));
    }
}
