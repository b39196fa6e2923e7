//! Composite fan-out over the secondary sinks.
//!
//! The durable store is written transactionally by the processor; the
//! multi-sink only carries the secondary targets (archive, hot buffer,
//! whatever else registers). Secondary writes run in parallel and a
//! failure is logged, counted and swallowed - it must never fail the
//! primary operation.

use std::sync::Arc;

use futures::future::join_all;
use tracing::warn;

use crate::ports::TransferSink;
use crate::types::chain::{StoredBlock, Transfer};

/// Fan-out wrapper over the registered secondary sinks.
pub struct MultiSink {
    sinks: Vec<Arc<dyn TransferSink>>,
}

impl std::fmt::Debug for MultiSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.sinks.iter().map(|s| s.name()).collect();
        f.debug_struct("MultiSink").field("sinks", &names).finish()
    }
}

impl MultiSink {
    /// Build from the registered sinks. Adding a sink never requires a
    /// processor change.
    #[must_use]
    pub fn new(sinks: Vec<Arc<dyn TransferSink>>) -> Self {
        Self { sinks }
    }

    /// Number of registered sinks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Whether any sinks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Write blocks and transfers to every sink in parallel.
    ///
    /// Failures are logged per sink and swallowed.
    pub async fn fan_out(&self, blocks: &[StoredBlock], transfers: &[Transfer]) {
        let writes = self.sinks.iter().map(|sink| async move {
            if let Err(e) = sink.write_blocks(blocks).await {
                metrics::counter!("sink_failures_total", "sink" => sink.name()).increment(1);
                warn!(sink = sink.name(), error = %e, "secondary sink block write failed");
            }
            if let Err(e) = sink.write_transfers(transfers).await {
                metrics::counter!("sink_failures_total", "sink" => sink.name()).increment(1);
                warn!(sink = sink.name(), error = %e, "secondary sink transfer write failed");
            }
        });
        join_all(writes).await;
    }

    /// Flush and close every sink.
    pub async fn close_all(&self) {
        for sink in &self.sinks {
            if let Err(e) = sink.close().await {
                warn!(sink = sink.name(), error = %e, "sink close failed");
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
    use std::sync::atomic::Ordering;

    use alloy::primitives::B256;

    use super::*;
    use crate::ports::sink::mocks::MockSink;
    use crate::types::chain::ActivityType;
    use crate::types::primitives::{BlockNumber, EthAddress, TokenAmount};

    fn transfer(log_index: u64) -> Transfer {
        Transfer {
            block_number: BlockNumber::new(1),
            tx_hash: B256::ZERO,
            log_index,
            from: EthAddress::ZERO,
            to: EthAddress::ZERO,
            amount: TokenAmount::zero(),
            token: EthAddress::ZERO,
            activity: ActivityType::Transfer,
            symbol: None,
        }
    }

    #[tokio::test]
    async fn fan_out_reaches_every_sink() {
        let a = MockSink::default();
        let b = MockSink::default();
        let multi = MultiSink::new(vec![Arc::new(a.clone()), Arc::new(b.clone())]);

        multi.fan_out(&[], &[transfer(0), transfer(1)]).await;

        assert_eq!(a.transfers.load(Ordering::SeqCst), 2);
        assert_eq!(b.transfers.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failing_sink_does_not_poison_fan_out() {
        let failing = MockSink::default();
        failing.should_fail.store(true, Ordering::SeqCst);
        let healthy = MockSink::default();

        let multi = MultiSink::new(vec![Arc::new(failing), Arc::new(healthy.clone())]);
        multi.fan_out(&[], &[transfer(0)]).await;

        // The healthy sink still got the batch; fan_out never errors.
        assert_eq!(healthy.transfers.load(Ordering::SeqCst), 1);
    }
}
