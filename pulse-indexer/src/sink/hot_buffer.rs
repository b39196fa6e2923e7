//! Bounded in-memory ring of recent transfers.
//!
//! The dashboard reads from here at sub-millisecond latency instead of
//! hitting the database. Writers are the processor (through the
//! multi-sink), readers are the API tasks. On overflow the oldest 10%
//! is dropped in one cut, so the drop cost is amortized instead of
//! paid per insert.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;
use crate::ports::TransferSink;
use crate::types::chain::{StoredBlock, Transfer};

/// Default ring capacity.
const DEFAULT_CAPACITY: usize = 50_000;

/// In-memory transfer ring with read-write-locked interior.
#[derive(Debug)]
pub struct HotBuffer {
    capacity: usize,
    ring: RwLock<VecDeque<Transfer>>,
}

impl HotBuffer {
    /// Ring with the default capacity (50 000 transfers).
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Ring with an explicit capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(10);
        Self {
            capacity,
            ring: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Number of buffered transfers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.read().len()
    }

    /// Whether the ring is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ring.read().is_empty()
    }

    /// Most recent `limit` transfers, newest first.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<Transfer> {
        let ring = self.ring.read();
        ring.iter().rev().take(limit).cloned().collect()
    }

    fn push_all(&self, transfers: &[Transfer]) {
        let mut ring = self.ring.write();
        for transfer in transfers {
            ring.push_back(transfer.clone());
        }
        if ring.len() > self.capacity {
            // Drop the oldest 10% in one cut.
            let cut = (self.capacity / 10).max(ring.len() - self.capacity);
            ring.drain(..cut);
        }
    }
}

impl Default for HotBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransferSink for HotBuffer {
    fn name(&self) -> &'static str {
        "hot_buffer"
    }

    async fn write_blocks(&self, _blocks: &[StoredBlock]) -> Result<()> {
        // The ring only holds transfers.
        Ok(())
    }

    async fn write_transfers(&self, transfers: &[Transfer]) -> Result<()> {
        self.push_all(transfers);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use alloy::primitives::B256;

    use super::*;
    use crate::types::chain::ActivityType;
    use crate::types::primitives::{BlockNumber, EthAddress, TokenAmount};

    fn transfer(block: u64, log_index: u64) -> Transfer {
        Transfer {
            block_number: BlockNumber::new(block),
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
    async fn recent_returns_newest_first() {
        let buffer = HotBuffer::with_capacity(100);
        let batch: Vec<Transfer> = (0..5).map(|i| transfer(1, i)).collect();
        buffer.write_transfers(&batch).await.unwrap();

        let recent = buffer.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].log_index, 4);
        assert_eq!(recent[1].log_index, 3);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_tenth() {
        let buffer = HotBuffer::with_capacity(100);
        let batch: Vec<Transfer> = (0..101).map(|i| transfer(1, i)).collect();
        buffer.write_transfers(&batch).await.unwrap();

        // 101 entries overflow a 100-ring: the oldest 10 go at once.
        assert_eq!(buffer.len(), 91);
        let oldest = buffer.recent(usize::MAX).pop().unwrap();
        assert_eq!(oldest.log_index, 10);
    }

    #[tokio::test]
    async fn blocks_are_ignored() {
        let buffer = HotBuffer::with_capacity(100);
        buffer.write_blocks(&[]).await.unwrap();
        assert!(buffer.is_empty());
    }
}
