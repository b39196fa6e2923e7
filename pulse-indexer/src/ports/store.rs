//! Storage port for durable persistence.
//!
//! The pipeline never talks to SQL directly; everything goes through
//! [`IndexerStore`]. The contract the processor relies on:
//!
//! - [`IndexerStore::commit`] is atomic per invocation - block rows,
//!   transfer rows, skip records and the checkpoint either all land or
//!   none do
//! - the checkpoint always equals the highest block number visible in
//!   the durable block store for that chain
//! - [`IndexerStore::rollback_to`] deletes blocks at and above the
//!   divergence point; transfers follow via `ON DELETE CASCADE`

use alloy::primitives::B256;
use async_trait::async_trait;

use crate::error::Result;
use crate::types::chain::{Checkpoint, StoredBlock, TokenMetadata, Transfer};
use crate::types::primitives::BlockNumber;

// ═══════════════════════════════════════════════════════════════════════════════
// COMMIT BATCH
// ═══════════════════════════════════════════════════════════════════════════════

/// One atomic unit of persistence.
#[derive(Debug, Clone, Default)]
pub struct CommitBatch {
    /// Block rows to insert (deduplicated on number by the store).
    pub blocks: Vec<StoredBlock>,
    /// Transfer rows to insert (deduplicated on `(block, log_index)`).
    pub transfers: Vec<Transfer>,
    /// Checkpoint advance: the highest block with a non-nil header,
    /// `None` when the batch carried no headers at all.
    pub checkpoint: Option<BlockNumber>,
    /// Heights whose logs were persisted without a header row, recorded
    /// in the skip log for deferred repair.
    pub headerless: Vec<BlockNumber>,
}

impl CommitBatch {
    /// Whether there is anything to write.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.transfers.is_empty() && self.headerless.is_empty()
    }
}

/// What a commit actually wrote (duplicates are skipped silently).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Block rows inserted.
    pub blocks_inserted: u64,
    /// Transfer rows inserted.
    pub transfers_inserted: u64,
}

/// A recorded skip, awaiting repair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRange {
    /// First skipped height (inclusive).
    pub from: BlockNumber,
    /// End of the skipped range (exclusive).
    pub to: BlockNumber,
    /// Why the range was skipped.
    pub reason: String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// INDEXER STORE
// ═══════════════════════════════════════════════════════════════════════════════

/// Port for durable pipeline state.
#[async_trait]
pub trait IndexerStore: Send + Sync {
    /// Current checkpoint for the chain, if any.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    async fn checkpoint(&self, chain_id: u64) -> Result<Option<Checkpoint>>;

    /// Force the checkpoint to a specific height (watchdog realignment).
    ///
    /// # Errors
    /// Returns an error if the write fails.
    async fn set_checkpoint(&self, chain_id: u64, block: BlockNumber) -> Result<()>;

    /// Highest block number present in the block store.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    async fn max_stored_block(&self) -> Result<Option<BlockNumber>>;

    /// Persisted hash at a height, for reorg detection.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    async fn block_hash(&self, number: BlockNumber) -> Result<Option<B256>>;

    /// Atomically persist a batch: blocks, transfers, skip records and
    /// the checkpoint advance, all in one transaction.
    ///
    /// # Errors
    /// Returns an error if any step fails; nothing is committed then.
    async fn commit(&self, chain_id: u64, batch: CommitBatch) -> Result<CommitOutcome>;

    /// Delete blocks at and above `divergence` (transfers cascade) and
    /// rewind the checkpoint to `divergence - 1`.
    ///
    /// # Errors
    /// Returns an error if the rollback transaction fails.
    async fn rollback_to(&self, chain_id: u64, divergence: BlockNumber) -> Result<()>;

    /// Record a deliberately skipped range for later repair.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    async fn record_skip(&self, range: SkippedRange) -> Result<()>;

    /// Most recent skip records.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    async fn list_skips(&self, limit: u32) -> Result<Vec<SkippedRange>>;

    /// Upsert resolved token metadata. Last writer wins.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    async fn upsert_token_metadata(&self, tokens: &[TokenMetadata]) -> Result<()>;

    /// Look up stored metadata for a token.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    async fn token_metadata(
        &self,
        address: &crate::types::EthAddress,
    ) -> Result<Option<TokenMetadata>>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// MOCK STORE
// ═══════════════════════════════════════════════════════════════════════════════

/// In-memory store for unit and integration tests.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use chrono::Utc;
    use parking_lot::Mutex;

    use super::*;
    use crate::types::EthAddress;

    #[derive(Debug, Default)]
    struct MockState {
        blocks: BTreeMap<u64, StoredBlock>,
        transfers: Vec<Transfer>,
        checkpoints: BTreeMap<u64, Checkpoint>,
        skips: Vec<SkippedRange>,
        tokens: BTreeMap<String, TokenMetadata>,
        fail_commits: bool,
    }

    /// In-memory [`IndexerStore`] backed by maps. Cloning shares state.
    #[derive(Debug, Default, Clone)]
    pub struct MockIndexerStore {
        state: Arc<Mutex<MockState>>,
    }

    impl MockIndexerStore {
        /// Fresh empty store.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Pre-seed persisted blocks.
        #[must_use]
        pub fn with_blocks(blocks: Vec<StoredBlock>) -> Self {
            let store = Self::new();
            {
                let mut state = store.state.lock();
                for block in blocks {
                    state.blocks.insert(block.number.value(), block);
                }
            }
            store
        }

        /// Make every subsequent commit fail (persistence-error paths).
        pub fn fail_commits(&self, fail: bool) {
            self.state.lock().fail_commits = fail;
        }

        /// All block numbers currently stored, ascending.
        #[must_use]
        pub fn stored_numbers(&self) -> Vec<u64> {
            self.state.lock().blocks.keys().copied().collect()
        }

        /// All stored transfers.
        #[must_use]
        pub fn stored_transfers(&self) -> Vec<Transfer> {
            self.state.lock().transfers.clone()
        }

        /// Wipe every table, as if the database were dropped underneath
        /// the running service.
        pub fn wipe(&self) {
            let mut state = self.state.lock();
            state.blocks.clear();
            state.transfers.clear();
            state.checkpoints.clear();
            state.skips.clear();
        }
    }

    #[async_trait]
    impl IndexerStore for MockIndexerStore {
        async fn checkpoint(&self, chain_id: u64) -> Result<Option<Checkpoint>> {
            Ok(self.state.lock().checkpoints.get(&chain_id).cloned())
        }

        async fn set_checkpoint(&self, chain_id: u64, block: BlockNumber) -> Result<()> {
            self.state.lock().checkpoints.insert(
                chain_id,
                Checkpoint {
                    chain_id,
                    last_synced_block: block,
                    updated_at: Utc::now(),
                },
            );
            Ok(())
        }

        async fn max_stored_block(&self) -> Result<Option<BlockNumber>> {
            Ok(self
                .state
                .lock()
                .blocks
                .keys()
                .max()
                .copied()
                .map(BlockNumber::new))
        }

        async fn block_hash(&self, number: BlockNumber) -> Result<Option<B256>> {
            Ok(self
                .state
                .lock()
                .blocks
                .get(&number.value())
                .map(|b| b.hash))
        }

        async fn commit(&self, chain_id: u64, batch: CommitBatch) -> Result<CommitOutcome> {
            let mut state = self.state.lock();
            if state.fail_commits {
                return Err(crate::error::InfraError::Database(sqlx::Error::PoolClosed).into());
            }

            let mut outcome = CommitOutcome::default();
            for block in batch.blocks {
                if state.blocks.insert(block.number.value(), block).is_none() {
                    outcome.blocks_inserted += 1;
                }
            }
            for transfer in batch.transfers {
                let duplicate = state.transfers.iter().any(|t| {
                    t.block_number == transfer.block_number && t.log_index == transfer.log_index
                });
                if !duplicate {
                    state.transfers.push(transfer);
                    outcome.transfers_inserted += 1;
                }
            }
            for number in batch.headerless {
                state.skips.push(SkippedRange {
                    from: number,
                    to: number.next(),
                    reason: "missing_header".into(),
                });
            }
            if let Some(checkpoint) = batch.checkpoint {
                let advanced = state
                    .checkpoints
                    .get(&chain_id)
                    .is_none_or(|c| c.last_synced_block < checkpoint);
                if advanced {
                    state.checkpoints.insert(
                        chain_id,
                        Checkpoint {
                            chain_id,
                            last_synced_block: checkpoint,
                            updated_at: Utc::now(),
                        },
                    );
                }
            }
            Ok(outcome)
        }

        async fn rollback_to(&self, chain_id: u64, divergence: BlockNumber) -> Result<()> {
            let mut state = self.state.lock();
            state.blocks.retain(|&n, _| n < divergence.value());
            state
                .transfers
                .retain(|t| t.block_number < divergence);
            state.checkpoints.insert(
                chain_id,
                Checkpoint {
                    chain_id,
                    last_synced_block: divergence.prev(),
                    updated_at: Utc::now(),
                },
            );
            Ok(())
        }

        async fn record_skip(&self, range: SkippedRange) -> Result<()> {
            self.state.lock().skips.push(range);
            Ok(())
        }

        async fn list_skips(&self, limit: u32) -> Result<Vec<SkippedRange>> {
            let state = self.state.lock();
            Ok(state.skips.iter().rev().take(limit as usize).cloned().collect())
        }

        async fn upsert_token_metadata(&self, tokens: &[TokenMetadata]) -> Result<()> {
            let mut state = self.state.lock();
            for token in tokens {
                state.tokens.insert(token.address.to_hex(), token.clone());
            }
            Ok(())
        }

        async fn token_metadata(&self, address: &EthAddress) -> Result<Option<TokenMetadata>> {
            Ok(self.state.lock().tokens.get(&address.to_hex()).cloned())
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::mock::MockIndexerStore;
    use super::*;
    use crate::types::chain::BlockHeader;

    fn stored(number: u64, hash: u8, parent: u8) -> StoredBlock {
        StoredBlock::from(&BlockHeader {
            number: BlockNumber::new(number),
            hash: B256::from([hash; 32]),
            parent_hash: B256::from([parent; 32]),
            timestamp: 0,
            gas_used: 0,
        })
    }

    #[tokio::test]
    async fn commit_deduplicates_blocks() {
        let store = MockIndexerStore::new();
        let batch = CommitBatch {
            blocks: vec![stored(1, 0x01, 0x00), stored(1, 0x01, 0x00)],
            checkpoint: Some(BlockNumber::new(1)),
            ..CommitBatch::default()
        };
        let outcome = store.commit(1, batch).await.unwrap();
        assert_eq!(outcome.blocks_inserted, 1);
    }

    #[tokio::test]
    async fn checkpoint_never_rewinds_on_commit() {
        let store = MockIndexerStore::new();
        store.set_checkpoint(1, BlockNumber::new(100)).await.unwrap();

        let batch = CommitBatch {
            checkpoint: Some(BlockNumber::new(50)),
            ..CommitBatch::default()
        };
        store.commit(1, batch).await.unwrap();

        let checkpoint = store.checkpoint(1).await.unwrap().unwrap();
        assert_eq!(checkpoint.last_synced_block.value(), 100);
    }

    #[tokio::test]
    async fn rollback_removes_blocks_and_rewinds() {
        let store = MockIndexerStore::with_blocks(vec![
            stored(98, 0x98, 0x97),
            stored(99, 0x99, 0x98),
            stored(100, 0xA0, 0x99),
        ]);
        store.set_checkpoint(1, BlockNumber::new(100)).await.unwrap();

        store.rollback_to(1, BlockNumber::new(99)).await.unwrap();

        assert_eq!(store.stored_numbers(), vec![98]);
        let checkpoint = store.checkpoint(1).await.unwrap().unwrap();
        assert_eq!(checkpoint.last_synced_block.value(), 98);
    }

    #[tokio::test]
    async fn headerless_blocks_land_in_skip_log() {
        let store = MockIndexerStore::new();
        let batch = CommitBatch {
            headerless: vec![BlockNumber::new(500)],
            ..CommitBatch::default()
        };
        store.commit(1, batch).await.unwrap();

        let skips = store.list_skips(10).await.unwrap();
        assert_eq!(skips.len(), 1);
        assert_eq!(skips[0].reason, "missing_header");
    }
}
