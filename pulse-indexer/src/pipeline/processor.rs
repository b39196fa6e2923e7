//! Block processing: decode, persist atomically, fan out.
//!
//! The processor runs inside the sequencer's task so ordering is
//! inherited, not re-established. Per invocation it:
//!
//! 1. checks the incoming parent hash against persisted state
//!    (surfacing [`ReorgError`] before anything is written)
//! 2. decodes logs and the native-transaction walk into transfers
//! 3. commits blocks + transfers + checkpoint in one transaction
//! 4. fans out to the secondary sinks, feeds the enricher and emits
//!    hub events
//!
//! The checkpoint advances to the highest block with a non-nil header;
//! headerless blocks keep their logs but land in the skip log for
//! deferred repair.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, instrument, warn};

use crate::control::oracle::HeightOracle;
use crate::enricher::EnricherHandle;
use crate::error::{AppError, ReorgError, Result};
use crate::events::EventHub;
use crate::pipeline::decode;
use crate::ports::{CommitBatch, IndexerStore};
use crate::sink::MultiSink;
use crate::types::chain::{BlockData, StoredBlock, Transfer};
use crate::types::events::{BlockEvent, GasEntry, IndexerEvent};
use crate::types::primitives::{BlockNumber, EthAddress};

/// Leaderboard size and emission cadence (every N blocks).
const LEADERBOARD_SIZE: usize = 10;
const LEADERBOARD_EVERY: u64 = 10;
/// Ceiling on tracked addresses before the tail is pruned.
const LEADERBOARD_TRACKED_MAX: usize = 2048;

// ═══════════════════════════════════════════════════════════════════════════════
// THROUGHPUT WINDOW
// ═══════════════════════════════════════════════════════════════════════════════

/// Rolling transfers-per-second estimate for the block event payload.
#[derive(Debug)]
struct TpsWindow {
    started: Instant,
    transfers: u64,
}

impl TpsWindow {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            transfers: 0,
        }
    }

    fn record(&mut self, count: u64) -> u32 {
        self.transfers += count;
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 60.0 {
            self.started = Instant::now();
            self.transfers = count;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            (self.transfers as f64 / elapsed.max(1.0)) as u32
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROCESSOR
// ═══════════════════════════════════════════════════════════════════════════════

/// Decodes transfer logs, assembles batches and writes them atomically.
///
/// # Type Parameters
///
/// * `S` - Store implementation providing atomic persistence
pub struct Processor<S> {
    store: Arc<S>,
    sinks: Arc<MultiSink>,
    enricher: Option<EnricherHandle>,
    hub: EventHub,
    oracle: Arc<HeightOracle>,
    chain_id: u64,
    /// Token allow-list; `None` indexes everything.
    watch_addresses: Option<HashSet<EthAddress>>,
    tps: Mutex<TpsWindow>,
    /// Cumulative gas per sender, for the leaderboard event.
    gas_totals: Mutex<HashMap<EthAddress, u64>>,
    blocks_since_leaderboard: Mutex<u64>,
}

impl<S> std::fmt::Debug for Processor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("chain_id", &self.chain_id)
            .field("watching", &self.watch_addresses.as_ref().map(HashSet::len))
            .finish_non_exhaustive()
    }
}

impl<S> Processor<S>
where
    S: IndexerStore,
{
    /// Create a processor.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        sinks: Arc<MultiSink>,
        enricher: Option<EnricherHandle>,
        hub: EventHub,
        oracle: Arc<HeightOracle>,
        chain_id: u64,
        watch_addresses: Vec<EthAddress>,
    ) -> Self {
        let watch_addresses = if watch_addresses.is_empty() {
            None
        } else {
            Some(watch_addresses.into_iter().collect())
        };
        Self {
            store,
            sinks,
            enricher,
            hub,
            oracle,
            chain_id,
            watch_addresses,
            tps: Mutex::new(TpsWindow::new()),
            gas_totals: Mutex::new(HashMap::new()),
            blocks_since_leaderboard: Mutex::new(0),
        }
    }

    /// Single-block path.
    ///
    /// # Errors
    /// [`AppError::Reorg`] on a parent-hash mismatch; infrastructure
    /// errors abort the commit and leave the store untouched.
    pub async fn process_block(&self, data: &BlockData) -> Result<()> {
        self.process_batch(std::slice::from_ref(data)).await
    }

    /// Batched path, preferred on bulk sync. Atomic per invocation.
    ///
    /// # Errors
    /// [`AppError::Reorg`] on a parent-hash mismatch; infrastructure
    /// errors abort the transaction, nothing is persisted.
    #[instrument(skip(self, blocks), fields(count = blocks.len()))]
    pub async fn process_batch(&self, blocks: &[BlockData]) -> Result<()> {
        if blocks.is_empty() {
            return Ok(());
        }

        self.check_reorg(blocks).await?;

        let mut batch = CommitBatch::default();
        let mut events = Vec::new();

        for data in blocks {
            if let Some(error) = &data.error {
                // Failed entries never reach the processor in the normal
                // flow; refuse them rather than persisting a black hole.
                return Err(AppError::Infra(crate::error::InfraError::Internal(format!(
                    "unfetchable block {} reached processor: {error}",
                    data.number
                ))));
            }

            let mut transfers: Vec<Transfer> = data
                .logs
                .iter()
                .filter_map(decode::decode_log)
                .collect();
            transfers.extend(decode::decode_transactions(data.number, &data.transactions));

            if let Some(watch) = &self.watch_addresses {
                transfers.retain(|t| t.token.is_zero() || watch.contains(&t.token));
            }

            // Resolve symbols already cached; enqueue the rest.
            if let Some(enricher) = &self.enricher {
                for transfer in &mut transfers {
                    if transfer.token.is_zero() {
                        continue;
                    }
                    if let Some(symbol) = enricher.cached_symbol(&transfer.token) {
                        transfer.symbol = Some(symbol);
                    } else {
                        enricher.enqueue(transfer.token);
                    }
                }
            }

            match &data.header {
                Some(header) => {
                    let stored = StoredBlock::from(header);
                    events.push(self.block_event(&stored, data));
                    batch.blocks.push(stored);
                    batch.checkpoint = batch.checkpoint.max(Some(header.number));
                    events.extend(transfers.iter().cloned().map(IndexerEvent::Transfer));
                    batch.transfers.extend(transfers);
                }
                None => {
                    // Transfer rows reference their block row, so a
                    // headerless block cannot carry transfers yet. The
                    // height goes into the skip log and the repair pass
                    // refetches the whole block.
                    warn!(
                        number = %data.number,
                        held_back = transfers.len(),
                        "header missing, block marked for repair"
                    );
                    batch.headerless.push(data.number);
                }
            }
        }

        let blocks_for_sinks = batch.blocks.clone();
        let transfers_for_sinks = batch.transfers.clone();
        let checkpoint = batch.checkpoint;

        let outcome = self.store.commit(self.chain_id, batch).await?;
        debug!(
            blocks = outcome.blocks_inserted,
            transfers = outcome.transfers_inserted,
            "batch committed"
        );

        // Secondary sinks run after the durable commit and never fail it.
        self.sinks
            .fan_out(&blocks_for_sinks, &transfers_for_sinks)
            .await;

        if let Some(checkpoint) = checkpoint {
            self.oracle.set_sync_cursor(checkpoint);
        }
        for event in events {
            self.hub.emit(event);
        }
        self.update_gas_leaderboard(blocks);

        Ok(())
    }

    /// Accumulate per-sender gas and emit a ranked snapshot every
    /// [`LEADERBOARD_EVERY`] processed blocks.
    fn update_gas_leaderboard(&self, blocks: &[BlockData]) {
        let mut totals = self.gas_totals.lock();
        for data in blocks {
            for tx in &data.transactions {
                *totals.entry(tx.from.into()).or_insert(0) += tx.gas;
            }
        }
        if totals.len() > LEADERBOARD_TRACKED_MAX {
            // Drop the cold tail so the map stays bounded.
            let mut ranked: Vec<(EthAddress, u64)> =
                totals.iter().map(|(a, g)| (*a, *g)).collect();
            ranked.sort_by(|a, b| b.1.cmp(&a.1));
            ranked.truncate(LEADERBOARD_TRACKED_MAX / 2);
            *totals = ranked.into_iter().collect();
        }

        let due = {
            let mut counter = self.blocks_since_leaderboard.lock();
            *counter += blocks.len() as u64;
            if *counter >= LEADERBOARD_EVERY {
                *counter = 0;
                true
            } else {
                false
            }
        };
        if !due || totals.is_empty() {
            return;
        }

        let mut ranked: Vec<(EthAddress, u64)> = totals.iter().map(|(a, g)| (*a, *g)).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        let entries = ranked
            .into_iter()
            .take(LEADERBOARD_SIZE)
            .map(|(address, gas_used)| GasEntry {
                address: address.to_hex(),
                gas_used,
            })
            .collect();
        self.hub.emit(IndexerEvent::GasLeaderboard(entries));
    }

    /// Compare each incoming parent hash against the persisted chain.
    ///
    /// For the first block of the batch the predecessor comes from the
    /// store; inside the batch continuity is checked link by link.
    async fn check_reorg(&self, blocks: &[BlockData]) -> Result<()> {
        let mut previous: Option<(BlockNumber, alloy::primitives::B256)> = None;

        for data in blocks {
            let Some(header) = &data.header else {
                previous = None;
                continue;
            };

            let expected = match previous {
                Some((number, hash)) if number.next() == header.number => Some(hash),
                _ => self.store.block_hash(header.number.prev()).await?,
            };

            if let Some(expected) = expected {
                if expected != header.parent_hash && header.number.value() > 0 {
                    return Err(ReorgError {
                        at_block: header.number,
                        expected_parent: expected,
                        observed_parent: header.parent_hash,
                    }
                    .into());
                }
            }

            // A re-fetched height whose hash changed means everything
            // persisted from here up belongs to a stale branch.
            if let Some(existing) = self.store.block_hash(header.number).await? {
                if existing != header.hash {
                    return Err(ReorgError {
                        at_block: header.number,
                        expected_parent: expected.unwrap_or(existing),
                        observed_parent: header.parent_hash,
                    }
                    .into());
                }
            }

            previous = Some((header.number, header.hash));
        }
        Ok(())
    }

    fn block_event(&self, stored: &StoredBlock, data: &BlockData) -> IndexerEvent {
        let snapshot = self.oracle.snapshot();
        let tps = self.tps.lock().record(data.logs.len() as u64);
        let latency = chrono::Utc::now()
            .timestamp()
            .saturating_sub(i64::try_from(stored.timestamp).unwrap_or(i64::MAX));

        IndexerEvent::Block(BlockEvent {
            number: stored.number,
            hash: format!("{:#x}", stored.hash),
            parent_hash: format!("{:#x}", stored.parent_hash),
            timestamp: stored.timestamp,
            tx_count: data.transactions.len(),
            latest_chain: snapshot.chain_head,
            sync_lag: snapshot.lag(),
            tps,
            latency_display: format!("{}s", latency.max(0)),
        })
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
    use crate::ports::MockIndexerStore;
    use crate::types::chain::BlockHeader;

    fn header(number: u64, hash: u8, parent: u8) -> BlockHeader {
        BlockHeader {
            number: BlockNumber::new(number),
            hash: B256::from([hash; 32]),
            parent_hash: B256::from([parent; 32]),
            timestamp: 1_700_000_000,
            gas_used: 21_000,
        }
    }

    fn block(number: u64, hash: u8, parent: u8) -> BlockData {
        BlockData::new(header(number, hash, parent), vec![], vec![])
    }

    fn processor(store: Arc<MockIndexerStore>) -> Processor<MockIndexerStore> {
        Processor::new(
            store,
            Arc::new(MultiSink::new(vec![])),
            None,
            EventHub::new(),
            Arc::new(HeightOracle::new()),
            31337,
            vec![],
        )
    }

    #[tokio::test]
    async fn persists_blocks_and_advances_checkpoint() {
        let store = Arc::new(MockIndexerStore::new());
        let processor = processor(Arc::clone(&store));

        processor
            .process_batch(&[block(1, 0x01, 0x00), block(2, 0x02, 0x01)])
            .await
            .unwrap();

        assert_eq!(store.stored_numbers(), vec![1, 2]);
        let checkpoint = store.checkpoint(31337).await.unwrap().unwrap();
        assert_eq!(checkpoint.last_synced_block.value(), 2);
    }

    #[tokio::test]
    async fn surfaces_reorg_against_store() {
        let store = Arc::new(MockIndexerStore::new());
        let processor = processor(Arc::clone(&store));

        processor.process_block(&block(98, 0x98, 0x97)).await.unwrap();

        // 99' claims a different parent than the stored hash of 98.
        let err = processor
            .process_block(&block(99, 0x99, 0xEE))
            .await
            .unwrap_err();
        let AppError::Reorg(reorg) = err else {
            panic!("expected reorg, got {err:?}");
        };
        assert_eq!(reorg.at_block.value(), 99);
        assert_eq!(reorg.expected_parent, B256::from([0x98; 32]));
        assert_eq!(reorg.observed_parent, B256::from([0xEE; 32]));

        // Nothing was persisted for the bad block.
        assert_eq!(store.stored_numbers(), vec![98]);
    }

    #[tokio::test]
    async fn surfaces_reorg_inside_batch() {
        let store = Arc::new(MockIndexerStore::new());
        let processor = processor(Arc::clone(&store));

        let err = processor
            .process_batch(&[block(10, 0x10, 0x09), block(11, 0x11, 0xAB)])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Reorg(_)));
        assert!(store.stored_numbers().is_empty());
    }

    #[tokio::test]
    async fn headerless_blocks_marked_for_repair() {
        let store = Arc::new(MockIndexerStore::new());
        let processor = processor(Arc::clone(&store));

        let batch = vec![
            block(1, 0x01, 0x00),
            BlockData::headerless(BlockNumber::new(2), vec![]),
            block(3, 0x03, 0x02),
        ];
        // Block 3's parent check skips the headerless predecessor.
        processor.process_batch(&batch).await.unwrap();

        let checkpoint = store.checkpoint(31337).await.unwrap().unwrap();
        assert_eq!(checkpoint.last_synced_block.value(), 3);

        let skips = store.list_skips(10).await.unwrap();
        assert_eq!(skips.len(), 1);
        assert_eq!(skips[0].from.value(), 2);
    }

    #[tokio::test]
    async fn failed_entries_are_refused() {
        let store = Arc::new(MockIndexerStore::new());
        let processor = processor(store);

        let err = processor
            .process_block(&BlockData::failed(BlockNumber::new(5), "timeout"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Infra(_)));
    }

    #[tokio::test]
    async fn commit_failure_leaves_store_untouched() {
        let store = Arc::new(MockIndexerStore::new());
        store.fail_commits(true);
        let processor = processor(Arc::clone(&store));

        let err = processor.process_block(&block(1, 0x01, 0x00)).await;
        assert!(err.is_err());
        assert!(store.stored_numbers().is_empty());
    }
}
