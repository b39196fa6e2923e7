//! End-to-end ordering scenarios against an in-memory store.
//!
//! The sequencer consumes a results channel the tests feed directly,
//! standing in for the fetch worker pool. Run with:
//! `cargo test --features test-utils`

#![cfg(feature = "test-utils")]
#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::B256;
use evm_pool::{ClientPool, PoolConfig};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use pulse_indexer::config::{FetcherSettings, SequencerSettings};
use pulse_indexer::control::{BackpressureGauge, HeightOracle};
use pulse_indexer::error::Result;
use pulse_indexer::events::EventHub;
use pulse_indexer::pipeline::{Fetcher, Processor, Sequencer, SequencerConfig, SequencerHandle};
use pulse_indexer::ports::{IndexerStore, MockIndexerStore};
use pulse_indexer::sink::MultiSink;
use pulse_indexer::types::{BlockData, BlockHeader, BlockNumber};

const CHAIN_ID: u64 = 31337;

// ═══════════════════════════════════════════════════════════════════════════════
// HARNESS
// ═══════════════════════════════════════════════════════════════════════════════

struct Harness {
    store: Arc<MockIndexerStore>,
    sequencer: Arc<Sequencer<MockIndexerStore>>,
    handle: SequencerHandle,
    tx: mpsc::Sender<BlockData>,
    gauge: Arc<BackpressureGauge>,
    oracle: Arc<HeightOracle>,
    cancel: CancellationToken,
}

impl Harness {
    fn new(start: u64, store: Arc<MockIndexerStore>, bypass: bool) -> (Self, mpsc::Receiver<BlockData>) {
        let cancel = CancellationToken::new();
        let gauge = Arc::new(BackpressureGauge::with_capacity(10_000));
        let oracle = Arc::new(HeightOracle::new());
        let hub = EventHub::new();

        // The pool is never dialed; the fetcher only provides a handle
        // for refill requests, which land in its (unworked) job queue.
        let pool = ClientPool::from_urls(
            &["http://localhost:1".into()],
            PoolConfig::default(),
            cancel.clone(),
        )
        .unwrap();
        let (fetcher, _unused_results) = Fetcher::new(
            pool,
            Arc::clone(&gauge),
            FetcherSettings {
                concurrency: 1,
                max_sync_batch: 500,
                get_logs_range_cap: 2000,
                header_retries: 0,
            },
            cancel.clone(),
        );

        let processor = Arc::new(Processor::new(
            Arc::clone(&store),
            Arc::new(MultiSink::new(vec![])),
            None,
            hub.clone(),
            Arc::clone(&oracle),
            CHAIN_ID,
            vec![],
        ));

        let sequencer = Arc::new(Sequencer::new(
            BlockNumber::new(start),
            SequencerConfig {
                settings: SequencerSettings {
                    gap_threshold: 5,
                    gap_detect_window_ms: 100,
                    stall_threshold_secs: 60,
                    buffer_cap: 10_000,
                    max_gap_fill_attempts: 3,
                    bypass_enabled: Some(bypass),
                },
                bypass_enabled: bypass,
                lab_mode: true,
                batch_size: 10,
            },
            processor,
            Arc::clone(&store),
            fetcher.handle(),
            Arc::clone(&gauge),
            Arc::clone(&oracle),
            hub,
            CHAIN_ID,
        ));

        let (tx, rx) = mpsc::channel(1024);
        let handle = sequencer.handle();
        (
            Self {
                store,
                sequencer,
                handle,
                tx,
                gauge,
                oracle,
                cancel,
            },
            rx,
        )
    }

    fn spawn(&self, mut rx: mpsc::Receiver<BlockData>) -> tokio::task::JoinHandle<Result<()>> {
        let sequencer = Arc::clone(&self.sequencer);
        let cancel = self.cancel.clone();
        tokio::spawn(async move { sequencer.run(&mut rx, cancel).await })
    }

    /// Feed one result as the fetcher would (gauge accounting included).
    async fn send(&self, data: BlockData) {
        self.gauge.incr();
        self.tx.send(data).await.unwrap();
    }

    /// Poll until the store holds `expected` blocks or the deadline hits.
    async fn wait_for_blocks(&self, expected: usize) {
        for _ in 0..200 {
            if self.store.stored_numbers().len() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "timed out waiting for {expected} blocks, have {:?}",
            self.store.stored_numbers()
        );
    }
}

fn header(number: u64, hash: u8, parent: u8) -> BlockHeader {
    BlockHeader {
        number: BlockNumber::new(number),
        hash: B256::from([hash; 32]),
        parent_hash: B256::from([parent; 32]),
        timestamp: 1_700_000_000 + number,
        gas_used: 21_000,
    }
}

/// A linked chain block: hash byte = height, parent byte = height - 1.
#[allow(clippy::cast_possible_truncation)]
fn linked(number: u64) -> BlockData {
    BlockData::new(header(number, number as u8, (number - 1) as u8), vec![], vec![])
}

// ═══════════════════════════════════════════════════════════════════════════════
// SCENARIO: OUT-OF-ORDER ARRIVALS
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn out_of_order_arrivals_process_in_order() {
    let (harness, rx) = Harness::new(91, Arc::new(MockIndexerStore::new()), false);
    let task = harness.spawn(rx);

    // Arrival order 92, 94, 91, 93 with expected = 91.
    harness.send(linked(92)).await;
    harness.send(linked(94)).await;

    // Nothing can process until 91 shows up.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(harness.store.stored_numbers().is_empty());
    assert!(harness.handle.buffered() <= 3);

    harness.send(linked(91)).await;
    harness.send(linked(93)).await;

    harness.wait_for_blocks(4).await;
    // Strictly increasing processing order implies this exact layout.
    assert_eq!(harness.store.stored_numbers(), vec![91, 92, 93, 94]);
    assert_eq!(harness.handle.expected_block().value(), 95);
    assert_eq!(harness.handle.buffered(), 0);

    harness.cancel.cancel();
    let _ = task.await;
}

#[tokio::test]
async fn stale_blocks_are_dropped() {
    let store = Arc::new(MockIndexerStore::new());
    let (harness, rx) = Harness::new(100, store, false);
    let task = harness.spawn(rx);

    harness.send(linked(99)).await;
    harness.send(linked(100)).await;
    harness.wait_for_blocks(1).await;

    // 99 was below expected and never persisted.
    assert_eq!(harness.store.stored_numbers(), vec![100]);

    harness.cancel.cancel();
    let _ = task.await;
}

// ═══════════════════════════════════════════════════════════════════════════════
// SCENARIO: SHALLOW REORG AT HEAD
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn shallow_reorg_rolls_back_and_reprocesses() {
    // Blocks 98, 99, 100 persisted on the old branch.
    let store = Arc::new(MockIndexerStore::with_blocks(vec![
        (&header(98, 0x98, 0x97)).into(),
        (&header(99, 0x99, 0x98)).into(),
        (&header(100, 0xA0, 0x99)).into(),
    ]));
    store.set_checkpoint(CHAIN_ID, BlockNumber::new(100)).await.unwrap();

    // The provider now serves a replacement branch from 99 up.
    let (harness, rx) = Harness::new(99, Arc::clone(&store), false);
    harness.oracle.set_chain_head(BlockNumber::new(101));
    let task = harness.spawn(rx);

    // 99' links to 98 but its own hash differs from the stored 99.
    harness.send(BlockData::new(header(99, 0xB9, 0x98), vec![], vec![])).await;

    // Realignment: 99 and 100 deleted, checkpoint rewound to 98.
    for _ in 0..200 {
        if store.stored_numbers() == vec![98] {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(store.stored_numbers(), vec![98]);
    let checkpoint = store.checkpoint(CHAIN_ID).await.unwrap().unwrap();
    assert_eq!(checkpoint.last_synced_block.value(), 98);
    assert_eq!(harness.handle.expected_block().value(), 99);

    // The replacement branch arrives (re-fetched after the resume).
    harness.send(BlockData::new(header(99, 0xB9, 0x98), vec![], vec![])).await;
    harness.send(BlockData::new(header(100, 0xBA, 0xB9), vec![], vec![])).await;
    harness.send(BlockData::new(header(101, 0xBB, 0xBA), vec![], vec![])).await;

    harness.wait_for_blocks(4).await;
    assert_eq!(store.stored_numbers(), vec![98, 99, 100, 101]);

    // Parent links are consistent across the repaired head.
    let hash_99 = store.block_hash(BlockNumber::new(99)).await.unwrap().unwrap();
    assert_eq!(hash_99, B256::from([0xB9; 32]));
    let checkpoint = store.checkpoint(CHAIN_ID).await.unwrap().unwrap();
    assert_eq!(checkpoint.last_synced_block.value(), 101);

    harness.cancel.cancel();
    let _ = task.await;
}

// ═══════════════════════════════════════════════════════════════════════════════
// SCENARIO: UNFILLABLE GAP (LAB MODE BYPASS)
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn unfillable_gap_bypasses_with_recorded_skip() {
    let (harness, rx) = Harness::new(500, Arc::new(MockIndexerStore::new()), true);
    let task = harness.spawn(rx);

    // Blocks 501-510 buffer up while 500 keeps failing.
    for number in 501..=510 {
        harness.send(linked(number)).await;
    }
    for _ in 0..3 {
        harness
            .send(BlockData::failed(BlockNumber::new(500), "provider black hole"))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // After three failed fills the sequencer bypasses to 501.
    harness.wait_for_blocks(10).await;
    assert_eq!(
        harness.store.stored_numbers(),
        (501..=510).collect::<Vec<u64>>()
    );

    // The skipped range is durably recorded for repair.
    let skips = harness.store.list_skips(10).await.unwrap();
    assert!(
        skips
            .iter()
            .any(|s| s.from.value() == 500 && s.to.value() == 501 && s.reason == "gap_bypass"),
        "expected [500,501) gap_bypass in {skips:?}"
    );

    harness.cancel.cancel();
    let _ = task.await;
}

#[tokio::test]
async fn production_mode_never_bypasses() {
    let (harness, rx) = Harness::new(500, Arc::new(MockIndexerStore::new()), false);
    let task = harness.spawn(rx);

    for number in 501..=505 {
        harness.send(linked(number)).await;
    }
    for _ in 0..5 {
        harness
            .send(BlockData::failed(BlockNumber::new(500), "provider black hole"))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    // No bypass: nothing persisted, no gap_bypass skip recorded.
    assert!(harness.store.stored_numbers().is_empty());
    assert!(harness.store.list_skips(10).await.unwrap().is_empty());
    assert_eq!(harness.handle.expected_block().value(), 500);

    harness.cancel.cancel();
    let _ = task.await;
}

// ═══════════════════════════════════════════════════════════════════════════════
// IDEMPOTENCE
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn reprocessing_identical_blocks_is_idempotent() {
    let store = Arc::new(MockIndexerStore::new());

    // First run: blocks 1-3.
    {
        let (harness, rx) = Harness::new(1, Arc::clone(&store), false);
        let task = harness.spawn(rx);
        for number in 1..=3 {
            harness.send(linked(number)).await;
        }
        harness.wait_for_blocks(3).await;
        harness.cancel.cancel();
        let _ = task.await;
    }
    let first_pass = store.stored_numbers();

    // Second run over the same responses, as after a restart mid-batch.
    {
        let (harness, rx) = Harness::new(1, Arc::clone(&store), false);
        let task = harness.spawn(rx);
        for number in 1..=3 {
            harness.send(linked(number)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        harness.cancel.cancel();
        let _ = task.await;
    }

    assert_eq!(store.stored_numbers(), first_pass);
    assert_eq!(
        store.checkpoint(CHAIN_ID).await.unwrap().unwrap().last_synced_block.value(),
        3
    );
}
