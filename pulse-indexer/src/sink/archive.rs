//! Append-only compressed archive of raw block/transfer records.
//!
//! Fire-and-forget: writes go into a bounded queue consumed by a
//! background writer that appends gzip-framed JSON lines to a single
//! file. Each queued batch becomes its own gzip member, so a torn tail
//! after a crash only loses the final frame. Queue overflow and writer
//! failures are logged and counted, never propagated - the archive must
//! not be able to abort a primary write.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{InfraError, Result};
use crate::ports::TransferSink;
use crate::types::chain::{StoredBlock, Transfer};

// ═══════════════════════════════════════════════════════════════════════════════
// RECORDS
// ═══════════════════════════════════════════════════════════════════════════════

/// One archived line.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ArchiveRecord<'a> {
    Block(&'a StoredBlock),
    Transfer(&'a Transfer),
}

enum ArchiveMsg {
    Blocks(Vec<StoredBlock>),
    Transfers(Vec<Transfer>),
    Flush(oneshot::Sender<()>),
}

// ═══════════════════════════════════════════════════════════════════════════════
// ARCHIVE SINK
// ═══════════════════════════════════════════════════════════════════════════════

/// Background-written, gzip-framed archive sink.
#[derive(Debug)]
pub struct ArchiveSink {
    tx: mpsc::Sender<ArchiveMsg>,
    dropped: Arc<AtomicU64>,
}

impl ArchiveSink {
    /// Open (or create) the archive at `path` and spawn the writer.
    ///
    /// # Errors
    /// Returns an error when the file or its parent directory cannot be
    /// created; after that, failures are internal to the writer.
    pub fn open(path: impl Into<PathBuf>, queue_capacity: usize) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| InfraError::Internal(format!("archive dir: {e}")))?;
        }
        let file = open_append(&path)?;

        let (tx, rx) = mpsc::channel(queue_capacity.max(16));
        let dropped = Arc::new(AtomicU64::new(0));
        tokio::spawn(writer_loop(file, rx));

        Ok(Self { tx, dropped })
    }

    /// Batches dropped because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn send(&self, msg: ArchiveMsg) {
        if self.tx.try_send(msg).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("archive_dropped_total").increment(1);
            warn!("archive queue full, batch dropped");
        }
    }
}

#[async_trait]
impl TransferSink for ArchiveSink {
    fn name(&self) -> &'static str {
        "archive"
    }

    async fn write_blocks(&self, blocks: &[StoredBlock]) -> Result<()> {
        if !blocks.is_empty() {
            self.send(ArchiveMsg::Blocks(blocks.to_vec()));
        }
        Ok(())
    }

    async fn write_transfers(&self, transfers: &[Transfer]) -> Result<()> {
        if !transfers.is_empty() {
            self.send(ArchiveMsg::Transfers(transfers.to_vec()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(ArchiveMsg::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WRITER
// ═══════════════════════════════════════════════════════════════════════════════

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| InfraError::Internal(format!("archive open {}: {e}", path.display())).into())
}

async fn writer_loop(mut file: File, mut rx: mpsc::Receiver<ArchiveMsg>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            ArchiveMsg::Blocks(blocks) => {
                let records: Vec<ArchiveRecord<'_>> =
                    blocks.iter().map(ArchiveRecord::Block).collect();
                write_frame(&mut file, &records);
            }
            ArchiveMsg::Transfers(transfers) => {
                let records: Vec<ArchiveRecord<'_>> =
                    transfers.iter().map(ArchiveRecord::Transfer).collect();
                write_frame(&mut file, &records);
            }
            ArchiveMsg::Flush(ack) => {
                if let Err(e) = file.sync_data() {
                    warn!(error = %e, "archive fsync failed");
                }
                let _ = ack.send(());
            }
        }
    }
    debug!("archive writer exiting");
}

/// Serialize a batch as JSON lines inside one gzip member.
fn write_frame(file: &mut File, records: &[ArchiveRecord<'_>]) {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for record in records {
        match serde_json::to_vec(record) {
            Ok(line) => {
                let _ = encoder.write_all(&line);
                let _ = encoder.write_all(b"\n");
            }
            Err(e) => warn!(error = %e, "unserializable archive record skipped"),
        }
    }
    match encoder.finish() {
        Ok(frame) => {
            if let Err(e) = file.write_all(&frame) {
                metrics::counter!("archive_write_failures_total").increment(1);
                warn!(error = %e, "archive write failed, frame lost");
            }
        }
        Err(e) => warn!(error = %e, "gzip frame encoding failed"),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
