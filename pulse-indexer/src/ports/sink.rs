//! Sink port for secondary write targets.
//!
//! The durable store is written transactionally through
//! [`IndexerStore`](super::IndexerStore); everything else (archive file,
//! hot buffer, future targets) implements [`TransferSink`] and is fanned
//! out to by the composite sink. A secondary sink failure must never
//! fail the primary write - implementations log and move on.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::chain::{StoredBlock, Transfer};

/// Capability for a secondary write target.
///
/// Adding a sink means implementing this trait and registering it with
/// the composite; the processor never changes.
#[async_trait]
pub trait TransferSink: Send + Sync {
    /// Short name for logs and metrics.
    fn name(&self) -> &'static str;

    /// Write a batch of block records.
    ///
    /// # Errors
    /// Returns an error on sink-local failure; the caller logs and
    /// continues.
    async fn write_blocks(&self, blocks: &[StoredBlock]) -> Result<()>;

    /// Write a batch of transfer records.
    ///
    /// # Errors
    /// Returns an error on sink-local failure; the caller logs and
    /// continues.
    async fn write_transfers(&self, transfers: &[Transfer]) -> Result<()>;

    /// Flush and release resources.
    ///
    /// # Errors
    /// Returns an error if the final flush fails.
    async fn close(&self) -> Result<()>;
}
