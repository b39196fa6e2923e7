//! Port traits decoupling the pipeline from infrastructure.
//!
//! - [`store`] - durable persistence (blocks, transfers, checkpoints)
//! - [`sink`] - secondary write targets (archive, hot buffer)
//!
//! Adapters live in [`crate::store`] and [`crate::sink`]; tests inject
//! the mocks exported behind the `test-utils` feature.

pub mod sink;
pub mod store;

pub use sink::TransferSink;
pub use store::{CommitBatch, CommitOutcome, IndexerStore, SkippedRange};

#[cfg(any(test, feature = "test-utils"))]
pub use store::mock::MockIndexerStore;
