//! Layered error types for the indexer.
//!
//! - [`InfraError`] - infrastructure failures (database, RPC, serialization)
//! - [`AppError`] - application-level errors the pipeline reacts to
//! - [`ReorgError`] - the one error carrying recovery coordinates
//!
//! # Error Philosophy
//!
//! Transient RPC failures are absorbed inside `evm-pool`; everything that
//! reaches this layer either aborts the current unit of work (and is
//! retried by re-scheduling the block) or triggers an explicit recovery
//! procedure. No error silently drops a block: a block is either
//! persisted or lands in the durable skip log.

use alloy::primitives::B256;
use thiserror::Error;

use crate::types::primitives::BlockNumber;

// ═══════════════════════════════════════════════════════════════════════════════
// REORG ERROR
// ═══════════════════════════════════════════════════════════════════════════════

/// A parent-hash mismatch between an incoming block and persisted state.
///
/// Carries everything the sequencer needs to run the realignment
/// procedure: the divergence point and both hashes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "chain reorg at block {at_block}: expected parent {expected_parent}, observed {observed_parent}"
)]
pub struct ReorgError {
    /// Block at which the mismatch was detected.
    pub at_block: BlockNumber,
    /// Hash we have persisted for `at_block - 1`.
    pub expected_parent: B256,
    /// Parent hash the incoming block actually carries.
    pub observed_parent: B256,
}

// ═══════════════════════════════════════════════════════════════════════════════
// INFRASTRUCTURE ERRORS
// ═══════════════════════════════════════════════════════════════════════════════

/// Infrastructure-level errors from external systems.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InfraError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// RPC error surfaced by the client pool.
    #[error("RPC error: {0}")]
    Rpc(#[from] evm_pool::PoolError),

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration file error.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Timeout waiting for an operation.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Catch-all for internal invariant violations.
    #[error("internal error: {0}")]
    Internal(String),
}

// ═══════════════════════════════════════════════════════════════════════════════
// APPLICATION ERRORS
// ═══════════════════════════════════════════════════════════════════════════════

/// Application-level errors, the primary error type of the service.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AppError {
    /// Infrastructure error.
    #[error(transparent)]
    Infra(#[from] InfraError),

    /// Chain reorganization detected; recovered by the sequencer.
    #[error(transparent)]
    Reorg(#[from] ReorgError),

    /// Scheduling refused because queue depth is above the watermark.
    ///
    /// Advisory: callers retry with exponential backoff.
    #[error("backpressure: queue above watermark, retry in {retry_after_ms} ms")]
    BackpressureBlocked {
        /// Suggested backoff before the next attempt.
        retry_after_ms: u64,
    },

    /// A gap could not be filled after the configured number of attempts.
    #[error("unfillable gap [{from}, {to})")]
    GapUnfillable {
        /// First missing block (inclusive).
        from: BlockNumber,
        /// First present block (exclusive end of the gap).
        to: BlockNumber,
    },

    /// Startup failed before the pipeline was assembled.
    #[error("initialization error: {0}")]
    Initialization(String),

    /// Graceful shutdown requested.
    #[error("shutdown requested")]
    ShutdownRequested,
}

impl AppError {
    /// Whether this error aborts the block it occurred on without
    /// poisoning the pipeline (the block is retried on re-schedule).
    #[must_use]
    pub const fn is_block_local(&self) -> bool {
        matches!(
            self,
            Self::Infra(InfraError::Database(_) | InfraError::Rpc(_))
        )
    }
}

/// Type alias for application Results.
pub type Result<T> = std::result::Result<T, AppError>;

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reorg_error_displays_coordinates() {
        let err = ReorgError {
            at_block: BlockNumber::new(99),
            expected_parent: B256::from([0xAA; 32]),
            observed_parent: B256::from([0xBB; 32]),
        };
        let msg = err.to_string();
        assert!(msg.contains("99"));
        assert!(msg.contains("0xaaaa"));
    }

    #[test]
    fn app_error_from_reorg() {
        let reorg = ReorgError {
            at_block: BlockNumber::new(5),
            expected_parent: B256::ZERO,
            observed_parent: B256::from([1; 32]),
        };
        let app: AppError = reorg.into();
        assert!(matches!(app, AppError::Reorg(_)));
    }

    #[test]
    fn database_errors_are_block_local() {
        let app: AppError = InfraError::Database(sqlx::Error::PoolClosed).into();
        assert!(app.is_block_local());

        let bp = AppError::BackpressureBlocked { retry_after_ms: 100 };
        assert!(!bp.is_block_local());
    }
}
