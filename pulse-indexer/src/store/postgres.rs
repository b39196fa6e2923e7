//! PostgreSQL implementation of the storage port using SQLx.
//!
//! # Type Conversions
//!
//! Block heights and amounts live in `NUMERIC(78,0)` columns so the
//! full unsigned 256-bit range survives; values are bound as
//! `BigDecimal`, never floats. Hashes and addresses are stored as
//! lowercase 0x-prefixed hex (`CHAR(66)` / `CHAR(42)`).
//!
//! # Atomicity
//!
//! [`IndexerStore::commit`] runs inside a single transaction: block
//! rows, transfer rows, skip records and the checkpoint advance either
//! all land or none do. Reorg rollback rides the `ON DELETE CASCADE`
//! from `blocks` to `transfers`.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap
)]

use alloy::primitives::B256;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::BigDecimal;
use tracing::{debug, instrument};

use crate::config::Settings;
use crate::error::{InfraError, Result};
use crate::ports::{CommitBatch, CommitOutcome, IndexerStore, SkippedRange};
use crate::types::chain::{Checkpoint, TokenMetadata};
use crate::types::primitives::{BlockNumber, EthAddress};

// ═══════════════════════════════════════════════════════════════════════════════
// HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

fn bd(n: u64) -> BigDecimal {
    BigDecimal::from(n)
}

fn bd_to_u64(value: &BigDecimal) -> Result<u64> {
    value
        .to_string()
        .parse::<u64>()
        .map_err(|e| InfraError::Internal(format!("non-integral height in DB: {e}")).into())
}

fn parse_hash(hex_str: &str) -> Result<B256> {
    hex_str
        .trim()
        .parse::<B256>()
        .map_err(|e| InfraError::Internal(format!("invalid hash in DB: {e}")).into())
}

// ═══════════════════════════════════════════════════════════════════════════════
// POSTGRES STORE
// ═══════════════════════════════════════════════════════════════════════════════

/// PostgreSQL-backed store implementation.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wrap an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect using the configured URL and mode-dependent pool sizing.
    ///
    /// # Errors
    /// Returns an error if the connection cannot be established.
    pub async fn connect(settings: &Settings) -> Result<Self> {
        let (max, min) = settings.db_pool_sizes();
        let pool = PgPoolOptions::new()
            .max_connections(max)
            .min_connections(min)
            .connect(&settings.database.url)
            .await
            .map_err(InfraError::Database)?;
        Ok(Self::new(pool))
    }

    /// Get a reference to the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations.
    ///
    /// # Errors
    /// Returns an error if migrations fail.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| InfraError::Internal(format!("migration error: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl IndexerStore for PostgresStore {
    #[instrument(skip(self))]
    async fn checkpoint(&self, chain_id: u64) -> Result<Option<Checkpoint>> {
        let row: Option<(BigDecimal, chrono::DateTime<chrono::Utc>)> = sqlx::query_as(
            "SELECT last_synced_block, updated_at FROM sync_checkpoints WHERE chain_id = $1",
        )
        .bind(bd(chain_id))
        .fetch_optional(&self.pool)
        .await
        .map_err(InfraError::Database)?;

        match row {
            Some((block, updated_at)) => Ok(Some(Checkpoint {
                chain_id,
                last_synced_block: BlockNumber::new(bd_to_u64(&block)?),
                updated_at,
            })),
            None => Ok(None),
        }
    }

    #[instrument(skip(self), fields(block = %block))]
    async fn set_checkpoint(&self, chain_id: u64, block: BlockNumber) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_checkpoints (chain_id, last_synced_block, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (chain_id) DO UPDATE SET
                last_synced_block = EXCLUDED.last_synced_block,
                updated_at = NOW()
            "#,
        )
        .bind(bd(chain_id))
        .bind(bd(block.value()))
        .execute(&self.pool)
        .await
        .map_err(InfraError::Database)?;

        debug!("checkpoint forced");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn max_stored_block(&self) -> Result<Option<BlockNumber>> {
        let max: Option<BigDecimal> = sqlx::query_scalar("SELECT MAX(number) FROM blocks")
            .fetch_one(&self.pool)
            .await
            .map_err(InfraError::Database)?;

        max.map(|value| Ok(BlockNumber::new(bd_to_u64(&value)?)))
            .transpose()
    }

    #[instrument(skip(self), fields(number = %number))]
    async fn block_hash(&self, number: BlockNumber) -> Result<Option<B256>> {
        let hash: Option<String> =
            sqlx::query_scalar("SELECT hash FROM blocks WHERE number = $1")
                .bind(bd(number.value()))
                .fetch_optional(&self.pool)
                .await
                .map_err(InfraError::Database)?;

        hash.map(|h| parse_hash(&h)).transpose()
    }

    #[instrument(skip(self, batch), fields(
        blocks = batch.blocks.len(),
        transfers = batch.transfers.len()
    ))]
    async fn commit(&self, chain_id: u64, batch: CommitBatch) -> Result<CommitOutcome> {
        let mut tx = self.pool.begin().await.map_err(InfraError::Database)?;
        let mut outcome = CommitOutcome::default();

        for block in &batch.blocks {
            let result = sqlx::query(
                r#"
                INSERT INTO blocks (number, hash, parent_hash, timestamp, processed_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (number) DO NOTHING
                "#,
            )
            .bind(bd(block.number.value()))
            .bind(format!("{:#x}", block.hash))
            .bind(format!("{:#x}", block.parent_hash))
            .bind(bd(block.timestamp))
            .bind(block.processed_at)
            .execute(&mut *tx)
            .await
            .map_err(InfraError::Database)?;
            outcome.blocks_inserted += result.rows_affected();
        }

        for transfer in &batch.transfers {
            let result = sqlx::query(
                r#"
                INSERT INTO transfers (
                    block_number, tx_hash, log_index, from_address,
                    to_address, amount, token_address
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (block_number, log_index) DO NOTHING
                "#,
            )
            .bind(bd(transfer.block_number.value()))
            .bind(format!("{:#x}", transfer.tx_hash))
            .bind(transfer.log_index as i32)
            .bind(transfer.from.to_hex())
            .bind(transfer.to.to_hex())
            .bind(transfer.amount.to_sql())
            .bind(transfer.token.to_hex())
            .execute(&mut *tx)
            .await
            .map_err(InfraError::Database)?;
            outcome.transfers_inserted += result.rows_affected();
        }

        for number in &batch.headerless {
            sqlx::query(
                "INSERT INTO skipped_ranges (from_block, to_block, reason) VALUES ($1, $2, $3)",
            )
            .bind(bd(number.value()))
            .bind(bd(number.next().value()))
            .bind("missing_header")
            .execute(&mut *tx)
            .await
            .map_err(InfraError::Database)?;
        }

        if let Some(checkpoint) = batch.checkpoint {
            // The checkpoint only moves forward inside a commit; rewinds
            // go through rollback_to or set_checkpoint explicitly.
            sqlx::query(
                r#"
                INSERT INTO sync_checkpoints (chain_id, last_synced_block, updated_at)
                VALUES ($1, $2, NOW())
                ON CONFLICT (chain_id) DO UPDATE SET
                    last_synced_block = GREATEST(
                        sync_checkpoints.last_synced_block, EXCLUDED.last_synced_block
                    ),
                    updated_at = NOW()
                "#,
            )
            .bind(bd(chain_id))
            .bind(bd(checkpoint.value()))
            .execute(&mut *tx)
            .await
            .map_err(InfraError::Database)?;
        }

        tx.commit().await.map_err(InfraError::Database)?;
        debug!(
            blocks = outcome.blocks_inserted,
            transfers = outcome.transfers_inserted,
            "batch committed"
        );
        Ok(outcome)
    }

    #[instrument(skip(self), fields(divergence = %divergence))]
    async fn rollback_to(&self, chain_id: u64, divergence: BlockNumber) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(InfraError::Database)?;

        // Transfers cascade from blocks.
        let deleted = sqlx::query("DELETE FROM blocks WHERE number >= $1")
            .bind(bd(divergence.value()))
            .execute(&mut *tx)
            .await
            .map_err(InfraError::Database)?;

        sqlx::query(
            r#"
            INSERT INTO sync_checkpoints (chain_id, last_synced_block, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (chain_id) DO UPDATE SET
                last_synced_block = EXCLUDED.last_synced_block,
                updated_at = NOW()
            "#,
        )
        .bind(bd(chain_id))
        .bind(bd(divergence.prev().value()))
        .execute(&mut *tx)
        .await
        .map_err(InfraError::Database)?;

        tx.commit().await.map_err(InfraError::Database)?;
        debug!(deleted = deleted.rows_affected(), "reorg rollback executed");
        Ok(())
    }

    #[instrument(skip(self), fields(from = %range.from, to = %range.to))]
    async fn record_skip(&self, range: SkippedRange) -> Result<()> {
        sqlx::query(
            "INSERT INTO skipped_ranges (from_block, to_block, reason) VALUES ($1, $2, $3)",
        )
        .bind(bd(range.from.value()))
        .bind(bd(range.to.value()))
        .bind(&range.reason)
        .execute(&self.pool)
        .await
        .map_err(InfraError::Database)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_skips(&self, limit: u32) -> Result<Vec<SkippedRange>> {
        let rows: Vec<(BigDecimal, BigDecimal, String)> = sqlx::query_as(
            r#"
            SELECT from_block, to_block, reason
            FROM skipped_ranges
            ORDER BY recorded_at DESC
            LIMIT $1
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(InfraError::Database)?;

        rows.into_iter()
            .map(|(from, to, reason)| {
                Ok(SkippedRange {
                    from: BlockNumber::new(bd_to_u64(&from)?),
                    to: BlockNumber::new(bd_to_u64(&to)?),
                    reason,
                })
            })
            .collect()
    }

    #[instrument(skip(self, tokens), fields(count = tokens.len()))]
    async fn upsert_token_metadata(&self, tokens: &[TokenMetadata]) -> Result<()> {
        if tokens.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(InfraError::Database)?;
        for token in tokens {
            sqlx::query(
                r#"
                INSERT INTO token_metadata (address, symbol, decimals, name)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (address) DO UPDATE SET
                    symbol = EXCLUDED.symbol,
                    decimals = EXCLUDED.decimals,
                    name = COALESCE(EXCLUDED.name, token_metadata.name)
                "#,
            )
            .bind(token.address.to_hex())
            .bind(&token.symbol)
            .bind(i16::from(token.decimals))
            .bind(&token.name)
            .execute(&mut *tx)
            .await
            .map_err(InfraError::Database)?;
        }
        tx.commit().await.map_err(InfraError::Database)?;
        debug!("token metadata upserted");
        Ok(())
    }

    #[instrument(skip(self), fields(address = %address))]
    async fn token_metadata(&self, address: &EthAddress) -> Result<Option<TokenMetadata>> {
        let row: Option<(String, Option<String>, i16, Option<String>)> = sqlx::query_as(
            "SELECT address, symbol, decimals, name FROM token_metadata WHERE address = $1",
        )
        .bind(address.to_hex())
        .fetch_optional(&self.pool)
        .await
        .map_err(InfraError::Database)?;

        row.map(|(addr, symbol, decimals, name)| {
            Ok(TokenMetadata {
                address: EthAddress::from_hex(&addr)
                    .map_err(|e| InfraError::Internal(format!("invalid address in DB: {e}")))?,
                symbol,
                decimals: decimals as u8,
                name,
            })
        })
        .transpose()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
