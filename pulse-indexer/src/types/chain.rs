//! Chain-facing domain entities.
//!
//! [`BlockData`] is the unit flowing from the fetcher to the sequencer;
//! it is created by exactly one fetch worker and consumed exactly once.
//! [`StoredBlock`] and [`Transfer`] are the persisted shapes.

use alloy::primitives::B256;
use alloy::rpc::types::Log;
use chrono::{DateTime, Utc};
use evm_pool::{RpcBlock, RpcTransaction};
use serde::{Deserialize, Serialize};

use super::primitives::{BlockNumber, EthAddress, TokenAmount};

// ═══════════════════════════════════════════════════════════════════════════════
// BLOCK HEADER / BLOCK DATA
// ═══════════════════════════════════════════════════════════════════════════════

/// The header fields the pipeline consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block height.
    pub number: BlockNumber,
    /// Block hash.
    pub hash: B256,
    /// Parent block hash.
    pub parent_hash: B256,
    /// Unix timestamp.
    pub timestamp: u64,
    /// Gas used by the whole block.
    pub gas_used: u64,
}

impl BlockHeader {
    /// A header whose hash equals its parent hash is provider garbage
    /// and is rejected at the fetch boundary.
    #[must_use]
    pub fn is_self_referential(&self) -> bool {
        self.hash == self.parent_hash
    }
}

impl From<&RpcBlock> for BlockHeader {
    fn from(block: &RpcBlock) -> Self {
        Self {
            number: BlockNumber::new(block.number),
            hash: block.hash,
            parent_hash: block.parent_hash,
            timestamp: block.timestamp,
            gas_used: block.gas_used,
        }
    }
}

/// A fetched block on its way to the sequencer.
///
/// `header: None` with non-empty logs is the tolerated
/// "logs-without-header" case (provider hiccup); `error: Some(..)`
/// means the height could not be fetched at all and empties both.
#[derive(Debug, Clone)]
pub struct BlockData {
    /// Block height this unit describes.
    pub number: BlockNumber,
    /// Header, when the provider returned one.
    pub header: Option<BlockHeader>,
    /// Raw logs for the block, ordered by log index.
    pub logs: Vec<Log>,
    /// Transaction bodies from the full-block walk (native transfers).
    pub transactions: Vec<RpcTransaction>,
    /// Fetch failure, if any.
    pub error: Option<String>,
}

impl BlockData {
    /// A fully-fetched block.
    #[must_use]
    pub fn new(header: BlockHeader, logs: Vec<Log>, transactions: Vec<RpcTransaction>) -> Self {
        Self {
            number: header.number,
            header: Some(header),
            logs,
            transactions,
            error: None,
        }
    }

    /// Logs arrived but the header did not.
    #[must_use]
    pub fn headerless(number: BlockNumber, logs: Vec<Log>) -> Self {
        Self {
            number,
            header: None,
            logs,
            transactions: Vec::new(),
            error: None,
        }
    }

    /// The height could not be fetched.
    #[must_use]
    pub fn failed(number: BlockNumber, error: impl Into<String>) -> Self {
        Self {
            number,
            header: None,
            logs: Vec::new(),
            transactions: Vec::new(),
            error: Some(error.into()),
        }
    }

    /// Whether this unit carries usable payload.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PERSISTED SHAPES
// ═══════════════════════════════════════════════════════════════════════════════

/// Persisted block row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBlock {
    /// Block height (primary key).
    pub number: BlockNumber,
    /// Block hash.
    pub hash: B256,
    /// Parent hash, the chain-continuity link.
    pub parent_hash: B256,
    /// Unix timestamp.
    pub timestamp: u64,
    /// When this row was written.
    pub processed_at: DateTime<Utc>,
}

impl From<&BlockHeader> for StoredBlock {
    fn from(header: &BlockHeader) -> Self {
        Self {
            number: header.number,
            hash: header.hash,
            parent_hash: header.parent_hash,
            timestamp: header.timestamp,
            processed_at: Utc::now(),
        }
    }
}

/// Coarse classification of what a decoded event represents.
///
/// Everything except `Transfer` and `EthTransfer` is a best-effort
/// topic-0 heuristic, not an authoritative label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityType {
    /// Canonical ERC-20 transfer event.
    Transfer,
    /// DEX swap.
    Swap,
    /// ERC-20 approval.
    Approve,
    /// Liquidity mint.
    Mint,
    /// Native value transaction.
    EthTransfer,
    /// Unrecognized contract event.
    ContractEvent,
    /// Contract creation transaction.
    Deploy,
    /// Faucet claim.
    FaucetClaim,
}

impl ActivityType {
    /// Display name, matching the serialized form.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Transfer => "TRANSFER",
            Self::Swap => "SWAP",
            Self::Approve => "APPROVE",
            Self::Mint => "MINT",
            Self::EthTransfer => "ETH_TRANSFER",
            Self::ContractEvent => "CONTRACT_EVENT",
            Self::Deploy => "DEPLOY",
            Self::FaucetClaim => "FAUCET_CLAIM",
        }
    }
}

/// A decoded transfer-like event.
///
/// `(block_number, log_index)` uniquely identifies the event; native
/// transfers synthesized from the transaction walk use
/// `SYNTHETIC_LOG_BASE + tx_index` so they never collide with real logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    /// Block the event occurred in.
    pub block_number: BlockNumber,
    /// Transaction hash.
    pub tx_hash: B256,
    /// Log index within the block.
    pub log_index: u64,
    /// Sender.
    pub from: EthAddress,
    /// Recipient.
    pub to: EthAddress,
    /// Amount moved, full 256-bit range.
    pub amount: TokenAmount,
    /// Emitting token contract; [`EthAddress::ZERO`] for native value.
    pub token: EthAddress,
    /// What kind of activity this event represents.
    pub activity: ActivityType,
    /// Token symbol, filled in asynchronously by the enricher.
    pub symbol: Option<String>,
}

/// Offset for synthetic log indexes of native transfers.
pub const SYNTHETIC_LOG_BASE: u64 = 100_000;

// ═══════════════════════════════════════════════════════════════════════════════
// CHECKPOINT / METADATA / HEIGHT
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-chain sync checkpoint; exactly one row per chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Chain identifier.
    pub chain_id: u64,
    /// Highest block fully persisted for this chain.
    pub last_synced_block: BlockNumber,
    /// When the checkpoint last advanced.
    pub updated_at: DateTime<Utc>,
}

/// Resolved token metadata. Last writer wins on conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMetadata {
    /// Token contract address.
    pub address: EthAddress,
    /// Token symbol, sanitized for storage.
    pub symbol: Option<String>,
    /// Token decimals (default 18).
    pub decimals: u8,
    /// Token name.
    pub name: Option<String>,
}

/// Ephemeral height snapshot published by the height oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HeightSnapshot {
    /// Latest observed chain head.
    pub chain_head: BlockNumber,
    /// Highest block the pipeline has fully processed.
    pub sync_cursor: BlockNumber,
}

impl HeightSnapshot {
    /// `max(0, chain_head - sync_cursor)`.
    #[must_use]
    pub const fn lag(&self) -> u64 {
        self.chain_head.distance_from(self.sync_cursor)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
