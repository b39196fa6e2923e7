//! Domain types.
//!
//! - [`primitives`] - validated newtypes (block numbers, addresses, amounts)
//! - [`chain`] - chain-facing entities (block data, transfers, checkpoints)
//! - [`events`] - hub event payloads

pub mod chain;
pub mod events;
pub mod primitives;

pub use chain::{
    ActivityType, BlockData, BlockHeader, Checkpoint, HeightSnapshot, StoredBlock, TokenMetadata,
    Transfer, SYNTHETIC_LOG_BASE,
};
pub use events::{
    BlockEvent, GasEntry, HealingEvent, IndexerEvent, LazyStatus, LinearityStatus, PanicEvent,
};
pub use primitives::{BlockNumber, EthAddress, TokenAmount};
