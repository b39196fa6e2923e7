//! Events broadcast to external consumers through the event hub.
//!
//! Every event serializes as `{"type": ..., "data": ...}` so dashboard
//! and streaming consumers can dispatch on the tag without knowing the
//! payload shape up front.

use serde::{Deserialize, Serialize};

use super::chain::Transfer;
use super::primitives::BlockNumber;

// ═══════════════════════════════════════════════════════════════════════════════
// EVENT ENVELOPE
// ═══════════════════════════════════════════════════════════════════════════════

/// An event published on the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum IndexerEvent {
    /// A block finished processing.
    Block(BlockEvent),
    /// A transfer was decoded (symbol included when already resolved).
    Transfer(Transfer),
    /// Ranked gas consumers over the recent window.
    GasLeaderboard(Vec<GasEntry>),
    /// The watchdog repaired a stalled pipeline.
    SystemHealing(HealingEvent),
    /// A supervised task died and is being restarted.
    EnginePanic(PanicEvent),
    /// Sequencer ordering snapshot.
    LinearityStatus(LinearityStatus),
    /// Lazy-manager run/pause transition.
    LazyStatus(LazyStatus),
}

/// Payload of [`IndexerEvent::Block`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEvent {
    /// Block height.
    pub number: BlockNumber,
    /// Block hash (hex).
    pub hash: String,
    /// Parent hash (hex).
    pub parent_hash: String,
    /// Unix timestamp.
    pub timestamp: u64,
    /// Number of transactions observed.
    pub tx_count: usize,
    /// Latest known chain head.
    pub latest_chain: BlockNumber,
    /// Current sync lag in blocks.
    pub sync_lag: u64,
    /// Rough transfers-per-second over the recent window.
    pub tps: u32,
    /// Human-formatted processing latency for the dashboard.
    pub latency_display: String,
}

/// One row of the gas leaderboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasEntry {
    /// Address (hex).
    pub address: String,
    /// Cumulative gas used.
    pub gas_used: u64,
}

/// Payload of [`IndexerEvent::SystemHealing`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealingEvent {
    /// Why the watchdog intervened.
    pub reason: String,
    /// Expected block before realignment.
    pub before: BlockNumber,
    /// Expected block after realignment.
    pub after: BlockNumber,
}

/// Payload of [`IndexerEvent::EnginePanic`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanicEvent {
    /// Name of the supervised task.
    pub worker: String,
    /// Rendered panic/error message.
    pub error: String,
}

/// Payload of [`IndexerEvent::LinearityStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinearityStatus {
    /// Next block the sequencer will hand to the processor.
    pub expected_block: BlockNumber,
    /// Out-of-order blocks currently buffered.
    pub buffered: usize,
    /// Gap-fill attempts since the last progress.
    pub gap_fill_count: u32,
}

/// Payload of [`IndexerEvent::LazyStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LazyStatus {
    /// `"active"` or `"sleep"`.
    pub state: String,
    /// Seconds since the last recorded activity.
    pub idle_secs: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let event = IndexerEvent::SystemHealing(HealingEvent {
            reason: "space-time tear".into(),
            before: BlockNumber::new(241),
            after: BlockNumber::new(29_948),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "system_healing");
        assert_eq!(json["data"]["before"], 241);
    }

    #[test]
    fn lazy_status_tag() {
        let event = IndexerEvent::LazyStatus(LazyStatus {
            state: "sleep".into(),
            idle_secs: 301,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "lazy_status");
    }
}
