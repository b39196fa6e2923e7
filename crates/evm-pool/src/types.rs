//! Wire types for the JSON-RPC boundary.
//!
//! Requests and responses follow JSON-RPC 2.0. Quantities arrive as
//! 0x-prefixed hex strings and are decoded into native integers here, so
//! the rest of the system never touches raw hex.

use alloy::primitives::{Address, B256, Bytes, U256};
use serde::{Deserialize, Deserializer, Serialize};

// ═══════════════════════════════════════════════════════════════════════════════
// JSON-RPC ENVELOPE
// ═══════════════════════════════════════════════════════════════════════════════

/// A JSON-RPC 2.0 request.
#[derive(Debug, Serialize)]
pub struct JsonRpcRequest<'a, P> {
    /// Protocol version, always "2.0".
    pub jsonrpc: &'static str,
    /// Method name (e.g., `eth_getLogs`).
    pub method: &'a str,
    /// Method parameters.
    pub params: P,
    /// Request ID for correlation.
    pub id: u64,
}

impl<'a, P> JsonRpcRequest<'a, P> {
    /// Create a new request with the given method, params and ID.
    pub const fn new(method: &'a str, params: P, id: u64) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
            id,
        }
    }
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Deserialize)]
pub struct JsonRpcResponse<R> {
    /// Result payload (absent on error).
    #[serde(default = "Option::default")]
    pub result: Option<R>,
    /// Error payload (absent on success).
    #[serde(default = "Option::default")]
    pub error: Option<crate::error::RpcErrorDetail>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// HEX QUANTITY DECODING
// ═══════════════════════════════════════════════════════════════════════════════

fn u64_from_hex<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    let trimmed = s.strip_prefix("0x").unwrap_or(&s);
    u64::from_str_radix(trimmed, 16).map_err(serde::de::Error::custom)
}

fn u256_from_hex<'de, D>(deserializer: D) -> Result<U256, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.parse::<U256>().map_err(serde::de::Error::custom)
}

/// Like [`u64_from_hex`] but tolerates an absent or null field.
fn u64_from_hex_opt<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let s: Option<String> = Option::deserialize(deserializer)?;
    match s {
        Some(s) => {
            let trimmed = s.strip_prefix("0x").unwrap_or(&s);
            u64::from_str_radix(trimmed, 16).map_err(serde::de::Error::custom)
        }
        None => Ok(0),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BLOCK & TRANSACTION
// ═══════════════════════════════════════════════════════════════════════════════

/// A block header (plus optional transaction bodies) as returned by
/// `eth_getBlockByNumber`.
///
/// Only the fields the indexer consumes are decoded; the rest of the
/// payload is ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcBlock {
    /// Block height.
    #[serde(deserialize_with = "u64_from_hex")]
    pub number: u64,
    /// Block hash.
    pub hash: B256,
    /// Hash of the parent block.
    pub parent_hash: B256,
    /// Unix timestamp of the block.
    #[serde(deserialize_with = "u64_from_hex")]
    pub timestamp: u64,
    /// Total gas used by all transactions in the block.
    #[serde(deserialize_with = "u64_from_hex")]
    pub gas_used: u64,
    /// Transaction bodies when `fullTx = true`, otherwise empty.
    ///
    /// With `fullTx = false` the node returns an array of hashes; those
    /// are skipped during decode.
    #[serde(default, deserialize_with = "txs_or_hashes")]
    pub transactions: Vec<RpcTransaction>,
}

/// A transaction body from a full-block response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcTransaction {
    /// Transaction hash.
    pub hash: B256,
    /// Sender address.
    pub from: Address,
    /// Recipient; `None` for contract creation.
    #[serde(default)]
    pub to: Option<Address>,
    /// Value transferred in wei.
    #[serde(deserialize_with = "u256_from_hex")]
    pub value: U256,
    /// Gas limit of the transaction.
    #[serde(default, deserialize_with = "u64_from_hex_opt")]
    pub gas: u64,
    /// Position within the block.
    #[serde(deserialize_with = "u64_from_hex")]
    pub transaction_index: u64,
}

/// `eth_getBlockByNumber(fullTx=false)` returns hash strings in the
/// `transactions` array; decode those to an empty vec instead of failing.
fn txs_or_hashes<'de, D>(deserializer: D) -> Result<Vec<RpcTransaction>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<serde_json::Value> = Vec::deserialize(deserializer)?;
    if raw.iter().all(serde_json::Value::is_string) {
        return Ok(Vec::new());
    }
    raw.into_iter()
        .map(|v| serde_json::from_value(v).map_err(serde::de::Error::custom))
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// LOG FILTER
// ═══════════════════════════════════════════════════════════════════════════════

/// Filter parameters for `eth_getLogs`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFilter {
    /// Start of the block range (inclusive), hex encoded.
    pub from_block: String,
    /// End of the block range (inclusive), hex encoded.
    pub to_block: String,
    /// Optional contract address allow-list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<Vec<Address>>,
    /// Optional topic filter (position 0 only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topics: Option<Vec<B256>>,
}

impl LogFilter {
    /// Build a filter covering `[from, to]`.
    #[must_use]
    pub fn range(from: u64, to: u64) -> Self {
        Self {
            from_block: format!("0x{from:x}"),
            to_block: format!("0x{to:x}"),
            address: None,
            topics: None,
        }
    }

    /// Restrict the filter to the given contract addresses.
    #[must_use]
    pub fn with_addresses(mut self, addresses: Vec<Address>) -> Self {
        self.address = Some(addresses);
        self
    }

    /// Restrict the filter to logs whose topic 0 matches.
    #[must_use]
    pub fn with_topic0(mut self, topic: B256) -> Self {
        self.topics = Some(vec![topic]);
        self
    }
}

/// Parameters for `eth_call`: a call object plus the block tag.
#[derive(Debug, Clone, Serialize)]
pub struct CallRequest {
    /// Target contract.
    pub to: Address,
    /// ABI-encoded calldata.
    pub data: Bytes,
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_envelope() {
        let req = JsonRpcRequest::new("eth_blockNumber", [(); 0], 7);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["method"], "eth_blockNumber");
        assert_eq!(json["id"], 7);
    }

    #[test]
    fn block_decodes_hex_quantities() {
        let json = serde_json::json!({
            "number": "0x1b4",
            "hash": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "parentHash": "0x2222222222222222222222222222222222222222222222222222222222222222",
            "timestamp": "0x6553f100",
            "gasUsed": "0x5208",
            "transactions": []
        });
        let block: RpcBlock = serde_json::from_value(json).unwrap();
        assert_eq!(block.number, 436);
        assert_eq!(block.gas_used, 21_000);
        assert!(block.transactions.is_empty());
    }

    #[test]
    fn block_tolerates_hash_only_transactions() {
        let json = serde_json::json!({
            "number": "0x1",
            "hash": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "parentHash": "0x2222222222222222222222222222222222222222222222222222222222222222",
            "timestamp": "0x0",
            "gasUsed": "0x0",
            "transactions": [
                "0x3333333333333333333333333333333333333333333333333333333333333333"
            ]
        });
        let block: RpcBlock = serde_json::from_value(json).unwrap();
        assert!(block.transactions.is_empty());
    }

    #[test]
    fn full_transaction_decodes() {
        let json = serde_json::json!({
            "number": "0x2",
            "hash": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "parentHash": "0x2222222222222222222222222222222222222222222222222222222222222222",
            "timestamp": "0x10",
            "gasUsed": "0x5208",
            "transactions": [{
                "hash": "0x4444444444444444444444444444444444444444444444444444444444444444",
                "from": "0x1234567890123456789012345678901234567890",
                "to": null,
                "value": "0xde0b6b3a7640000",
                "transactionIndex": "0x0"
            }]
        });
        let block: RpcBlock = serde_json::from_value(json).unwrap();
        assert_eq!(block.transactions.len(), 1);
        let tx = &block.transactions[0];
        assert!(tx.to.is_none());
        assert_eq!(tx.value, U256::from(1_000_000_000_000_000_000_u128));
    }

    #[test]
    fn log_filter_hex_encodes_range() {
        let filter = LogFilter::range(256, 511);
        assert_eq!(filter.from_block, "0x100");
        assert_eq!(filter.to_block, "0x1ff");
    }
}
