//! Single-endpoint JSON-RPC transport.
//!
//! [`EndpointClient`] is a thin wrapper over `reqwest` that speaks
//! JSON-RPC 2.0 to one provider URL. Health tracking, failover and rate
//! limiting live in [`pool`](crate::pool); this type only moves bytes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy::primitives::{Address, Bytes};
use alloy::rpc::types::Log;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{instrument, trace};

use crate::error::{PoolError, Result};
use crate::types::{JsonRpcRequest, JsonRpcResponse, LogFilter, RpcBlock};

// ═══════════════════════════════════════════════════════════════════════════════
// ENDPOINT CLIENT
// ═══════════════════════════════════════════════════════════════════════════════

/// JSON-RPC transport to a single provider endpoint.
///
/// # Thread Safety
///
/// `Send + Sync`; the inner `reqwest::Client` is built for concurrent use.
#[derive(Debug)]
pub struct EndpointClient {
    /// HTTP client for JSON-RPC requests.
    http: reqwest::Client,
    /// Endpoint URL.
    url: String,
    /// Request ID counter for JSON-RPC correlation.
    request_id: AtomicU64,
}

impl EndpointClient {
    /// Create a client for `url` with the given per-call deadline.
    ///
    /// # Errors
    /// Returns [`PoolError::InvalidConfig`] if the HTTP client cannot be
    /// constructed.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PoolError::InvalidConfig(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            url: url.into(),
            request_id: AtomicU64::new(1),
        })
    }

    /// The endpoint URL this client talks to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    fn next_request_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Execute a JSON-RPC call and decode the result.
    ///
    /// # Errors
    /// Classified per [`PoolError`]: HTTP 429 and the throttling JSON-RPC
    /// codes become [`PoolError::RateLimited`], network failures become
    /// [`PoolError::Transient`], undecodable payloads become
    /// [`PoolError::Malformed`].
    pub async fn request<P, R>(&self, method: &str, params: P) -> Result<R>
    where
        P: Serialize + Send + Sync,
        R: DeserializeOwned,
    {
        let request = JsonRpcRequest::new(method, params, self.next_request_id());
        trace!(method, url = %self.url, "sending RPC request");

        let response = self.http.post(&self.url).json(&request).send().await?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(PoolError::RateLimited {
                endpoint: self.url.clone(),
            });
        }
        if !status.is_success() {
            // Gateway errors are worth a retry on another endpoint.
            return Err(PoolError::Transient(format!("HTTP {status}")));
        }

        // Decode the envelope with a raw result so a `null` result can
        // land in `Option<T>` targets instead of reading as "missing".
        let body: JsonRpcResponse<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| PoolError::Malformed(format!("undecodable RPC response: {e}")))?;

        if let Some(error) = body.error {
            return Err(error.into_error(&self.url));
        }

        let result = body.result.unwrap_or(serde_json::Value::Null);
        serde_json::from_value(result)
            .map_err(|e| PoolError::Malformed(format!("unexpected result shape: {e}")))
    }

    // ───────────────────────────────────────────────────────────────────────────
    // TYPED HELPERS
    // ───────────────────────────────────────────────────────────────────────────

    /// `eth_blockNumber`.
    #[instrument(skip(self), fields(url = %self.url))]
    pub async fn block_number(&self) -> Result<u64> {
        let hex: String = self.request("eth_blockNumber", [(); 0]).await?;
        parse_quantity(&hex)
    }

    /// `eth_getBlockByNumber`. Returns `None` when the node has no block
    /// at that height yet.
    #[instrument(skip(self), fields(url = %self.url, number))]
    pub async fn get_block(&self, number: u64, full_tx: bool) -> Result<Option<RpcBlock>> {
        self.request(
            "eth_getBlockByNumber",
            (format!("0x{number:x}"), full_tx),
        )
        .await
    }

    /// `eth_getLogs` for the given filter.
    #[instrument(skip(self, filter), fields(url = %self.url))]
    pub async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<Log>> {
        self.request("eth_getLogs", [filter]).await
    }

    /// `eth_call` against the latest block.
    #[instrument(skip(self, data), fields(url = %self.url, to = %to))]
    pub async fn call(&self, to: Address, data: Bytes) -> Result<Bytes> {
        let call = serde_json::json!({
            "to": to,
            "data": format!("0x{}", hex::encode(&data)),
        });
        let hex: String = self.request("eth_call", (call, "latest")).await?;
        let trimmed = hex.strip_prefix("0x").unwrap_or(&hex);
        let bytes = hex::decode(trimmed)
            .map_err(|e| PoolError::Malformed(format!("invalid call result hex: {e}")))?;
        Ok(Bytes::from(bytes))
    }
}

fn parse_quantity(hex: &str) -> Result<u64> {
    let trimmed = hex.strip_prefix("0x").unwrap_or(hex);
    u64::from_str_radix(trimmed, 16)
        .map_err(|e| PoolError::Malformed(format!("invalid hex quantity {hex:?}: {e}")))
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn parse_quantity_accepts_prefixed_hex() {
        assert_eq!(parse_quantity("0x10").unwrap(), 16);
        assert_eq!(parse_quantity("ff").unwrap(), 255);
        assert!(parse_quantity("0xzz").is_err());
    }

    #[tokio::test]
    async fn block_number_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_partial_json(serde_json::json!({
                "method": "eth_blockNumber"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0", "id": 1, "result": "0x4d2"
            })))
            .mount(&server)
            .await;

        let client = EndpointClient::new(server.uri(), TIMEOUT).unwrap();
        assert_eq!(client.block_number().await.unwrap(), 1234);
    }

    #[tokio::test]
    async fn http_429_maps_to_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let client = EndpointClient::new(server.uri(), TIMEOUT).unwrap();
        let err = client.block_number().await.unwrap_err();
        assert!(err.is_rate_limit());
    }

    #[tokio::test]
    async fn rpc_rate_limit_code_maps_to_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0", "id": 1,
                "error": {"code": -32005, "message": "limit exceeded"}
            })))
            .mount(&server)
            .await;

        let client = EndpointClient::new(server.uri(), TIMEOUT).unwrap();
        let err = client.block_number().await.unwrap_err();
        assert!(err.is_rate_limit());
    }

    #[tokio::test]
    async fn missing_block_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0", "id": 1, "result": null
            })))
            .mount(&server)
            .await;

        let client = EndpointClient::new(server.uri(), TIMEOUT).unwrap();
        let block = client.get_block(99, false).await.unwrap();
        assert!(block.is_none());
    }

    #[tokio::test]
    async fn get_logs_decodes_alloy_logs() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"method": "eth_getLogs"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0", "id": 1,
                "result": [{
                    "address": "0x1234567890123456789012345678901234567890",
                    "topics": [],
                    "data": "0x",
                    "blockNumber": "0x64",
                    "transactionHash": "0x0000000000000000000000000000000000000000000000000000000000000001",
                    "transactionIndex": "0x0",
                    "blockHash": "0x0000000000000000000000000000000000000000000000000000000000000002",
                    "logIndex": "0x0",
                    "removed": false
                }]
            })))
            .mount(&server)
            .await;

        let client = EndpointClient::new(server.uri(), TIMEOUT).unwrap();
        let logs = client.get_logs(&LogFilter::range(100, 100)).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].block_number, Some(100));
    }
}
