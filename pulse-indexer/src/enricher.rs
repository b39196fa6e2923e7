//! Asynchronous token-metadata enrichment.
//!
//! Transfers are persisted immediately with a bare token address; the
//! enricher resolves `symbol()`/`decimals()` in the background and
//! writes the result back to the metadata table. Enqueueing is
//! best-effort: a full queue drops the address and bumps a counter,
//! never blocking the pipeline.
//!
//! # Flow
//!
//! ```text
//! Processor ──enqueue──▶ bounded queue ──▶ batch (≤50 addresses)
//!                                              │
//!                              Multicall3 aggregate3(symbol+decimals)
//!                              (per-token eth_call fallback)
//!                                              │
//!                              sanitize ──▶ cache ──▶ token_metadata
//! ```
//!
//! A moka cache and a dashmap in-flight set keep duplicate addresses
//! from doing duplicate work.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy::primitives::Bytes;
use alloy::sol_types::SolCall;
use dashmap::DashSet;
use evm_pool::ClientPool;
use moka::sync::Cache;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::abi::erc20::{decimalsCall, symbolCall};
use crate::abi::multicall::{Call3, MULTICALL3_ADDRESS, aggregate3Call};
use crate::config::EnricherSettings;
use crate::error::Result;
use crate::ports::IndexerStore;
use crate::types::chain::TokenMetadata;
use crate::types::primitives::EthAddress;

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Symbols longer than this are truncated to the store column width.
const MAX_SYMBOL_LEN: usize = 32;

/// Symbols longer than this are junk; fall back to a generic tag.
const ABSURD_SYMBOL_LEN: usize = 64;

/// Generic tag for tokens with unusable symbols.
const GENERIC_SYMBOL: &str = "TOKEN";

/// How long to wait for more addresses before resolving a partial batch.
const BATCH_LINGER: Duration = Duration::from_millis(50);

/// Cache TTL; metadata is effectively immutable.
const CACHE_TTL: Duration = Duration::from_secs(3600);

/// Cache capacity.
const CACHE_CAPACITY: u64 = 50_000;

// ═══════════════════════════════════════════════════════════════════════════════
// SANITIZATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Clean a raw on-chain symbol for storage.
///
/// Non-printable characters are replaced, whitespace is trimmed, the
/// result is truncated to the column width. Absurdly long or empty
/// symbols fall back to the generic tag.
#[must_use]
pub fn sanitize_symbol(raw: &str) -> String {
    if raw.chars().count() > ABSURD_SYMBOL_LEN {
        return GENERIC_SYMBOL.to_string();
    }
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_control() { '?' } else { c })
        .collect::<String>()
        .trim()
        .chars()
        .take(MAX_SYMBOL_LEN)
        .collect();
    if cleaned.is_empty() {
        GENERIC_SYMBOL.to_string()
    } else {
        cleaned
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HANDLE
// ═══════════════════════════════════════════════════════════════════════════════

/// Cheap, cloneable front door to the enricher.
#[derive(Clone)]
pub struct EnricherHandle {
    tx: mpsc::Sender<EthAddress>,
    cache: Cache<EthAddress, (String, u8)>,
    inflight: Arc<DashSet<EthAddress>>,
    dropped: Arc<AtomicU64>,
}

impl std::fmt::Debug for EnricherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnricherHandle")
            .field("cached", &self.cache.entry_count())
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl EnricherHandle {
    /// Non-blocking, best-effort enqueue.
    ///
    /// Cached and in-flight addresses are skipped; a full queue drops
    /// the address and increments the drop counter.
    pub fn enqueue(&self, address: EthAddress) {
        if address.is_zero()
            || self.cache.contains_key(&address)
            || !self.inflight.insert(address)
        {
            return;
        }
        if self.tx.try_send(address).is_err() {
            self.inflight.remove(&address);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("enricher_dropped_total").increment(1);
        }
    }

    /// Symbol for a token that has already been resolved.
    #[must_use]
    pub fn cached_symbol(&self, address: &EthAddress) -> Option<String> {
        self.cache.get(address).map(|(symbol, _)| symbol)
    }

    /// Addresses dropped on a full queue since startup.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENRICHER
// ═══════════════════════════════════════════════════════════════════════════════

/// Background worker resolving token metadata in batches.
///
/// # Type Parameters
///
/// * `S` - Store receiving the metadata write-back
pub struct MetadataEnricher<S> {
    pool: Arc<ClientPool>,
    store: Arc<S>,
    settings: EnricherSettings,
    rx: mpsc::Receiver<EthAddress>,
    handle: EnricherHandle,
}

impl<S> std::fmt::Debug for MetadataEnricher<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataEnricher")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl<S> MetadataEnricher<S>
where
    S: IndexerStore + 'static,
{
    /// Build the enricher and its handle.
    #[must_use]
    pub fn new(pool: Arc<ClientPool>, store: Arc<S>, settings: EnricherSettings) -> Self {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let handle = EnricherHandle {
            tx,
            cache: Cache::builder()
                .max_capacity(CACHE_CAPACITY)
                .time_to_live(CACHE_TTL)
                .build(),
            inflight: Arc::new(DashSet::new()),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        Self {
            pool,
            store,
            settings,
            rx,
            handle,
        }
    }

    /// The cloneable handle for producers.
    #[must_use]
    pub fn handle(&self) -> EnricherHandle {
        self.handle.clone()
    }

    /// Run until cancellation. Drains queued addresses on shutdown.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            queue = self.settings.queue_capacity,
            batch = self.settings.batch_size,
            "metadata enricher started"
        );
        loop {
            let first = tokio::select! {
                () = cancel.cancelled() => break,
                maybe = self.rx.recv() => maybe,
            };
            let Some(first) = first else { break };

            let mut batch = vec![first];
            while batch.len() < self.settings.batch_size.max(1) {
                match timeout(BATCH_LINGER, self.rx.recv()).await {
                    Ok(Some(address)) => batch.push(address),
                    Ok(None) | Err(_) => break,
                }
            }

            self.resolve_batch(&batch).await;
            for address in &batch {
                self.handle.inflight.remove(address);
            }
        }
        // Close() semantics: whatever is still queued gets one last pass.
        let mut leftover = Vec::new();
        while let Ok(address) = self.rx.try_recv() {
            leftover.push(address);
        }
        if !leftover.is_empty() {
            self.resolve_batch(&leftover).await;
        }
        info!("metadata enricher stopped");
    }

    #[instrument(skip(self, batch), fields(count = batch.len()))]
    async fn resolve_batch(&self, batch: &[EthAddress]) {
        let resolved = if self.settings.use_multicall {
            match self.resolve_via_multicall(batch).await {
                Ok(tokens) => tokens,
                Err(e) => {
                    debug!(error = %e, "multicall failed, falling back to direct calls");
                    self.resolve_direct(batch).await
                }
            }
        } else {
            self.resolve_direct(batch).await
        };

        if resolved.is_empty() {
            return;
        }

        for token in &resolved {
            if let Some(symbol) = &token.symbol {
                self.handle
                    .cache
                    .insert(token.address, (symbol.clone(), token.decimals));
            }
        }

        if let Err(e) = self.store.upsert_token_metadata(&resolved).await {
            warn!(error = %e, "token metadata write-back failed");
        } else {
            debug!(count = resolved.len(), "token metadata written back");
        }
    }

    /// One aggregate call resolving `symbol()` + `decimals()` per token.
    async fn resolve_via_multicall(&self, batch: &[EthAddress]) -> Result<Vec<TokenMetadata>> {
        let calls: Vec<Call3> = batch
            .iter()
            .flat_map(|address| {
                let target = alloy::primitives::Address::from(*address);
                [
                    Call3 {
                        target,
                        allowFailure: true,
                        callData: symbolCall {}.abi_encode().into(),
                    },
                    Call3 {
                        target,
                        allowFailure: true,
                        callData: decimalsCall {}.abi_encode().into(),
                    },
                ]
            })
            .collect();

        let data: Bytes = aggregate3Call { calls }.abi_encode().into();
        let raw = self.pool.call(MULTICALL3_ADDRESS, data).await.map_err(
            crate::error::InfraError::Rpc,
        )?;
        let results = aggregate3Call::abi_decode_returns(&raw)
            .map_err(|e| crate::error::InfraError::Internal(format!("multicall decode: {e}")))?;

        let mut resolved = Vec::with_capacity(batch.len());
        for (i, address) in batch.iter().enumerate() {
            let symbol = results
                .get(i * 2)
                .filter(|r| r.success)
                .and_then(|r| symbolCall::abi_decode_returns(&r.returnData).ok())
                .map(|s| sanitize_symbol(&s));
            let decimals = results
                .get(i * 2 + 1)
                .filter(|r| r.success)
                .and_then(|r| decimalsCall::abi_decode_returns(&r.returnData).ok())
                .unwrap_or(18);

            if symbol.is_some() {
                resolved.push(TokenMetadata {
                    address: *address,
                    symbol,
                    decimals,
                    name: None,
                });
            }
        }
        Ok(resolved)
    }

    /// Fallback: two `eth_call`s per token.
    async fn resolve_direct(&self, batch: &[EthAddress]) -> Vec<TokenMetadata> {
        let mut resolved = Vec::new();
        for address in batch {
            let target = alloy::primitives::Address::from(*address);

            let symbol = match self
                .pool
                .call(target, symbolCall {}.abi_encode().into())
                .await
            {
                Ok(raw) => symbolCall::abi_decode_returns(&raw)
                    .ok()
                    .map(|s| sanitize_symbol(&s)),
                Err(e) => {
                    debug!(token = %address, error = %e, "symbol() call failed");
                    None
                }
            };
            let Some(symbol) = symbol else { continue };

            let decimals = self
                .pool
                .call(target, decimalsCall {}.abi_encode().into())
                .await
                .ok()
                .and_then(|raw| decimalsCall::abi_decode_returns(&raw).ok())
                .unwrap_or(18);

            resolved.push(TokenMetadata {
                address: *address,
                symbol: Some(symbol),
                decimals,
                name: None,
            });
        }
        resolved
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_passes_clean_symbols() {
        assert_eq!(sanitize_symbol("USDC"), "USDC");
        assert_eq!(sanitize_symbol(" WETH "), "WETH");
    }

    #[test]
    fn sanitize_replaces_control_bytes() {
        assert_eq!(sanitize_symbol("US\u{0}DC"), "US?DC");
        assert_eq!(sanitize_symbol("A\tB"), "A?B");
    }

    #[test]
    fn sanitize_truncates_to_column_width() {
        let long = "A".repeat(40);
        assert_eq!(sanitize_symbol(&long).len(), MAX_SYMBOL_LEN);
    }

    #[test]
    fn sanitize_falls_back_on_junk() {
        let absurd = "x".repeat(200);
        assert_eq!(sanitize_symbol(&absurd), GENERIC_SYMBOL);
        assert_eq!(sanitize_symbol(""), GENERIC_SYMBOL);
        assert_eq!(sanitize_symbol("\u{1}\u{2}"), GENERIC_SYMBOL);
    }

    fn test_handle(capacity: usize) -> (EnricherHandle, mpsc::Receiver<EthAddress>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            EnricherHandle {
                tx,
                cache: Cache::builder().max_capacity(100).build(),
                inflight: Arc::new(DashSet::new()),
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    fn addr(byte: u8) -> EthAddress {
        EthAddress::new([byte; 20])
    }

    #[tokio::test]
    async fn enqueue_deduplicates_inflight() {
        let (handle, mut rx) = test_handle(16);
        handle.enqueue(addr(1));
        handle.enqueue(addr(1));
        handle.enqueue(addr(2));

        assert_eq!(rx.recv().await.unwrap(), addr(1));
        assert_eq!(rx.recv().await.unwrap(), addr(2));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn enqueue_skips_zero_and_cached() {
        let (handle, mut rx) = test_handle(16);
        handle.enqueue(EthAddress::ZERO);

        handle.cache.insert(addr(3), ("USDC".into(), 6));
        handle.enqueue(addr(3));
        assert!(rx.try_recv().is_err());

        assert_eq!(handle.cached_symbol(&addr(3)).unwrap(), "USDC");
    }

    #[tokio::test]
    async fn full_queue_drops_with_counter() {
        let (handle, _rx) = test_handle(1);
        handle.enqueue(addr(1));
        handle.enqueue(addr(2));
        assert_eq!(handle.dropped(), 1);
        // The dropped address is no longer marked in-flight, so a later
        // enqueue can retry it.
        assert!(!handle.inflight.contains(&addr(2)));
    }
}
