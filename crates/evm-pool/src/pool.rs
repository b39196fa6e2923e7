//! Multi-endpoint client pool with health scoring and failover.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         ClientPool                               │
//! │                                                                  │
//! │   wait on SmartLimiter ──▶ pick healthy endpoint (weighted RR)   │
//! │                                 │                                │
//! │                 ┌───────────────┼────────────────┐               │
//! │                 ▼               ▼                ▼               │
//! │           ┌──────────┐    ┌──────────┐     ┌──────────┐          │
//! │           │ primary  │    │ backup 1 │     │ backup 2 │          │
//! │           │ weight 3 │    │ weight 1 │     │ weight 1 │          │
//! │           └──────────┘    └──────────┘     └──────────┘          │
//! │                 │                                                │
//! │      3 failures or 429 ──▶ unhealthy + 5 min cooldown            │
//! │      probe every 30 s  ──▶ restore                               │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Transient failures are retried on the next healthy endpoint; a
//! rate-limit signal cools the endpoint down and fails the current call;
//! malformed responses surface immediately.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use alloy::primitives::{Address, Bytes};
use alloy::rpc::types::Log;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::client::EndpointClient;
use crate::config::{EndpointClass, PoolConfig};
use crate::error::{PoolError, Result};
use crate::limiter::SmartLimiter;
use crate::types::{LogFilter, RpcBlock};

// ═══════════════════════════════════════════════════════════════════════════════
// ENDPOINT STATE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy)]
struct EndpointState {
    healthy: bool,
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
}

impl Default for EndpointState {
    fn default() -> Self {
        Self {
            healthy: true,
            consecutive_failures: 0,
            cooldown_until: None,
        }
    }
}

struct Endpoint {
    client: EndpointClient,
    weight: u32,
    state: RwLock<EndpointState>,
}

impl Endpoint {
    // Cooldown expiry alone does not put the endpoint back in rotation;
    // only the probe task restores it with a real call.
    fn cooldown_expired(&self, now: Instant) -> bool {
        let state = self.state.read();
        !state.healthy && state.cooldown_until.is_none_or(|until| now >= until)
    }
}

/// Aggregate pool health, for the service health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolHealth {
    /// Number of endpoints currently in rotation.
    pub healthy: usize,
    /// Total configured endpoints.
    pub total: usize,
}

impl PoolHealth {
    /// All endpoints healthy.
    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.healthy == self.total
    }

    /// Some but not all endpoints healthy.
    #[must_use]
    pub const fn is_degraded(&self) -> bool {
        self.healthy > 0 && self.healthy < self.total
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CLIENT POOL
// ═══════════════════════════════════════════════════════════════════════════════

/// Failover-capable JSON-RPC client over N provider endpoints.
///
/// All operations wait on the shared [`SmartLimiter`] before hitting the
/// wire, pick a healthy endpoint by weighted round-robin, and fail over
/// transparently on transient errors.
pub struct ClientPool {
    endpoints: Vec<Arc<Endpoint>>,
    /// Flattened weighted rotation: endpoint index repeated `weight` times.
    rotation: Vec<usize>,
    cursor: AtomicUsize,
    limiter: Arc<SmartLimiter>,
    config: PoolConfig,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ClientPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPool")
            .field("endpoints", &self.endpoints.len())
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

impl ClientPool {
    /// Build a pool from provider URLs.
    ///
    /// The first URL is the primary (weight from
    /// [`PoolConfig::primary_weight`]); the rest are backups. The rate
    /// limiter class is inferred from the primary URL.
    ///
    /// # Errors
    /// Returns [`PoolError::InvalidConfig`] if no URLs are given or the
    /// configuration is invalid.
    pub fn from_urls(
        urls: &[String],
        config: PoolConfig,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let Some(primary) = urls.first() else {
            return Err(PoolError::InvalidConfig("at least one RPC URL required".into()));
        };

        let class = EndpointClass::classify(primary);
        let limiter = Arc::new(SmartLimiter::new(class, config.user_rps_cap));

        let endpoints: Vec<Arc<Endpoint>> = urls
            .iter()
            .enumerate()
            .map(|(i, url)| {
                let weight = if i == 0 {
                    config.primary_weight
                } else {
                    config.backup_weight
                };
                Ok(Arc::new(Endpoint {
                    client: EndpointClient::new(url.clone(), config.request_timeout)?,
                    weight,
                    state: RwLock::new(EndpointState::default()),
                }))
            })
            .collect::<Result<_>>()?;

        let rotation = endpoints
            .iter()
            .enumerate()
            .flat_map(|(i, ep)| std::iter::repeat_n(i, ep.weight as usize))
            .collect();

        let pool = Arc::new(Self {
            endpoints,
            rotation,
            cursor: AtomicUsize::new(0),
            limiter,
            config,
            cancel,
        });

        Self::spawn_probe_task(Arc::clone(&pool));
        Ok(pool)
    }

    /// The shared rate limiter (for lag retuning by the control plane).
    #[must_use]
    pub fn limiter(&self) -> &Arc<SmartLimiter> {
        &self.limiter
    }

    /// Hot-swap the rate limiter bucket.
    pub fn set_rate_limit(&self, rps: u32) {
        self.limiter.set_rate(rps);
    }

    /// Aggregate health snapshot.
    #[must_use]
    pub fn health(&self) -> PoolHealth {
        let healthy = self
            .endpoints
            .iter()
            .filter(|ep| ep.state.read().healthy)
            .count();
        PoolHealth {
            healthy,
            total: self.endpoints.len(),
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // OPERATIONS
    // ───────────────────────────────────────────────────────────────────────────

    /// `eth_blockNumber` with failover.
    ///
    /// # Errors
    /// See [`Self::with_failover`].
    pub async fn latest_block_number(&self) -> Result<u64> {
        self.with_failover(|ep| async move { ep.client.block_number().await })
            .await
    }

    /// `eth_getBlockByNumber` with failover. `None` when the height does
    /// not exist yet.
    ///
    /// # Errors
    /// See [`Self::with_failover`].
    pub async fn get_block(&self, number: u64, full_tx: bool) -> Result<Option<RpcBlock>> {
        self.with_failover(move |ep| async move { ep.client.get_block(number, full_tx).await })
            .await
    }

    /// `eth_getLogs` with failover.
    ///
    /// # Errors
    /// See [`Self::with_failover`].
    pub async fn get_logs(&self, filter: LogFilter) -> Result<Vec<Log>> {
        self.with_failover(move |ep| {
            let filter = filter.clone();
            async move { ep.client.get_logs(&filter).await }
        })
        .await
    }

    /// `eth_call` with failover.
    ///
    /// # Errors
    /// See [`Self::with_failover`].
    pub async fn call(&self, to: Address, data: Bytes) -> Result<Bytes> {
        self.with_failover(move |ep| {
            let data = data.clone();
            async move { ep.client.call(to, data).await }
        })
        .await
    }

    // ───────────────────────────────────────────────────────────────────────────
    // FAILOVER CORE
    // ───────────────────────────────────────────────────────────────────────────

    /// Run an operation against the pool with health-aware failover.
    ///
    /// Waits on the rate limiter, picks a healthy endpoint by weighted
    /// round-robin and executes the operation. Transient failures rotate
    /// to the next endpoint (at most once per configured endpoint); a
    /// rate-limit signal cools the endpoint down and fails the call;
    /// malformed responses surface immediately.
    ///
    /// # Errors
    /// [`PoolError::NoHealthyEndpoint`] when every endpoint is out of
    /// rotation, otherwise the last classified failure.
    async fn with_failover<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: Fn(Arc<Endpoint>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_err = PoolError::NoHealthyEndpoint;

        for attempt in 0..self.endpoints.len() {
            self.limiter.wait(&self.cancel).await?;

            let Some(endpoint) = self.pick_endpoint() else {
                return Err(PoolError::NoHealthyEndpoint);
            };

            match op(Arc::clone(&endpoint)).await {
                Ok(value) => {
                    self.mark_ok(&endpoint);
                    return Ok(value);
                }
                Err(err) if err.is_rate_limit() => {
                    warn!(endpoint = endpoint.client.url(), "provider rate limit, cooling down");
                    self.cooldown(&endpoint);
                    return Err(err);
                }
                Err(err) if err.is_retryable() => {
                    debug!(
                        endpoint = endpoint.client.url(),
                        attempt,
                        error = %err,
                        "transient failure, trying next endpoint"
                    );
                    self.mark_error(&endpoint);
                    last_err = err;
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_err)
    }

    /// Pick the next healthy endpoint in weighted round-robin order.
    fn pick_endpoint(&self) -> Option<Arc<Endpoint>> {
        let len = self.rotation.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);

        (0..len)
            .map(|i| self.rotation[(start + i) % len])
            .map(|idx| &self.endpoints[idx])
            .find(|ep| ep.state.read().healthy)
            .map(Arc::clone)
    }

    fn mark_ok(&self, endpoint: &Endpoint) {
        let mut state = endpoint.state.write();
        state.consecutive_failures = 0;
    }

    fn mark_error(&self, endpoint: &Endpoint) {
        let threshold = self.config.failure_threshold;
        let mut state = endpoint.state.write();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= threshold && state.healthy {
            state.healthy = false;
            state.cooldown_until = Some(Instant::now() + self.config.cooldown);
            state.consecutive_failures = 0;
            warn!(
                endpoint = endpoint.client.url(),
                cooldown_secs = self.config.cooldown.as_secs(),
                "endpoint marked unhealthy"
            );
        }
    }

    fn cooldown(&self, endpoint: &Endpoint) {
        let mut state = endpoint.state.write();
        state.healthy = false;
        state.consecutive_failures = 0;
        state.cooldown_until = Some(Instant::now() + self.config.cooldown);
    }

    // ───────────────────────────────────────────────────────────────────────────
    // BACKGROUND PROBE
    // ───────────────────────────────────────────────────────────────────────────

    /// Probe unhealthy endpoints whose cooldown has expired and restore
    /// the ones that answer.
    fn spawn_probe_task(pool: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.probe_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = pool.cancel.cancelled() => return,
                    _ = ticker.tick() => pool.probe_tick().await,
                }
            }
        });
    }

    #[instrument(skip(self))]
    async fn probe_tick(&self) {
        let now = Instant::now();
        for endpoint in &self.endpoints {
            if !endpoint.cooldown_expired(now) {
                continue;
            }
            match endpoint.client.block_number().await {
                Ok(head) => {
                    let mut state = endpoint.state.write();
                    state.healthy = true;
                    state.cooldown_until = None;
                    state.consecutive_failures = 0;
                    info!(endpoint = endpoint.client.url(), head, "endpoint restored");
                }
                Err(err) => {
                    // Stays out of rotation; probed again next tick.
                    debug!(
                        endpoint = endpoint.client.url(),
                        error = %err,
                        "probe failed, endpoint stays out of rotation"
                    );
                }
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> PoolConfig {
        PoolConfig {
            request_timeout: Duration::from_secs(2),
            probe_interval: Duration::from_millis(50),
            cooldown: Duration::from_millis(100),
            ..PoolConfig::default()
        }
    }

    fn head_response(head: u64) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "jsonrpc": "2.0", "id": 1, "result": format!("0x{head:x}")
        }))
    }

    async fn healthy_server(head: u64) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(head_response(head))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn single_endpoint_round_trip() {
        let server = healthy_server(100).await;
        let pool = ClientPool::from_urls(
            &[server.uri()],
            test_config(),
            CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(pool.latest_block_number().await.unwrap(), 100);
        assert!(pool.health().is_full());
    }

    #[tokio::test]
    async fn empty_urls_rejected() {
        let result = ClientPool::from_urls(&[], test_config(), CancellationToken::new());
        assert!(matches!(result, Err(PoolError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn fails_over_to_backup_on_transient_error() {
        let broken = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&broken)
            .await;
        let backup = healthy_server(77).await;

        let pool = ClientPool::from_urls(
            &[broken.uri(), backup.uri()],
            test_config(),
            CancellationToken::new(),
        )
        .unwrap();

        // Every call lands somewhere healthy eventually.
        for _ in 0..4 {
            assert_eq!(pool.latest_block_number().await.unwrap(), 77);
        }
    }

    #[tokio::test]
    async fn rate_limit_cools_endpoint_and_degrades_health() {
        let limited = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&limited)
            .await;
        let backup = healthy_server(55).await;

        let pool = ClientPool::from_urls(
            &[limited.uri(), backup.uri()],
            test_config(),
            CancellationToken::new(),
        )
        .unwrap();

        // First call may hit the limited primary and fail fast.
        let mut saw_rate_limit = false;
        for _ in 0..3 {
            match pool.latest_block_number().await {
                Err(e) if e.is_rate_limit() => saw_rate_limit = true,
                Ok(head) => assert_eq!(head, 55),
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(saw_rate_limit, "primary should have signalled a rate limit");
        assert!(pool.health().is_degraded(), "1/2 healthy expected");

        // Subsequent calls route around the cooled endpoint.
        assert_eq!(pool.latest_block_number().await.unwrap(), 55);
    }

    #[tokio::test]
    async fn consecutive_failures_trip_the_breaker() {
        let flaky = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&flaky)
            .await;

        let pool = ClientPool::from_urls(
            &[flaky.uri()],
            test_config(),
            CancellationToken::new(),
        )
        .unwrap();

        // Three transient failures mark the only endpoint unhealthy.
        for _ in 0..3 {
            let _ = pool.latest_block_number().await;
        }
        assert_eq!(pool.health().healthy, 0);

        let err = pool.latest_block_number().await.unwrap_err();
        assert!(matches!(err, PoolError::NoHealthyEndpoint));
    }

    #[tokio::test]
    async fn probe_restores_recovered_endpoint() {
        let server = MockServer::start().await;
        // Fail first, then recover.
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(3)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(head_response(42))
            .mount(&server)
            .await;

        let pool = ClientPool::from_urls(
            &[server.uri()],
            test_config(),
            CancellationToken::new(),
        )
        .unwrap();

        for _ in 0..3 {
            let _ = pool.latest_block_number().await;
        }
        assert_eq!(pool.health().healthy, 0);

        // Wait for cooldown expiry plus a probe tick.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(pool.health().healthy, 1);
        assert_eq!(pool.latest_block_number().await.unwrap(), 42);
    }
}
