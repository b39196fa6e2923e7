//! Settings structs and loading logic.
//!
//! All settings have sensible defaults and can be overridden via
//! configuration files or `PULSE__`-prefixed environment variables.
//! Chain ID 31337 (or `lazy.demo_mode`) switches the service into lab
//! mode: faster tail polling, larger DB pool, gap bypass and watchdog
//! interventions enabled.

use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use super::LAB_CHAIN_ID;
use crate::types::BlockNumber;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Chain and RPC endpoints.
    pub chain: ChainSettings,
    /// Fetcher worker pool.
    pub fetcher: FetcherSettings,
    /// Sequencer ordering behavior.
    pub sequencer: SequencerSettings,
    /// Processor batching.
    pub processor: ProcessorSettings,
    /// Metadata enricher.
    pub enricher: EnricherSettings,
    /// Lazy manager (activity-driven pause/resume).
    pub lazy: LazySettings,
    /// Deadlock watchdog.
    pub watchdog: WatchdogSettings,
    /// Database connection.
    pub database: DatabaseSettings,
    /// Archive sink.
    pub archive: ArchiveSettings,
    /// Logging.
    pub logging: LoggingSettings,
    /// Prometheus metrics.
    pub metrics: MetricsSettings,
}

impl Settings {
    /// Load settings from configuration files and environment variables.
    ///
    /// Files are loaded in this order (later overrides earlier):
    /// 1. `config/default.toml`
    /// 2. `config/{environment}.toml` (if exists)
    /// 3. Environment variables with `PULSE__` prefix
    ///
    /// # Errors
    /// Returns `ConfigError` if configuration is invalid or cannot be loaded.
    pub fn load(environment: &str) -> Result<Self, ConfigError> {
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".into());

        let builder = Config::builder()
            // Chain defaults target a local anvil devnet
            .set_default("chain.chain_id", 31337)?
            .set_default("chain.rpc_urls", "http://localhost:8545")?
            .set_default("chain.wss_url", Option::<String>::None)?
            .set_default("chain.start_block", "latest")?
            .set_default("chain.confirmation_depth", 6)?
            .set_default("chain.poll_interval_ms", Option::<u64>::None)?
            .set_default("chain.rpc_rate_limit", 0)?
            .set_default("chain.demo_throughput_rps", Option::<u32>::None)?
            .set_default("fetcher.concurrency", 10)?
            .set_default("fetcher.max_sync_batch", 500)?
            .set_default("fetcher.get_logs_range_cap", 2000)?
            .set_default("fetcher.header_retries", 2)?
            .set_default("sequencer.gap_threshold", 5)?
            .set_default("sequencer.gap_detect_window_ms", 2000)?
            .set_default("sequencer.stall_threshold_secs", 60)?
            .set_default("sequencer.buffer_cap", 10_000)?
            .set_default("sequencer.max_gap_fill_attempts", 3)?
            .set_default("sequencer.bypass_enabled", Option::<bool>::None)?
            .set_default("processor.batch_size", 50)?
            .set_default("processor.watch_addresses", Vec::<String>::new())?
            .set_default("enricher.queue_capacity", 1000)?
            .set_default("enricher.batch_size", 50)?
            .set_default("enricher.use_multicall", true)?
            .set_default("lazy.demo_mode", false)?
            .set_default("lazy.force_always_active", false)?
            .set_default("lazy.idle_timeout_secs", 300)?
            .set_default("watchdog.enabled", true)?
            .set_default("watchdog.stall_threshold_secs", 120)?
            .set_default("watchdog.check_interval_secs", 30)?
            .set_default("database.url", "postgres://localhost/pulse")?
            .set_default("archive.enabled", true)?
            .set_default("archive.path", "data/archive.jsonl.gz")?
            .set_default("archive.queue_capacity", 4096)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .set_default("logging.file_path", Option::<String>::None)?
            .set_default("metrics.enabled", true)?
            .set_default("metrics.host", "0.0.0.0")?
            .set_default("metrics.port", 9090)?
            // Load default configuration file
            .add_source(File::with_name(&format!("{config_dir}/default")).required(false))
            // Load environment-specific file
            .add_source(File::with_name(&format!("{config_dir}/{environment}")).required(false))
            // Override with environment variables (PULSE__ prefix)
            .add_source(
                Environment::with_prefix("PULSE")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Load settings from a specific file path.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()?
            .try_deserialize()
    }

    /// Lab mode: chain 31337 or explicit demo override.
    ///
    /// Lab mode enables aggressive tuning, gap bypass and watchdog
    /// interventions; production mode disables those trade-offs.
    #[must_use]
    pub const fn is_lab_mode(&self) -> bool {
        self.chain.chain_id == LAB_CHAIN_ID || self.lazy.demo_mode
    }

    /// Whether the sequencer may bypass unfillable gaps.
    ///
    /// Explicit config wins; otherwise bypass follows lab mode.
    #[must_use]
    pub fn bypass_enabled(&self) -> bool {
        self.sequencer.bypass_enabled.unwrap_or_else(|| self.is_lab_mode())
    }

    /// Tail-follow cadence: configured value, else 100 ms in lab mode
    /// and 500 ms otherwise.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        match self.chain.poll_interval_ms {
            Some(ms) => Duration::from_millis(ms),
            None if self.is_lab_mode() => Duration::from_millis(100),
            None => Duration::from_millis(500),
        }
    }

    /// Database pool sizing: generous in lab mode, conservative in
    /// production.
    #[must_use]
    pub const fn db_pool_sizes(&self) -> (u32, u32) {
        if self.is_lab_mode() { (100, 20) } else { (25, 10) }
    }

    /// Validate settings and return all violations.
    ///
    /// # Errors
    /// Returns a list of validation error messages.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.chain.chain_id == 0 {
            errors.push("chain.chain_id must be non-zero".into());
        }
        if self.chain.rpc_urls().is_empty() {
            errors.push("chain.rpc_urls cannot be empty".into());
        }
        if self.fetcher.concurrency == 0 {
            errors.push("fetcher.concurrency must be non-zero".into());
        }
        if self.fetcher.get_logs_range_cap == 0 || self.fetcher.get_logs_range_cap > 2000 {
            errors.push("fetcher.get_logs_range_cap must be in 1..=2000".into());
        }
        if self.sequencer.buffer_cap == 0 {
            errors.push("sequencer.buffer_cap must be non-zero".into());
        }
        if self.processor.batch_size == 0 {
            errors.push("processor.batch_size must be non-zero".into());
        }
        if self.database.url.is_empty() {
            errors.push("database.url cannot be empty".into());
        }
        for addr in &self.processor.watch_addresses {
            if crate::types::EthAddress::from_hex(addr).is_err() {
                errors.push(format!("processor.watch_addresses: invalid address {addr}"));
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// START BLOCK
// ═══════════════════════════════════════════════════════════════════════════════

/// Where to begin indexing when there is no checkpoint.
///
/// `"latest"` follows the head; an integer (including `0`) is an
/// explicit height; empty falls back to `latest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartBlock {
    /// Begin at the current chain head.
    Latest,
    /// Begin at an explicit height. Zero is a valid height, not "unset".
    Number(BlockNumber),
}

impl StartBlock {
    /// Parse the configured string form.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("latest") {
            return Self::Latest;
        }
        trimmed
            .parse::<u64>()
            .map_or(Self::Latest, |n| Self::Number(BlockNumber::new(n)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SECTIONS
// ═══════════════════════════════════════════════════════════════════════════════

/// Chain and RPC endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainSettings {
    /// Chain identifier; 31337 enables lab mode.
    pub chain_id: u64,
    /// Comma-separated provider endpoints; first is primary.
    pub rpc_urls: String,
    /// Optional WebSocket endpoint for `newHeads` push.
    pub wss_url: Option<String>,
    /// `"latest"`, an integer (0 allowed), or empty.
    pub start_block: String,
    /// Blocks below head considered reorg-safe.
    pub confirmation_depth: u64,
    /// Tail-follow cadence override in milliseconds.
    pub poll_interval_ms: Option<u64>,
    /// Per-pool rps cap before the endpoint-class clamp (0 = class default).
    pub rpc_rate_limit: u32,
    /// Optional secondary pacing bucket for demo runs (requests/s).
    pub demo_throughput_rps: Option<u32>,
}

impl ChainSettings {
    /// Split and trim the configured endpoint list.
    #[must_use]
    pub fn rpc_urls(&self) -> Vec<String> {
        self.rpc_urls
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect()
    }

    /// Parsed start-block directive.
    #[must_use]
    pub fn start_block(&self) -> StartBlock {
        StartBlock::parse(&self.start_block)
    }
}

/// Fetcher worker pool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FetcherSettings {
    /// Number of fetch workers.
    pub concurrency: usize,
    /// Maximum blocks per scheduled range.
    pub max_sync_batch: u64,
    /// Provider ceiling for a single `eth_getLogs` range.
    pub get_logs_range_cap: u64,
    /// Per-block header retries on transient errors.
    pub header_retries: u32,
}

/// Sequencer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SequencerSettings {
    /// Buffered-ahead distance that counts as a gap.
    pub gap_threshold: u64,
    /// How long a gap must persist before a refill is requested.
    pub gap_detect_window_ms: u64,
    /// Idle time that counts as a stall.
    pub stall_threshold_secs: u64,
    /// Buffer ceiling before escalation.
    pub buffer_cap: usize,
    /// Failed refill attempts before bypass (lab) or alert (production).
    pub max_gap_fill_attempts: u32,
    /// Explicit bypass override; `None` follows lab mode.
    pub bypass_enabled: Option<bool>,
}

impl SequencerSettings {
    /// Gap persistence window as a `Duration`.
    #[must_use]
    pub const fn gap_detect_window(&self) -> Duration {
        Duration::from_millis(self.gap_detect_window_ms)
    }

    /// Stall threshold as a `Duration`.
    #[must_use]
    pub const fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_threshold_secs)
    }
}

/// Processor configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorSettings {
    /// Blocks per atomic commit during bulk sync.
    pub batch_size: usize,
    /// Optional token allow-list; empty means index everything.
    pub watch_addresses: Vec<String>,
}

/// Metadata enricher configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EnricherSettings {
    /// Bounded queue size; overflow drops with a counter.
    pub queue_capacity: usize,
    /// Addresses resolved per aggregate call.
    pub batch_size: usize,
    /// Resolve via Multicall3 when available.
    pub use_multicall: bool,
}

/// Lazy manager configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LazySettings {
    /// Demo mode keeps the pipeline always active and enables lab tuning.
    pub demo_mode: bool,
    /// Explicit always-active override.
    pub force_always_active: bool,
    /// Idle window before the fetcher is paused.
    pub idle_timeout_secs: u64,
}

impl LazySettings {
    /// Idle timeout as a `Duration`.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Deadlock watchdog configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchdogSettings {
    /// Master switch.
    pub enabled: bool,
    /// Sequencer idle time that triggers investigation.
    pub stall_threshold_secs: u64,
    /// Tick interval.
    pub check_interval_secs: u64,
}

impl WatchdogSettings {
    /// Stall threshold as a `Duration`.
    #[must_use]
    pub const fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_threshold_secs)
    }

    /// Check interval as a `Duration`.
    #[must_use]
    pub const fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    /// PostgreSQL connection URL.
    pub url: String,
}

/// Archive sink configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveSettings {
    /// Master switch.
    pub enabled: bool,
    /// Path of the append-only compressed archive file.
    pub path: String,
    /// Bounded queue in front of the background writer.
    pub queue_capacity: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,
    /// Log format (json, pretty).
    pub format: String,
    /// Optional file path for log output.
    pub file_path: Option<String>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsSettings {
    /// Whether the Prometheus exporter is enabled.
    pub enabled: bool,
    /// Host to bind the scrape endpoint to.
    pub host: String,
    /// Port for the scrape endpoint.
    pub port: u16,
}

impl MetricsSettings {
    /// Get the metrics socket address string.
    #[must_use]
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
