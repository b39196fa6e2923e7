//! Pulse Indexer CLI
//!
//! Entry point for the indexer binary. Subcommands:
//! - `run` - start the full pipeline
//! - `migrate` - apply database migrations
//! - `backfill` - index an explicit historical range
//! - `version` - print the version
//!
//! Exit codes: 0 clean, 1 fatal init failure, 2 unrecoverable
//! supervisor panic, 130 interrupted.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use evm_pool::{ClientPool, PoolConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pulse_indexer::config::{Settings, StartBlock};
use pulse_indexer::control::{BackpressureGauge, DeadlockWatchdog, HeightOracle, LazyManager};
use pulse_indexer::enricher::MetadataEnricher;
use pulse_indexer::error::{AppError, Result};
use pulse_indexer::events::EventHub;
use pulse_indexer::pipeline::{Fetcher, Processor, Sequencer, SequencerConfig};
use pulse_indexer::ports::{IndexerStore, TransferSink};
use pulse_indexer::runtime::{TailFollow, WssListener, run_supervised};
use pulse_indexer::sink::{ArchiveSink, HotBuffer, MultiSink};
use pulse_indexer::store::PostgresStore;
use pulse_indexer::types::{BlockNumber, EthAddress};

// ═══════════════════════════════════════════════════════════════════════════════
// CLI
// ═══════════════════════════════════════════════════════════════════════════════

/// Pulse chain event indexer
#[derive(Parser, Debug)]
#[command(name = "pulse-indexer")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Environment name (selects config/{env}.toml)
    #[arg(short, long, default_value = "development")]
    environment: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the indexer
    Run {
        /// Start from a specific block, overriding checkpoint and config
        #[arg(long)]
        from_block: Option<u64>,
    },

    /// Apply database migrations
    Migrate,

    /// Backfill an explicit historical range
    Backfill {
        /// Starting block number (inclusive)
        #[arg(long)]
        from: u64,

        /// Ending block number (inclusive)
        #[arg(long)]
        to: u64,
    },

    /// Show version information
    Version,
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENTRY POINT
// ═══════════════════════════════════════════════════════════════════════════════

fn main() {
    let cli = Cli::parse();
    // .env is optional; ignore a missing file.
    let _ = dotenvy::dotenv();

    if matches!(cli.command, Commands::Version) {
        println!("pulse-indexer {}", pulse_indexer::VERSION);
        std::process::exit(0);
    }

    let settings = match Settings::load(&cli.environment) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    if let Err(violations) = settings.validate() {
        for violation in &violations {
            eprintln!("configuration error: {violation}");
        }
        std::process::exit(1);
    }

    init_tracing(&settings);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(async {
        match cli.command {
            Commands::Run { from_block } => run_indexer(settings, from_block, None).await,
            Commands::Backfill { from, to } => {
                run_indexer(settings, Some(from), Some(to)).await
            }
            Commands::Migrate => migrate(settings).await,
            Commands::Version => unreachable!("handled above"),
        }
    });

    std::process::exit(code);
}

fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.logging.level.clone()));

    if let Some(path) = &settings.logging.file_path {
        let appender = tracing_appender::rolling::daily(path, "pulse-indexer.log");
        if settings.logging.format == "json" {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(appender)
                .init();
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(appender)
                .with_ansi(false)
                .init();
        }
    } else if settings.logging.format == "json" {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn init_metrics(settings: &Settings) {
    if !settings.metrics.enabled {
        return;
    }
    let addr: std::net::SocketAddr = match settings.metrics.socket_addr().parse() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(error = %e, "invalid metrics address, exporter disabled");
            return;
        }
    };
    if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        warn!(error = %e, "failed to install Prometheus exporter");
    } else {
        info!(%addr, "Prometheus exporter listening");
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SUBCOMMANDS
// ═══════════════════════════════════════════════════════════════════════════════

async fn migrate(settings: Settings) -> i32 {
    match PostgresStore::connect(&settings).await {
        Ok(store) => match store.run_migrations().await {
            Ok(()) => {
                info!("migrations applied");
                0
            }
            Err(e) => {
                error!(error = %e, "migration failed");
                1
            }
        },
        Err(e) => {
            error!(error = %e, "database connection failed");
            1
        }
    }
}

/// Assemble and run the pipeline. `until` bounds a backfill run.
#[allow(clippy::too_many_lines)]
async fn run_indexer(settings: Settings, from_block: Option<u64>, until: Option<u64>) -> i32 {
    // The exporter spawns its listener on the runtime, so install here.
    init_metrics(&settings);
    info!(
        version = pulse_indexer::VERSION,
        chain_id = settings.chain.chain_id,
        lab_mode = settings.is_lab_mode(),
        "starting pulse-indexer"
    );

    match build_and_run(settings, from_block, until).await {
        Ok(()) => {
            info!("clean shutdown");
            0
        }
        Err(AppError::ShutdownRequested) => 130,
        Err(AppError::Initialization(msg)) => {
            error!(error = %msg, "initialization failed");
            1
        }
        Err(e) => {
            error!(error = %e, "unrecoverable failure");
            2
        }
    }
}

#[allow(clippy::too_many_lines)]
async fn build_and_run(
    settings: Settings,
    from_block: Option<u64>,
    until: Option<u64>,
) -> Result<()> {
    let cancel = CancellationToken::new();

    // ── Infrastructure ─────────────────────────────────────────────────────────
    let pool = ClientPool::from_urls(
        &settings.chain.rpc_urls(),
        PoolConfig::default().with_rps_cap(settings.chain.rpc_rate_limit),
        cancel.clone(),
    )
    .map_err(|e| AppError::Initialization(format!("RPC pool: {e}")))?;
    // Demo pacing composes with the main bucket by a second wait.
    pool.limiter()
        .set_throughput_pacing(settings.chain.demo_throughput_rps);

    let store = Arc::new(
        PostgresStore::connect(&settings)
            .await
            .map_err(|e| AppError::Initialization(format!("database: {e}")))?,
    );
    store
        .run_migrations()
        .await
        .map_err(|e| AppError::Initialization(format!("migrations: {e}")))?;

    let oracle = Arc::new(HeightOracle::new());
    let hub = EventHub::new();
    let gauge = Arc::new(BackpressureGauge::from_system());

    // ── Sinks ──────────────────────────────────────────────────────────────────
    let hot_buffer = Arc::new(HotBuffer::new());
    let mut sinks: Vec<Arc<dyn TransferSink>> = vec![Arc::clone(&hot_buffer) as _];
    if settings.archive.enabled {
        let archive = ArchiveSink::open(&settings.archive.path, settings.archive.queue_capacity)
            .map_err(|e| AppError::Initialization(format!("archive: {e}")))?;
        sinks.push(Arc::new(archive));
    }
    let multi_sink = Arc::new(MultiSink::new(sinks));

    // ── Enricher ───────────────────────────────────────────────────────────────
    let enricher = MetadataEnricher::new(
        Arc::clone(&pool),
        Arc::clone(&store),
        settings.enricher.clone(),
    );
    let enricher_handle = enricher.handle();
    tokio::spawn(enricher.run(cancel.clone()));

    // ── Pipeline ───────────────────────────────────────────────────────────────
    let (fetcher, results_rx) = Fetcher::new(
        Arc::clone(&pool),
        Arc::clone(&gauge),
        settings.fetcher.clone(),
        cancel.clone(),
    );
    fetcher.spawn_workers();
    let fetcher_handle = fetcher.handle();

    let watch_addresses: Vec<EthAddress> = settings
        .processor
        .watch_addresses
        .iter()
        .filter_map(|s| EthAddress::from_hex(s).ok())
        .collect();

    let processor = Arc::new(Processor::new(
        Arc::clone(&store),
        Arc::clone(&multi_sink),
        Some(enricher_handle),
        hub.clone(),
        Arc::clone(&oracle),
        settings.chain.chain_id,
        watch_addresses,
    ));

    let start = resolve_start_block(&settings, &*store, &pool, from_block).await?;
    info!(start = %start, "resolved start block");

    let sequencer = Arc::new(Sequencer::new(
        start,
        SequencerConfig {
            settings: settings.sequencer.clone(),
            bypass_enabled: settings.bypass_enabled(),
            lab_mode: settings.is_lab_mode(),
            batch_size: settings.processor.batch_size,
        },
        processor,
        Arc::clone(&store),
        fetcher_handle.clone(),
        Arc::clone(&gauge),
        Arc::clone(&oracle),
        hub.clone(),
        settings.chain.chain_id,
    ));
    let sequencer_handle = sequencer.handle();

    // ── Control plane ──────────────────────────────────────────────────────────
    let lazy = Arc::new(LazyManager::new(settings.chain.chain_id, &settings.lazy));
    tokio::spawn(Arc::clone(&lazy).run(
        fetcher_handle.clone(),
        hub.clone(),
        cancel.clone(),
    ));
    // Freshly processed blocks count as activity (API/WS traffic and
    // heartbeats come in through the external surfaces).
    {
        let lazy = Arc::clone(&lazy);
        let mut events = hub.subscribe();
        let child = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = child.cancelled() => return,
                    event = events.recv() => match event {
                        Ok(pulse_indexer::types::IndexerEvent::Block(_)) => lazy.touch(),
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    },
                }
            }
        });
    }

    let watchdog = DeadlockWatchdog::new(
        Arc::clone(&store),
        sequencer_handle.clone(),
        Arc::clone(&oracle),
        hub.clone(),
        settings.watchdog.clone(),
        settings.chain.chain_id,
        settings.is_lab_mode(),
    );
    let watchdog_cancel = cancel.clone();
    tokio::spawn(async move { watchdog.run(watchdog_cancel).await });

    // ── Supervised long-lived tasks ────────────────────────────────────────────
    let results_rx = Arc::new(tokio::sync::Mutex::new(results_rx));
    {
        let sequencer = Arc::clone(&sequencer);
        let results_rx = Arc::clone(&results_rx);
        let child = cancel.clone();
        let hub = hub.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            run_supervised("sequencer", cancel, hub, move || {
                let sequencer = Arc::clone(&sequencer);
                let results_rx = Arc::clone(&results_rx);
                let child = child.clone();
                async move {
                    let mut rx = results_rx.lock().await;
                    sequencer.run(&mut rx, child).await
                }
            })
            .await;
        });
    }

    let tail = TailFollow::new(
        Arc::clone(&pool),
        Arc::clone(&oracle),
        fetcher_handle.clone(),
        Arc::clone(&lazy),
        settings.chain.confirmation_depth,
        settings.poll_interval(),
    );
    {
        let tail = Arc::new(tail);
        let child = cancel.clone();
        let hub = hub.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            run_supervised("tail-follow", cancel, hub, move || {
                let tail = Arc::clone(&tail);
                let child = child.clone();
                async move { tail.run(child).await }
            })
            .await;
        });
    }

    if let Some(ws_url) = settings.chain.wss_url.clone().filter(|u| !u.is_empty()) {
        let listener = WssListener::new(
            ws_url,
            Arc::clone(&oracle),
            fetcher_handle.clone(),
            settings.chain.confirmation_depth,
        );
        let child = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = listener.run(child).await {
                warn!(error = %e, "WSS listener stopped");
            }
        });
    }

    // Backfill runs: schedule the explicit range up front.
    if let Some(to) = until {
        let from = from_block.unwrap_or(0);
        info!(from, to, "scheduling backfill range");
        schedule_with_backoff(&fetcher_handle, BlockNumber::new(from), BlockNumber::new(to))
            .await;
    }

    // ── Wait for interrupt ─────────────────────────────────────────────────────
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| AppError::Initialization(format!("signal handler: {e}")))?;
    info!("interrupt received, shutting down");
    cancel.cancel();

    // Give the sequencer its drain window, then flush the sinks.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    multi_sink.close_all().await;

    Err(AppError::ShutdownRequested)
}

/// Determine where to begin: CLI override, checkpoint, then config.
async fn resolve_start_block(
    settings: &Settings,
    store: &dyn IndexerStore,
    pool: &ClientPool,
    from_block: Option<u64>,
) -> Result<BlockNumber> {
    if let Some(n) = from_block {
        return Ok(BlockNumber::new(n));
    }

    if let Some(checkpoint) = store.checkpoint(settings.chain.chain_id).await? {
        info!(checkpoint = %checkpoint.last_synced_block, "resuming from checkpoint");
        return Ok(checkpoint.last_synced_block.next());
    }

    match settings.chain.start_block() {
        StartBlock::Number(n) => Ok(n),
        StartBlock::Latest => {
            let head = pool
                .latest_block_number()
                .await
                .map_err(|e| AppError::Initialization(format!("head probe: {e}")))?;
            Ok(BlockNumber::new(
                head.saturating_sub(settings.chain.confirmation_depth),
            ))
        }
    }
}

/// Schedule a range, honoring backpressure with the advisory backoff.
async fn schedule_with_backoff(fetcher: &pulse_indexer::pipeline::FetcherHandle, from: BlockNumber, to: BlockNumber) {
    let mut next = from;
    while next <= to {
        match fetcher.schedule(next, to) {
            Ok(()) => return,
            Err(AppError::BackpressureBlocked { retry_after_ms }) => {
                tokio::time::sleep(std::time::Duration::from_millis(retry_after_ms)).await;
                next = fetcher.last_scheduled().next().max(next);
            }
            Err(e) => {
                warn!(error = %e, "backfill scheduling failed");
                return;
            }
        }
    }
}
