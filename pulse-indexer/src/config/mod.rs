//! Configuration loading and validation.

mod settings;

pub use settings::{
    ArchiveSettings, ChainSettings, DatabaseSettings, EnricherSettings, FetcherSettings,
    LazySettings, LoggingSettings, MetricsSettings, ProcessorSettings, SequencerSettings, Settings,
    StartBlock, WatchdogSettings,
};

/// Chain ID that always enables lab mode (local devnet).
pub const LAB_CHAIN_ID: u64 = 31337;
