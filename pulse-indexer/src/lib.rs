//! Pulse Indexer
//!
//! A chain event indexer that ingests blocks and ERC-20-style transfer
//! logs from one or more JSON-RPC endpoints, orders them
//! deterministically, enriches them with token metadata, and persists
//! them to PostgreSQL while fanning out to an in-memory hot buffer and
//! a compressed archive.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          PIPELINE                                │
//! │                                                                  │
//! │  RPC pool ──▶ Fetcher ──▶ Sequencer ──▶ Processor ──▶ Sinks      │
//! │  (evm-pool)   (workers)   (ordering)    (decode +    (postgres,  │
//! │                                          commit)      archive,   │
//! │                                                       hot ring)  │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                        CONTROL PLANE                             │
//! │                                                                  │
//! │  Height Oracle ⇄ Tail-Follow / WSS ⇄ Fetcher.schedule            │
//! │  Watchdog ⇄ {Sequencer, Store, Oracle}                           │
//! │  Lazy Manager ⇄ Fetcher.{pause, resume}                          │
//! │  Rate Limiter wraps every outbound RPC                           │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`types`] - domain types (primitives, chain entities, events)
//! - [`error`] - layered error types
//! - [`config`] - configuration loading and validation
//! - [`abi`] - event signature bindings
//! - [`pipeline`] - fetcher, sequencer, processor, decoder
//! - [`control`] - oracle, lazy manager, watchdog, backpressure
//! - [`enricher`] - asynchronous token-metadata resolution
//! - [`ports`] - storage and sink traits
//! - [`store`] - PostgreSQL adapter
//! - [`sink`] - archive, hot buffer, multi-sink
//! - [`events`] - broadcast event hub
//! - [`runtime`] - supervisor, tail-follow, WSS listener
//!
//! # Getting Started
//!
//! ```bash
//! cp .env.example .env
//! # point PULSE__DATABASE__URL and PULSE__CHAIN__RPC_URLS somewhere real
//!
//! cargo run -- migrate
//! cargo run -- run
//! ```

pub mod abi;
pub mod config;
pub mod control;
pub mod enricher;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod ports;
pub mod runtime;
pub mod sink;
pub mod store;
pub mod types;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the library version string
#[must_use]
pub const fn version() -> &'static str {
    VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
        assert!(version().starts_with("0."));
    }
}
