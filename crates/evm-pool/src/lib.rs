//! Multi-endpoint JSON-RPC client pool for EVM chains.
//!
//! This crate provides [`ClientPool`], a failover-capable JSON-RPC client
//! that spreads load across several provider endpoints:
//!
//! - **Health scoring**: endpoints are marked unhealthy after consecutive
//!   failures or a provider rate-limit signal, and enter a cooldown window
//! - **Weighted round-robin**: the primary endpoint receives more traffic
//!   than backups (default weights 3 and 1)
//! - **Background probing**: unhealthy endpoints are periodically probed
//!   with a lightweight call and restored when they answer again
//! - **Rate limiting**: every outbound call waits on a shared token bucket
//!   whose target rate adapts to endpoint class and observed sync lag
//!
//! # Example
//!
//! ```ignore
//! use evm_pool::{ClientPool, PoolConfig, SmartLimiter};
//!
//! let pool = ClientPool::from_urls(
//!     &["https://rpc.example.org".into(), "http://localhost:8545".into()],
//!     PoolConfig::default(),
//! )?;
//!
//! let head = pool.latest_block_number().await?;
//! let block = pool.get_block(head, true).await?;
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod limiter;
pub mod pool;
pub mod types;

pub use client::EndpointClient;
pub use config::{EndpointClass, PoolConfig};
pub use error::{PoolError, Result};
pub use limiter::SmartLimiter;
pub use pool::{ClientPool, PoolHealth};
pub use types::{LogFilter, RpcBlock, RpcTransaction};
