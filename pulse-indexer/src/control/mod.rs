//! Self-healing control plane.
//!
//! - [`oracle`] - single source of truth for chain head, cursor and lag
//! - [`lazy`] - activity-driven run/pause decisions
//! - [`watchdog`] - stall detection and three-step realignment
//! - [`backpressure`] - memory-aware channel sizing and refusal

pub mod backpressure;
pub mod lazy;
pub mod oracle;
pub mod watchdog;

pub use backpressure::BackpressureGauge;
pub use lazy::LazyManager;
pub use oracle::HeightOracle;
pub use watchdog::{DeadlockWatchdog, WatchdogVerdict};
