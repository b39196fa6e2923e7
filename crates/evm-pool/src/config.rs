//! Pool and endpoint configuration.

use std::time::Duration;

use crate::error::{PoolError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// ENDPOINT CLASS
// ═══════════════════════════════════════════════════════════════════════════════

/// Provider class, inferred from the endpoint hostname.
///
/// The class sets the ceiling for the rate limiter: a local devnet can
/// absorb hundreds of requests per second, a commercial public gateway
/// cannot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointClass {
    /// Local node (localhost, 127.0.0.1, anvil). Ceiling 500 rps.
    Local,
    /// Commercial/public provider. Nominal 15 rps.
    Commercial,
}

impl EndpointClass {
    /// Classify an endpoint URL by hostname.
    #[must_use]
    pub fn classify(url: &str) -> Self {
        let lower = url.to_ascii_lowercase();
        if lower.contains("localhost") || lower.contains("127.0.0.1") || lower.contains("anvil") {
            Self::Local
        } else {
            Self::Commercial
        }
    }

    /// Maximum sustainable request rate for this class.
    #[must_use]
    pub const fn ceiling_rps(self) -> u32 {
        match self {
            Self::Local => 500,
            Self::Commercial => 30,
        }
    }

    /// Nominal request rate before any user cap or catch-up boost.
    #[must_use]
    pub const fn nominal_rps(self) -> u32 {
        match self {
            Self::Local => 500,
            Self::Commercial => 15,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// POOL CONFIG
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for [`ClientPool`](crate::ClientPool).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Per-call deadline.
    pub request_timeout: Duration,
    /// Consecutive failures before an endpoint is marked unhealthy.
    pub failure_threshold: u32,
    /// How long an unhealthy endpoint stays out of rotation.
    pub cooldown: Duration,
    /// Interval between background health probes.
    pub probe_interval: Duration,
    /// Round-robin weight of the first (primary) endpoint.
    pub primary_weight: u32,
    /// Round-robin weight of every backup endpoint.
    pub backup_weight: u32,
    /// User-configured rps cap applied before the class clamp.
    /// `0` means "use the class nominal rate".
    pub user_rps_cap: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            failure_threshold: 3,
            cooldown: Duration::from_secs(300),
            probe_interval: Duration::from_secs(30),
            primary_weight: 3,
            backup_weight: 1,
            user_rps_cap: 0,
        }
    }
}

impl PoolConfig {
    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns [`PoolError::InvalidConfig`] for zero thresholds or weights.
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(PoolError::InvalidConfig(
                "failure_threshold must be non-zero".into(),
            ));
        }
        if self.primary_weight == 0 || self.backup_weight == 0 {
            return Err(PoolError::InvalidConfig(
                "endpoint weights must be non-zero".into(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(PoolError::InvalidConfig(
                "request_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Override the per-call deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Override the user rps cap.
    #[must_use]
    pub const fn with_rps_cap(mut self, cap: u32) -> Self {
        self.user_rps_cap = cap;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_local_endpoints() {
        assert_eq!(
            EndpointClass::classify("http://localhost:8545"),
            EndpointClass::Local
        );
        assert_eq!(
            EndpointClass::classify("http://127.0.0.1:8545"),
            EndpointClass::Local
        );
        assert_eq!(
            EndpointClass::classify("ws://anvil.internal:8545"),
            EndpointClass::Local
        );
    }

    #[test]
    fn classify_commercial_endpoints() {
        assert_eq!(
            EndpointClass::classify("https://mainnet.example-rpc.io/v2/key"),
            EndpointClass::Commercial
        );
    }

    #[test]
    fn class_ceilings_are_ordered() {
        assert!(EndpointClass::Local.ceiling_rps() > EndpointClass::Commercial.ceiling_rps());
        assert!(
            EndpointClass::Commercial.nominal_rps() <= EndpointClass::Commercial.ceiling_rps()
        );
    }

    #[test]
    fn default_config_is_valid() {
        assert!(PoolConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_threshold_rejected() {
        let cfg = PoolConfig {
            failure_threshold: 0,
            ..PoolConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
