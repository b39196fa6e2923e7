//! Error types for the client pool.
//!
//! The taxonomy mirrors how the pool reacts to a failure:
//!
//! - [`PoolError::Transient`] - retried on the next healthy endpoint
//! - [`PoolError::RateLimited`] - the endpoint enters cooldown, the call fails
//! - [`PoolError::Malformed`] - never retried, surfaced to the caller
//! - [`PoolError::NoHealthyEndpoint`] - fatal for the call, the pool is drained

use thiserror::Error;

/// Result type alias using [`PoolError`].
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors that can occur when calling through the client pool.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// Transient failure (network hiccup, 5xx, generic server error).
    ///
    /// The pool retries these on the next healthy endpoint before
    /// surfacing them.
    #[error("transient RPC failure: {0}")]
    Transient(String),

    /// The provider signalled a rate limit (HTTP 429 or the equivalent
    /// JSON-RPC error code).
    ///
    /// The offending endpoint is cooled down; the current call fails.
    #[error("provider rate limited ({endpoint})")]
    RateLimited {
        /// Endpoint URL that returned the rate-limit signal.
        endpoint: String,
    },

    /// The response was syntactically or semantically invalid.
    ///
    /// Not retried: a malformed response from one endpoint is usually
    /// malformed from all of them.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Request exceeded its deadline.
    #[error("request timed out")]
    Timeout,

    /// JSON-RPC error returned by the server.
    #[error("RPC error ({code}): {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// Human-readable message from the server.
        message: String,
    },

    /// Every endpoint in the pool is unhealthy or cooling down.
    #[error("no healthy RPC endpoint available")]
    NoHealthyEndpoint,

    /// Invalid pool or endpoint configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The call was cancelled via the shutdown token.
    #[error("call cancelled")]
    Cancelled,
}

impl PoolError {
    /// Create an RPC error from code and message.
    #[must_use]
    pub fn rpc(code: i64, message: impl Into<String>) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
        }
    }

    /// Whether the failure should be retried on another endpoint.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout)
    }

    /// Whether the failure is a provider-level rate-limit signal.
    ///
    /// Covers both the explicit [`PoolError::RateLimited`] variant and the
    /// JSON-RPC error codes providers use for request throttling.
    #[must_use]
    pub const fn is_rate_limit(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            // -32005 = limit exceeded (EIP-1474), -32029 used by some gateways
            Self::Rpc { code, .. } => *code == -32005 || *code == -32029,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for PoolError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.status().is_some_and(|s| s.as_u16() == 429) {
            Self::RateLimited {
                endpoint: err.url().map(ToString::to_string).unwrap_or_default(),
            }
        } else if err.is_decode() {
            Self::Malformed(err.to_string())
        } else {
            Self::Transient(err.to_string())
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RPC ERROR DETAILS
// ═══════════════════════════════════════════════════════════════════════════════

/// Detailed information from a JSON-RPC error response.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RpcErrorDetail {
    /// JSON-RPC error code.
    pub code: i64,
    /// Human-readable error message.
    pub message: String,
}

impl RpcErrorDetail {
    /// Convert this detail into a [`PoolError`], classifying rate limits.
    #[must_use]
    pub fn into_error(self, endpoint: &str) -> PoolError {
        if self.code == -32005 || self.code == -32029 {
            return PoolError::RateLimited {
                endpoint: endpoint.to_string(),
            };
        }
        // Generic server errors are worth a retry on another endpoint.
        if self.code == -32000 {
            return PoolError::Transient(self.message);
        }
        PoolError::Rpc {
            code: self.code,
            message: self.message,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_is_retryable() {
        assert!(PoolError::Transient("connection reset".into()).is_retryable());
        assert!(PoolError::Timeout.is_retryable());
        assert!(!PoolError::Malformed("bad json".into()).is_retryable());
        assert!(!PoolError::NoHealthyEndpoint.is_retryable());
    }

    #[test]
    fn rate_limit_detection() {
        let explicit = PoolError::RateLimited {
            endpoint: "http://a".into(),
        };
        assert!(explicit.is_rate_limit());

        assert!(PoolError::rpc(-32005, "limit exceeded").is_rate_limit());
        assert!(!PoolError::rpc(-32601, "method not found").is_rate_limit());
    }

    #[test]
    fn detail_classifies_rate_limit() {
        let detail = RpcErrorDetail {
            code: -32005,
            message: "limit exceeded".into(),
        };
        assert!(detail.into_error("http://a").is_rate_limit());
    }

    #[test]
    fn detail_classifies_generic_server_error_as_transient() {
        let detail = RpcErrorDetail {
            code: -32000,
            message: "server busy".into(),
        };
        assert!(matches!(
            detail.into_error("http://a"),
            PoolError::Transient(_)
        ));
    }
}
