//! Error types
//!
//! Two layers of errors exist in the cache:
//!
//! - [`TierError`]: a single storage tier could not serve a read or write.
//!   These never reach callers of [`LayeredCache`](crate::LayeredCache); they are
//!   logged, counted per tier, and surfaced through
//!   [`WriteReport`](crate::WriteReport) so tests and operators can see them.
//! - [`CacheError`]: errors returned by the consumer-facing
//!   [`CachingDecorator`](crate::CachingDecorator) and by configuration.

use std::time::Duration;
use thiserror::Error;

/// Failure of an individual cache tier
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TierError {
    /// Tier could not be read or written (I/O error, connection refused, ...)
    #[error("tier '{tier}' unavailable: {reason}")]
    Unavailable { tier: &'static str, reason: String },

    /// Tier did not answer within the configured I/O timeout
    #[error("tier '{tier}' timed out after {after:?}")]
    Timeout { tier: &'static str, after: Duration },
}

impl TierError {
    pub(crate) fn unavailable(tier: &'static str, reason: impl ToString) -> Self {
        Self::Unavailable {
            tier,
            reason: reason.to_string(),
        }
    }

    /// Name of the tier that produced this error
    #[must_use]
    pub fn tier(&self) -> &'static str {
        match self {
            Self::Unavailable { tier, .. } | Self::Timeout { tier, .. } => tier,
        }
    }
}

/// Errors surfaced to callers of the caching layer
#[derive(Error, Debug)]
pub enum CacheError {
    /// The circuit breaker refused to let the upstream call through
    #[error("upstream temporarily unavailable (circuit open)")]
    CircuitOpen,

    /// The wrapped operation failed
    #[error("upstream call failed: {0}")]
    Upstream(#[source] anyhow::Error),

    /// The wrapped operation did not finish in time
    #[error("upstream call timed out after {0:?}")]
    UpstreamTimeout(Duration),

    /// A computed value could not be converted for storage
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// `MaintenanceScheduler::start` was called twice
    #[error("maintenance scheduler is already running")]
    MaintenanceAlreadyRunning,
}

impl CacheError {
    /// Whether retrying the same request later may succeed
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::CircuitOpen | Self::UpstreamTimeout(_))
    }

    /// Message safe to show to end users
    ///
    /// Diagnostic detail stays in logs; users only learn whether trying again
    /// makes sense.
    #[must_use]
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::CircuitOpen | Self::UpstreamTimeout(_) => {
                "The recommendation service is temporarily unavailable. Please try again later."
            }
            _ => "Something went wrong while generating recommendations. Please try again later.",
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result alias for cache operations
pub type CacheResult<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(CacheError::CircuitOpen.is_retriable());
        assert!(CacheError::UpstreamTimeout(Duration::from_secs(1)).is_retriable());
        assert!(!CacheError::Upstream(anyhow::anyhow!("boom")).is_retriable());
        assert!(!CacheError::Config("bad".into()).is_retriable());
    }

    #[test]
    fn test_user_message_hides_details() {
        let err = CacheError::Upstream(anyhow::anyhow!("api key sk-123 rejected"));
        assert!(!err.user_message().contains("sk-123"));
        assert!(err.user_message().contains("try again later"));
    }

    #[test]
    fn test_tier_name() {
        let err = TierError::unavailable("disk", "permission denied");
        assert_eq!(err.tier(), "disk");
        assert_eq!(err.to_string(), "tier 'disk' unavailable: permission denied");
    }
}
