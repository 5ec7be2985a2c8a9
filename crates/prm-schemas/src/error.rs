//! Discovery error taxonomy.
//!
//! Errors in the discovery pipeline are **collected, not thrown** wherever a
//! partial result is meaningful, so the error type here is a plain data
//! struct that rides inside results, not a `std::error::Error`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of error classes the pipeline distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryErrorKind {
    RepositoryNotFound,
    AuthenticationError,
    RateLimitExceeded,
    GithubApiError,
    InvalidRepositoryUrl,
    PrConversionError,
    RepositoryProcessingError,
    DiscoveryCycleError,
    PrBatchSyncError,
    SynchronizationError,
    UnexpectedError,
}

impl DiscoveryErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryErrorKind::RepositoryNotFound => "repository_not_found",
            DiscoveryErrorKind::AuthenticationError => "authentication_error",
            DiscoveryErrorKind::RateLimitExceeded => "rate_limit_exceeded",
            DiscoveryErrorKind::GithubApiError => "github_api_error",
            DiscoveryErrorKind::InvalidRepositoryUrl => "invalid_repository_url",
            DiscoveryErrorKind::PrConversionError => "pr_conversion_error",
            DiscoveryErrorKind::RepositoryProcessingError => "repository_processing_error",
            DiscoveryErrorKind::DiscoveryCycleError => "discovery_cycle_error",
            DiscoveryErrorKind::PrBatchSyncError => "pr_batch_sync_error",
            DiscoveryErrorKind::SynchronizationError => "synchronization_error",
            DiscoveryErrorKind::UnexpectedError => "unexpected_error",
        }
    }

    /// Whether a retry on a later cycle can reasonably succeed.
    pub fn recoverable(&self) -> bool {
        !matches!(
            self,
            DiscoveryErrorKind::RepositoryNotFound
                | DiscoveryErrorKind::AuthenticationError
                | DiscoveryErrorKind::InvalidRepositoryUrl
        )
    }
}

/// One collected error: class, human-readable message, context bag,
/// timestamp and recoverability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryError {
    pub kind: DiscoveryErrorKind,
    pub message: String,
    pub context: Value,
    pub timestamp: DateTime<Utc>,
    pub recoverable: bool,
}

impl DiscoveryError {
    pub fn new(kind: DiscoveryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: Value::Null,
            timestamp: Utc::now(),
            recoverable: kind.recoverable(),
        }
    }

    /// Attach a context bag (ids, status codes, reset times).
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverability_follows_taxonomy() {
        assert!(!DiscoveryErrorKind::RepositoryNotFound.recoverable());
        assert!(!DiscoveryErrorKind::AuthenticationError.recoverable());
        assert!(!DiscoveryErrorKind::InvalidRepositoryUrl.recoverable());
        assert!(DiscoveryErrorKind::RateLimitExceeded.recoverable());
        assert!(DiscoveryErrorKind::GithubApiError.recoverable());
        assert!(DiscoveryErrorKind::PrConversionError.recoverable());
        assert!(DiscoveryErrorKind::PrBatchSyncError.recoverable());
        assert!(DiscoveryErrorKind::UnexpectedError.recoverable());
    }

    #[test]
    fn context_bag_attaches() {
        let err = DiscoveryError::new(DiscoveryErrorKind::RateLimitExceeded, "limited")
            .with_context(serde_json::json!({"remaining": 0, "reset_time": 1_700_000_000}));
        assert!(err.recoverable);
        assert_eq!(err.context["remaining"], 0);
        assert_eq!(err.kind.as_str(), "rate_limit_exceeded");
    }
}
