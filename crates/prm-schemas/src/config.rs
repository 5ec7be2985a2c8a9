//! Typed discovery configuration.
//!
//! All fields carry the documented defaults so a missing `discovery` section
//! in the layered config yields a fully usable configuration.

use serde::{Deserialize, Serialize};

/// Tunables for one discovery engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Window size for the bounded per-cycle fan-out.
    pub max_concurrent_repositories: usize,
    /// Enumeration cap per repository per cycle.
    pub max_prs_per_repository: usize,
    /// TTL for scan / check-run listings in the cache.
    pub cache_ttl_seconds: u64,
    /// Send `If-None-Match` when a prior ETag is known.
    pub use_etag_caching: bool,
    /// Row batch size for the synchronizer.
    pub batch_size: usize,
    /// Upper bound for one repository's discovery pass.
    pub discovery_timeout_seconds: u64,
    /// Sort repositories by resolved priority before fan-out.
    pub priority_scheduling: bool,
    /// Inter-cycle wait in the worker loop.
    pub interval_seconds: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_concurrent_repositories: 10,
            max_prs_per_repository: 1000,
            cache_ttl_seconds: 300,
            use_etag_caching: true,
            batch_size: 100,
            discovery_timeout_seconds: 300,
            priority_scheduling: true,
            interval_seconds: 300,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = DiscoveryConfig::default();
        assert_eq!(cfg.max_concurrent_repositories, 10);
        assert_eq!(cfg.max_prs_per_repository, 1000);
        assert_eq!(cfg.cache_ttl_seconds, 300);
        assert!(cfg.use_etag_caching);
        assert_eq!(cfg.batch_size, 100);
        assert_eq!(cfg.discovery_timeout_seconds, 300);
        assert!(cfg.priority_scheduling);
        assert_eq!(cfg.interval_seconds, 300);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: DiscoveryConfig =
            serde_json::from_str(r#"{"max_concurrent_repositories": 4}"#).unwrap();
        assert_eq!(cfg.max_concurrent_repositories, 4);
        assert_eq!(cfg.batch_size, 100);
    }
}
