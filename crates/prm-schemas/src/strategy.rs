//! Strategy traits consumed by the discovery engine.
//!
//! The engine sees its collaborators only through these narrow capability
//! sets; concrete implementations are injected at construction so a test
//! build can supply in-memory collaborators. All traits are object-safe and
//! held as `Arc<dyn ...>`.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::DiscoveryError;
use crate::model::{
    DiscoveredCheckRun, DiscoveredPr, DiscoveryResult, Priority, RepositoryRecord,
    RepositoryState, StateChange, SyncResult,
};

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

/// Point-in-time snapshot of one rate-limit bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub capacity: f64,
    pub current_tokens: f64,
    pub refill_rate: f64,
    /// Fraction of capacity currently consumed.
    pub utilization: f64,
    /// Waiter queue depth per priority level.
    pub queue_depths: BTreeMap<String, usize>,
    pub api_limit: Option<u32>,
    pub api_remaining: Option<u32>,
    pub api_reset_at: Option<DateTime<Utc>>,
}

/// Token-bucket rate limiting over named remote resource classes
/// (`core`, `search`, `graphql`).
#[async_trait]
pub trait RateLimitStrategy: Send + Sync {
    /// Consume `count` tokens immediately if available. Never blocks.
    /// Zero-token acquisition always succeeds; unknown resources fail.
    async fn acquire(&self, resource: &str, count: u32) -> bool;

    /// Acquire with priority queuing: immediate attempt first, then a
    /// per-priority FIFO queue serviced critical-first. Returns false on
    /// timeout; a timed-out waiter does not hold its queue slot.
    async fn acquire_with_priority(
        &self,
        resource: &str,
        priority: Priority,
        count: u32,
        timeout: Option<Duration>,
    ) -> bool;

    /// Currently available whole tokens (0 for unknown resources).
    async fn available(&self, resource: &str) -> u32;

    /// Sleep until `count` tokens can be taken, or the timeout elapses.
    async fn wait_for(&self, resource: &str, count: u32, timeout: Option<Duration>) -> bool;

    /// Reconcile a bucket with authoritative remote limit headers.
    async fn update_limits(
        &self,
        resource: &str,
        limit: u32,
        remaining: u32,
        reset_at: DateTime<Utc>,
    );

    /// Snapshot of every managed bucket.
    async fn status(&self) -> BTreeMap<String, ResourceStatus>;

    /// Estimated wait until `count` tokens are available.
    async fn estimate_wait(&self, resource: &str, count: u32) -> Duration;

    /// Recommended remote batch size given current availability.
    async fn optimal_batch_size(&self, resource: &str) -> usize;
}

// ---------------------------------------------------------------------------
// Caching
// ---------------------------------------------------------------------------

/// Cache hit/miss counters with derived rates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub errors: u64,
}

impl CacheStats {
    pub fn total_requests(&self) -> u64 {
        self.l1_hits + self.l2_hits + self.misses
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            return 0.0;
        }
        (self.l1_hits + self.l2_hits) as f64 / total as f64
    }

    pub fn l1_hit_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            return 0.0;
        }
        self.l1_hits as f64 / total as f64
    }
}

/// Two-tier cache over JSON-encodable snapshots. Best-effort on every
/// operation: backend failures surface as misses, never as errors.
#[async_trait]
pub trait CacheStrategy: Send + Sync {
    async fn get(&self, key: &str) -> Option<Value>;

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>);

    /// Remove entries whose raw key matches the glob `pattern`. Returns the
    /// number of entries removed across both tiers.
    async fn invalidate(&self, pattern: &str) -> usize;

    /// Fetch a value together with the ETag stored under its companion key.
    async fn get_with_etag(&self, key: &str) -> (Option<Value>, Option<String>);

    /// Store a value and its ETag companion with one TTL.
    async fn set_with_etag(&self, key: &str, value: Value, etag: &str, ttl: Option<Duration>);

    fn stats(&self) -> CacheStats;
}

// ---------------------------------------------------------------------------
// Repository directory
// ---------------------------------------------------------------------------

/// Read/annotate access to the repository fleet. The engine mutates only
/// poll bookkeeping and failure accounting through this trait.
#[async_trait]
pub trait RepositoryDirectory: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<RepositoryRecord>>;

    async fn mark_polled(&self, id: Uuid) -> Result<()>;

    async fn reset_failures(&self, id: Uuid) -> Result<()>;

    /// Increment the failure count; flips status to `error` past the
    /// critical threshold is left to operators.
    async fn record_failure(&self, id: Uuid, message: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Discovery strategies
// ---------------------------------------------------------------------------

/// PR enumeration plus scheduling-priority resolution for one repository.
#[async_trait]
pub trait PrDiscovery: Send + Sync {
    /// Enumerate PRs. Errors are collected into the result, never returned.
    async fn discover_prs(
        &self,
        repository_id: Uuid,
        repository_url: &str,
        since: Option<DateTime<Utc>>,
        max_prs: Option<usize>,
    ) -> DiscoveryResult;

    /// Resolve the scheduling priority. Resolution failures default to
    /// `Normal`.
    async fn priority(&self, repository_id: Uuid) -> Priority;
}

/// Outcome of a batched check-run enumeration: per-PR check lists plus any
/// per-SHA failures, which the caller folds into its discovery result.
#[derive(Debug, Clone, Default)]
pub struct CheckBatchOutcome {
    pub checks_by_pr: HashMap<i32, Vec<DiscoveredCheckRun>>,
    pub errors: Vec<DiscoveryError>,
    pub api_calls_used: u32,
    pub cache_hits: u32,
    pub cache_misses: u32,
}

/// Check-run enumeration at a PR's head commit.
#[async_trait]
pub trait CheckDiscovery: Send + Sync {
    /// Enumerate check runs for a single PR's head SHA.
    async fn discover_checks(
        &self,
        pr: &DiscoveredPr,
        repository_url: &str,
    ) -> Result<Vec<DiscoveredCheckRun>, DiscoveryError>;

    /// Enumerate check runs for many PRs, one remote enumeration per unique
    /// head SHA. A failed SHA yields empty lists for its PRs plus an error
    /// in the outcome.
    async fn batch_discover_checks(
        &self,
        prs: &[DiscoveredPr],
        repository_url: &str,
    ) -> CheckBatchOutcome;
}

// ---------------------------------------------------------------------------
// State detection
// ---------------------------------------------------------------------------

/// Stored-state loading plus discovered-vs-stored diffing.
#[async_trait]
pub trait StateDetection: Send + Sync {
    /// Load the stored snapshot for one repository. Store errors yield an
    /// empty state.
    async fn load_state(&self, repository_id: Uuid) -> RepositoryState;

    /// Load snapshots for many repositories concurrently.
    async fn batch_load_states(
        &self,
        repository_ids: &[Uuid],
    ) -> HashMap<Uuid, RepositoryState>;

    /// Diff one discovery result against the stored snapshot, returning only
    /// significant changes.
    fn detect_changes(
        &self,
        discovered: &DiscoveryResult,
        stored: &RepositoryState,
    ) -> Vec<StateChange>;
}

// ---------------------------------------------------------------------------
// Synchronization
// ---------------------------------------------------------------------------

/// Transactional upsert of a cycle's discoveries and its history rows.
#[async_trait]
pub trait DataSynchronization: Send + Sync {
    async fn synchronize(
        &self,
        results: &[DiscoveryResult],
        changes: &[StateChange],
    ) -> SyncResult;
}

// ---------------------------------------------------------------------------
// Event publication
// ---------------------------------------------------------------------------

/// Outbound notifications. At-least-once, best-effort: implementations log
/// and count failures, never propagate them.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_new_pr(&self, repository_id: Uuid, pr: &DiscoveredPr);

    async fn publish_state_change(&self, change: &StateChange);

    async fn publish_failed_check(
        &self,
        repository_id: Uuid,
        pr_number: i32,
        check: &DiscoveredCheckRun,
    );

    async fn publish_discovery_complete(&self, results: &[DiscoveryResult]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_stats_rates() {
        let stats = CacheStats {
            l1_hits: 6,
            l2_hits: 2,
            misses: 2,
            sets: 10,
            errors: 0,
        };
        assert_eq!(stats.total_requests(), 10);
        assert!((stats.hit_rate() - 0.8).abs() < f64::EPSILON);
        assert!((stats.l1_hit_rate() - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn cache_stats_empty_is_zero_rate() {
        let stats = CacheStats::default();
        assert_eq!(stats.hit_rate(), 0.0);
        assert_eq!(stats.l1_hit_rate(), 0.0);
    }

    #[test]
    fn traits_are_object_safe() {
        // Compile-time proof: trait objects can be named.
        fn _takes(
            _a: &dyn RateLimitStrategy,
            _b: &dyn CacheStrategy,
            _c: &dyn PrDiscovery,
            _d: &dyn CheckDiscovery,
            _e: &dyn StateDetection,
            _f: &dyn DataSynchronization,
            _g: &dyn EventPublisher,
            _h: &dyn RepositoryDirectory,
        ) {
        }
    }
}
