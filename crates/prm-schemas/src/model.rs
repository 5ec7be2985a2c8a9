//! Core data model: enums, transient discovery projections, change events
//! and stored-state snapshots.
//!
//! Everything here is `Clone + Serialize + Deserialize` so values can cross
//! the cache boundary (JSON snapshots) and the status surface unchanged.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::DiscoveryError;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Pull request lifecycle state as persisted in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    Opened,
    Closed,
    Merged,
}

impl PrState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrState::Opened => "opened",
            PrState::Closed => "closed",
            PrState::Merged => "merged",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "opened" => Ok(PrState::Opened),
            "closed" => Ok(PrState::Closed),
            "merged" => Ok(PrState::Merged),
            other => Err(anyhow!("invalid pr state: {}", other)),
        }
    }
}

/// Check run execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Queued,
    InProgress,
    Completed,
    Cancelled,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Queued => "queued",
            CheckStatus::InProgress => "in_progress",
            CheckStatus::Completed => "completed",
            CheckStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(CheckStatus::Queued),
            "in_progress" => Ok(CheckStatus::InProgress),
            "completed" => Ok(CheckStatus::Completed),
            "cancelled" => Ok(CheckStatus::Cancelled),
            other => Err(anyhow!("invalid check status: {}", other)),
        }
    }
}

/// Terminal outcome of a completed check run. Absent while the check is
/// queued or in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckConclusion {
    Success,
    Failure,
    Neutral,
    Cancelled,
    TimedOut,
    ActionRequired,
    Stale,
    Skipped,
}

impl CheckConclusion {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckConclusion::Success => "success",
            CheckConclusion::Failure => "failure",
            CheckConclusion::Neutral => "neutral",
            CheckConclusion::Cancelled => "cancelled",
            CheckConclusion::TimedOut => "timed_out",
            CheckConclusion::ActionRequired => "action_required",
            CheckConclusion::Stale => "stale",
            CheckConclusion::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(CheckConclusion::Success),
            "failure" => Ok(CheckConclusion::Failure),
            "neutral" => Ok(CheckConclusion::Neutral),
            "cancelled" => Ok(CheckConclusion::Cancelled),
            "timed_out" => Ok(CheckConclusion::TimedOut),
            "action_required" => Ok(CheckConclusion::ActionRequired),
            "stale" => Ok(CheckConclusion::Stale),
            "skipped" => Ok(CheckConclusion::Skipped),
            other => Err(anyhow!("invalid check conclusion: {}", other)),
        }
    }
}

/// Kind of difference produced by the state-change detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    StateChanged,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Updated => "updated",
            ChangeKind::StateChanged => "state_changed",
            ChangeKind::Deleted => "deleted",
        }
    }
}

/// Entity addressed by a [`StateChange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    PullRequest,
    CheckRun,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::PullRequest => "pull_request",
            EntityKind::CheckRun => "check_run",
        }
    }
}

/// Scheduling priority. Declaration order is the scheduling order:
/// `Critical` sorts before `Low` via the derived `Ord`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    /// Numeric rank, lower = more urgent.
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Critical => 1,
            Priority::High => 2,
            Priority::Normal => 3,
            Priority::Low => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(anyhow!("invalid priority: {}", other)),
        }
    }

    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];
}

/// Repository activity status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoStatus {
    Active,
    Suspended,
    Error,
}

impl RepoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepoStatus::Active => "active",
            RepoStatus::Suspended => "suspended",
            RepoStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(RepoStatus::Active),
            "suspended" => Ok(RepoStatus::Suspended),
            "error" => Ok(RepoStatus::Error),
            other => Err(anyhow!("invalid repository status: {}", other)),
        }
    }
}

/// Trigger recorded on a state-history row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEvent {
    Opened,
    Synchronize,
    Closed,
    Reopened,
    Edited,
    ManualCheck,
}

impl TriggerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerEvent::Opened => "opened",
            TriggerEvent::Synchronize => "synchronize",
            TriggerEvent::Closed => "closed",
            TriggerEvent::Reopened => "reopened",
            TriggerEvent::Edited => "edited",
            TriggerEvent::ManualCheck => "manual_check",
        }
    }
}

// ---------------------------------------------------------------------------
// Repository record
// ---------------------------------------------------------------------------

/// A monitored repository as read from the store.
///
/// The engine mutates only `failure_count` and `last_polled_at` (through the
/// directory); everything else belongs to external admin tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryRecord {
    pub id: Uuid,
    pub url: String,
    pub name: String,
    pub status: RepoStatus,
    pub failure_count: i32,
    /// Opaque per-repository overrides (e.g. `discovery_priority`).
    pub config_override: Option<Value>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub polling_interval_minutes: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RepositoryRecord {
    pub fn is_active(&self) -> bool {
        self.status == RepoStatus::Active
    }

    /// Read a string value from the config override bag.
    pub fn config_value(&self, key: &str) -> Option<&str> {
        self.config_override.as_ref()?.get(key)?.as_str()
    }
}

// ---------------------------------------------------------------------------
// Discovered projections (transient, one cycle)
// ---------------------------------------------------------------------------

/// A check run as projected from one remote response. Not persisted directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredCheckRun {
    /// Remote identifier, globally unique within the check namespace.
    pub external_id: String,
    pub name: String,
    pub status: CheckStatus,
    pub conclusion: Option<CheckConclusion>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub logs_url: Option<String>,
    pub details_url: Option<String>,
    /// Check output (title, summary, text) plus any extra remote metadata.
    pub output: Value,
}

impl DiscoveredCheckRun {
    pub fn is_failed(&self) -> bool {
        self.status == CheckStatus::Completed && self.conclusion == Some(CheckConclusion::Failure)
    }
}

/// A pull request as projected from one remote response. Not persisted
/// directly; the synchronizer maps it onto rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredPr {
    pub pr_number: i32,
    pub title: String,
    pub author: String,
    pub state: PrState,
    pub draft: bool,
    pub base_branch: String,
    pub head_branch: String,
    pub base_sha: String,
    pub head_sha: String,
    pub url: String,
    pub body: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub merged_at: Option<DateTime<Utc>>,
    pub metadata: Value,
    /// Populated by the check discoverer after PR enumeration.
    pub check_runs: Vec<DiscoveredCheckRun>,
}

impl DiscoveredPr {
    pub fn is_active(&self) -> bool {
        self.state == PrState::Opened && !self.draft
    }
}

/// Per-repository aggregate produced by one discovery pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryResult {
    pub repository_id: Uuid,
    pub repository_url: String,
    pub discovered_prs: Vec<DiscoveredPr>,
    pub discovered_at: DateTime<Utc>,
    pub api_calls_used: u32,
    pub cache_hits: u32,
    pub cache_misses: u32,
    pub processing_time_ms: f64,
    pub errors: Vec<DiscoveryError>,
}

impl DiscoveryResult {
    /// Empty result carrying a single error, used when a repository cannot
    /// be processed at all.
    pub fn from_error(repository_id: Uuid, repository_url: &str, error: DiscoveryError) -> Self {
        Self {
            repository_id,
            repository_url: repository_url.to_string(),
            discovered_prs: Vec::new(),
            discovered_at: Utc::now(),
            api_calls_used: 0,
            cache_hits: 0,
            cache_misses: 0,
            processing_time_ms: 0.0,
            errors: vec![error],
        }
    }

    pub fn check_count(&self) -> usize {
        self.discovered_prs.iter().map(|pr| pr.check_runs.len()).sum()
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Stored state (loader output)
// ---------------------------------------------------------------------------

/// Snapshot of one stored PR used for diffing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredPrState {
    pub id: Uuid,
    pub pr_number: i32,
    pub state: PrState,
    pub head_sha: String,
    pub updated_at: DateTime<Utc>,
    /// Latest check run per name: `None` means the check exists but has no
    /// conclusion yet (queued / in progress).
    pub check_runs: BTreeMap<String, Option<CheckConclusion>>,
}

/// Stored snapshot of a whole repository, keyed by PR number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryState {
    pub repository_id: Uuid,
    pub pull_requests: BTreeMap<i32, StoredPrState>,
    pub loaded_at: DateTime<Utc>,
}

impl RepositoryState {
    pub fn empty(repository_id: Uuid) -> Self {
        Self {
            repository_id,
            pull_requests: BTreeMap::new(),
            loaded_at: Utc::now(),
        }
    }

    pub fn pr_state(&self, pr_number: i32) -> Option<&StoredPrState> {
        self.pull_requests.get(&pr_number)
    }
}

// ---------------------------------------------------------------------------
// State changes
// ---------------------------------------------------------------------------

/// One detected difference between a discovered entity and its stored
/// counterpart. Owned by a single cycle.
///
/// For `Created` entities `entity_id` is the nil UUID; the synchronizer
/// rewrites it once the corresponding row exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChange {
    pub entity: EntityKind,
    pub entity_id: Uuid,
    pub repository_id: Uuid,
    /// PR number for PR changes, `"<pr_number>:<check_name>"` for checks.
    pub external_id: String,
    pub old_state: Option<String>,
    pub new_state: String,
    pub kind: ChangeKind,
    pub metadata: Value,
    pub detected_at: DateTime<Utc>,
}

impl StateChange {
    pub fn is_placeholder(&self) -> bool {
        self.entity_id.is_nil()
    }
}

// ---------------------------------------------------------------------------
// Synchronization result
// ---------------------------------------------------------------------------

/// Outcome of one synchronization pass over a cycle's results.
///
/// `resolved_pr_ids` / `resolved_check_ids` map `(repository_id,
/// external_id)` to the surviving row id so placeholder entity ids in
/// change events can be rewritten before publication.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncResult {
    pub prs_processed: u64,
    pub prs_created: u64,
    pub prs_updated: u64,
    pub checks_processed: u64,
    pub checks_created: u64,
    pub checks_updated: u64,
    pub state_changes_recorded: u64,
    pub errors: Vec<DiscoveryError>,
    pub processing_time_ms: f64,
    /// `(repository_id, pr_number as string, row id)`.
    pub resolved_pr_ids: Vec<(Uuid, String, Uuid)>,
    /// `(repository_id, "<pr_number>:<check_name>", row id)`.
    pub resolved_check_ids: Vec<(Uuid, String, Uuid)>,
}

impl SyncResult {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Lookup table for placeholder rewriting, keyed by
    /// `(repository_id, external_id)`.
    pub fn resolved_entities(&self) -> std::collections::HashMap<(Uuid, &str), Uuid> {
        self.resolved_pr_ids
            .iter()
            .chain(self.resolved_check_ids.iter())
            .map(|(repo, external, id)| ((*repo, external.as_str()), *id))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_critical_first() {
        let mut ps = vec![Priority::Low, Priority::Critical, Priority::Normal, Priority::High];
        ps.sort();
        assert_eq!(
            ps,
            vec![Priority::Critical, Priority::High, Priority::Normal, Priority::Low]
        );
        assert_eq!(Priority::Critical.rank(), 1);
        assert_eq!(Priority::Low.rank(), 4);
    }

    #[test]
    fn enum_round_trips() {
        for s in ["opened", "closed", "merged"] {
            assert_eq!(PrState::parse(s).unwrap().as_str(), s);
        }
        for s in [
            "success",
            "failure",
            "neutral",
            "cancelled",
            "timed_out",
            "action_required",
            "stale",
            "skipped",
        ] {
            assert_eq!(CheckConclusion::parse(s).unwrap().as_str(), s);
        }
        assert!(PrState::parse("open").is_err());
        assert!(CheckConclusion::parse("ok").is_err());
    }

    #[test]
    fn check_run_failed_requires_completed() {
        let mut check = DiscoveredCheckRun {
            external_id: "c1".into(),
            name: "ci/test".into(),
            status: CheckStatus::InProgress,
            conclusion: None,
            started_at: None,
            completed_at: None,
            logs_url: None,
            details_url: None,
            output: Value::Null,
        };
        assert!(!check.is_failed());
        check.status = CheckStatus::Completed;
        check.conclusion = Some(CheckConclusion::Failure);
        assert!(check.is_failed());
        check.conclusion = Some(CheckConclusion::Success);
        assert!(!check.is_failed());
    }

    #[test]
    fn repository_config_value_reads_override_bag() {
        let repo = RepositoryRecord {
            id: Uuid::new_v4(),
            url: "https://github.com/test-org/repo-a".into(),
            name: "repo-a".into(),
            status: RepoStatus::Active,
            failure_count: 0,
            config_override: Some(serde_json::json!({"discovery_priority": "critical"})),
            last_polled_at: None,
            polling_interval_minutes: 15,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(repo.config_value("discovery_priority"), Some("critical"));
        assert_eq!(repo.config_value("missing"), None);
    }

    #[test]
    fn state_change_placeholder_detection() {
        let change = StateChange {
            entity: EntityKind::PullRequest,
            entity_id: Uuid::nil(),
            repository_id: Uuid::new_v4(),
            external_id: "42".into(),
            old_state: None,
            new_state: "opened".into(),
            kind: ChangeKind::Created,
            metadata: Value::Null,
            detected_at: Utc::now(),
        };
        assert!(change.is_placeholder());
    }
}
