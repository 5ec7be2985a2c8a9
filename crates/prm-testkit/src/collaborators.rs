//! In-memory strategy implementations.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use prm_schemas::{
    CacheStats, CacheStrategy, ChangeKind, CheckBatchOutcome, CheckDiscovery, DataSynchronization,
    DiscoveredCheckRun, DiscoveredPr, DiscoveryError, DiscoveryErrorKind, DiscoveryResult,
    EntityKind, EventPublisher, PrDiscovery, Priority, RepositoryDirectory, RepositoryRecord,
    RepositoryState, StateChange, StateDetection, SyncResult,
};

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

/// Mutable in-memory repository directory.
#[derive(Default)]
pub struct InMemoryDirectory {
    repos: Mutex<HashMap<Uuid, RepositoryRecord>>,
}

impl InMemoryDirectory {
    pub fn with(repos: Vec<RepositoryRecord>) -> Arc<Self> {
        Arc::new(Self {
            repos: Mutex::new(repos.into_iter().map(|r| (r.id, r)).collect()),
        })
    }

    pub async fn failure_count(&self, id: Uuid) -> i32 {
        self.repos
            .lock()
            .await
            .get(&id)
            .map(|r| r.failure_count)
            .unwrap_or(0)
    }

    pub async fn last_polled_at(&self, id: Uuid) -> Option<DateTime<Utc>> {
        self.repos.lock().await.get(&id).and_then(|r| r.last_polled_at)
    }
}

#[async_trait]
impl RepositoryDirectory for InMemoryDirectory {
    async fn get(&self, id: Uuid) -> Result<Option<RepositoryRecord>> {
        Ok(self.repos.lock().await.get(&id).cloned())
    }

    async fn mark_polled(&self, id: Uuid) -> Result<()> {
        if let Some(repo) = self.repos.lock().await.get_mut(&id) {
            repo.last_polled_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn reset_failures(&self, id: Uuid) -> Result<()> {
        if let Some(repo) = self.repos.lock().await.get_mut(&id) {
            repo.failure_count = 0;
        }
        Ok(())
    }

    async fn record_failure(&self, id: Uuid, _message: &str) -> Result<()> {
        if let Some(repo) = self.repos.lock().await.get_mut(&id) {
            repo.failure_count += 1;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// TTL-less map cache; enough for wiring that only needs the interface.
#[derive(Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, Value>>,
}

#[async_trait]
impl CacheStrategy for InMemoryCache {
    async fn get(&self, key: &str) -> Option<Value> {
        self.entries.lock().await.get(key).cloned()
    }

    async fn set(&self, key: &str, value: Value, _ttl: Option<Duration>) {
        self.entries.lock().await.insert(key.to_string(), value);
    }

    async fn invalidate(&self, pattern: &str) -> usize {
        let mut entries = self.entries.lock().await;
        let victims: Vec<String> = entries
            .keys()
            .filter(|k| k.contains(pattern))
            .cloned()
            .collect();
        for k in &victims {
            entries.remove(k);
        }
        victims.len()
    }

    async fn get_with_etag(&self, key: &str) -> (Option<Value>, Option<String>) {
        let value = self.get(key).await;
        let etag = self
            .get(&format!("{key}:etag"))
            .await
            .and_then(|v| v.as_str().map(String::from));
        (value, etag)
    }

    async fn set_with_etag(&self, key: &str, value: Value, etag: &str, ttl: Option<Duration>) {
        self.set(key, value, ttl).await;
        self.set(&format!("{key}:etag"), Value::from(etag), ttl).await;
    }

    fn stats(&self) -> CacheStats {
        CacheStats::default()
    }
}

// ---------------------------------------------------------------------------
// PR discovery
// ---------------------------------------------------------------------------

/// Canned per-repository discovery results with optional priorities.
#[derive(Default)]
pub struct StaticPrDiscovery {
    results: Mutex<HashMap<Uuid, DiscoveryResult>>,
    priorities: Mutex<HashMap<Uuid, Priority>>,
}

impl StaticPrDiscovery {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn put_result(&self, result: DiscoveryResult) {
        self.results
            .lock()
            .await
            .insert(result.repository_id, result);
    }

    pub async fn put_priority(&self, repository_id: Uuid, priority: Priority) {
        self.priorities.lock().await.insert(repository_id, priority);
    }
}

#[async_trait]
impl PrDiscovery for StaticPrDiscovery {
    async fn discover_prs(
        &self,
        repository_id: Uuid,
        repository_url: &str,
        _since: Option<DateTime<Utc>>,
        _max_prs: Option<usize>,
    ) -> DiscoveryResult {
        match self.results.lock().await.get(&repository_id) {
            Some(result) => result.clone(),
            None => DiscoveryResult::from_error(
                repository_id,
                repository_url,
                DiscoveryError::new(
                    DiscoveryErrorKind::UnexpectedError,
                    "no canned result configured",
                ),
            ),
        }
    }

    async fn priority(&self, repository_id: Uuid) -> Priority {
        self.priorities
            .lock()
            .await
            .get(&repository_id)
            .copied()
            .unwrap_or(Priority::Normal)
    }
}

// ---------------------------------------------------------------------------
// Check discovery
// ---------------------------------------------------------------------------

/// Canned check runs, keyed by PR number.
#[derive(Default)]
pub struct StaticCheckDiscovery {
    checks_by_pr: Mutex<HashMap<i32, Vec<DiscoveredCheckRun>>>,
}

impl StaticCheckDiscovery {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn put_checks(&self, pr_number: i32, checks: Vec<DiscoveredCheckRun>) {
        self.checks_by_pr.lock().await.insert(pr_number, checks);
    }
}

#[async_trait]
impl CheckDiscovery for StaticCheckDiscovery {
    async fn discover_checks(
        &self,
        pr: &DiscoveredPr,
        _repository_url: &str,
    ) -> Result<Vec<DiscoveredCheckRun>, DiscoveryError> {
        Ok(self
            .checks_by_pr
            .lock()
            .await
            .get(&pr.pr_number)
            .cloned()
            .unwrap_or_default())
    }

    async fn batch_discover_checks(
        &self,
        prs: &[DiscoveredPr],
        _repository_url: &str,
    ) -> CheckBatchOutcome {
        let checks = self.checks_by_pr.lock().await;
        let mut outcome = CheckBatchOutcome::default();
        for pr in prs {
            outcome.checks_by_pr.insert(
                pr.pr_number,
                checks.get(&pr.pr_number).cloned().unwrap_or_default(),
            );
        }
        outcome
    }
}

// ---------------------------------------------------------------------------
// State detection
// ---------------------------------------------------------------------------

/// Holds stored repository states in memory; diffing is the real detector.
#[derive(Default)]
pub struct InMemoryStateStore {
    states: Mutex<HashMap<Uuid, RepositoryState>>,
}

impl InMemoryStateStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn put_state(&self, state: RepositoryState) {
        self.states.lock().await.insert(state.repository_id, state);
    }
}

#[async_trait]
impl StateDetection for InMemoryStateStore {
    async fn load_state(&self, repository_id: Uuid) -> RepositoryState {
        self.states
            .lock()
            .await
            .get(&repository_id)
            .cloned()
            .unwrap_or_else(|| RepositoryState::empty(repository_id))
    }

    async fn batch_load_states(
        &self,
        repository_ids: &[Uuid],
    ) -> HashMap<Uuid, RepositoryState> {
        let mut out = HashMap::new();
        for id in repository_ids {
            out.insert(*id, self.load_state(*id).await);
        }
        out
    }

    fn detect_changes(
        &self,
        discovered: &DiscoveryResult,
        stored: &RepositoryState,
    ) -> Vec<StateChange> {
        prm_state::detect_changes(discovered, stored)
    }
}

// ---------------------------------------------------------------------------
// Synchronizer
// ---------------------------------------------------------------------------

/// Captures synchronize() inputs and simulates row writes. Repositories in
/// `fail_repositories` produce a batch error and contribute no counts, as a
/// rolled-back transaction would.
#[derive(Default)]
pub struct RecordingSynchronizer {
    pub calls: Mutex<Vec<(Vec<DiscoveryResult>, Vec<StateChange>)>>,
    fail_repositories: Mutex<HashSet<Uuid>>,
}

impl RecordingSynchronizer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn fail_repository(&self, repository_id: Uuid) {
        self.fail_repositories.lock().await.insert(repository_id);
    }

    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }
}

#[async_trait]
impl DataSynchronization for RecordingSynchronizer {
    async fn synchronize(
        &self,
        results: &[DiscoveryResult],
        changes: &[StateChange],
    ) -> SyncResult {
        self.calls
            .lock()
            .await
            .push((results.to_vec(), changes.to_vec()));

        let failing = self.fail_repositories.lock().await;
        let mut out = SyncResult::default();

        for result in results {
            if failing.contains(&result.repository_id) {
                out.errors.push(
                    DiscoveryError::new(
                        DiscoveryErrorKind::PrBatchSyncError,
                        "injected constraint violation",
                    )
                    .with_context(json!({"repository_id": result.repository_id})),
                );
                continue;
            }
            for pr in &result.discovered_prs {
                out.prs_processed += 1;
                out.prs_created += 1;
                out.resolved_pr_ids.push((
                    result.repository_id,
                    pr.pr_number.to_string(),
                    Uuid::new_v4(),
                ));
                for check in &pr.check_runs {
                    out.checks_processed += 1;
                    out.checks_created += 1;
                    out.resolved_check_ids.push((
                        result.repository_id,
                        format!("{}:{}", pr.pr_number, check.name),
                        Uuid::new_v4(),
                    ));
                }
            }
        }

        for change in changes {
            if change.entity == EntityKind::PullRequest
                && change.kind != ChangeKind::Deleted
                && !failing.contains(&change.repository_id)
            {
                out.state_changes_recorded += 1;
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Event publisher
// ---------------------------------------------------------------------------

/// Captures every published event for assertions.
#[derive(Default)]
pub struct RecordingPublisher {
    pub state_changes: Mutex<Vec<StateChange>>,
    pub failed_checks: Mutex<Vec<(Uuid, i32, String)>>,
    pub completions: Mutex<Vec<usize>>,
    pub new_prs: Mutex<Vec<(Uuid, i32)>>,
}

impl RecordingPublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish_new_pr(&self, repository_id: Uuid, pr: &DiscoveredPr) {
        self.new_prs.lock().await.push((repository_id, pr.pr_number));
    }

    async fn publish_state_change(&self, change: &StateChange) {
        self.state_changes.lock().await.push(change.clone());
    }

    async fn publish_failed_check(
        &self,
        repository_id: Uuid,
        pr_number: i32,
        check: &DiscoveredCheckRun,
    ) {
        self.failed_checks
            .lock()
            .await
            .push((repository_id, pr_number, check.name.clone()));
    }

    async fn publish_discovery_complete(&self, results: &[DiscoveryResult]) {
        self.completions.lock().await.push(results.len());
    }
}
