//! The discovery engine proper.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use serde_json::json;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use prm_schemas::{
    CacheStrategy, CheckDiscovery, DataSynchronization, DiscoveryConfig, DiscoveryError,
    DiscoveryErrorKind, DiscoveryResult, EventPublisher, PrDiscovery, Priority,
    RateLimitStrategy, RepositoryDirectory, RepositoryState, StateChange, StateDetection,
    SyncResult,
};

use crate::cycle::{
    BatchStats, ConcurrencyView, CycleState, CycleView, EngineStatus, ErrorView, RollingMetrics,
};

/// Minimum core-token quota reserved before scanning one repository.
const MIN_TOKEN_RESERVE: u32 = 10;
const TOKEN_RESERVE_WAIT: Duration = Duration::from_secs(30);
/// Errors newer than this (seconds) drive the degraded verdict.
const DEGRADED_WINDOW_SECS: i64 = 3600;
const DEGRADED_ERROR_LIMIT: usize = 10;
const RECENT_ERRORS_KEPT: usize = 100;

/// Orchestrates discovery cycles over injected collaborators.
pub struct DiscoveryEngine {
    config: DiscoveryConfig,
    pr_discovery: Arc<dyn PrDiscovery>,
    check_discovery: Arc<dyn CheckDiscovery>,
    state: Arc<dyn StateDetection>,
    sync: Arc<dyn DataSynchronization>,
    rate: Arc<dyn RateLimitStrategy>,
    cache: Arc<dyn CacheStrategy>,
    events: Arc<dyn EventPublisher>,
    directory: Arc<dyn RepositoryDirectory>,

    slots: Arc<Semaphore>,
    active_tasks: Mutex<HashSet<String>>,
    cycle: Mutex<CycleState>,
    rolling: Mutex<RollingMetrics>,
    recent_errors: Mutex<VecDeque<ErrorView>>,
    last_cycle_completed_at: Mutex<Option<chrono::DateTime<Utc>>>,
}

#[allow(clippy::too_many_arguments)]
impl DiscoveryEngine {
    pub fn new(
        config: DiscoveryConfig,
        pr_discovery: Arc<dyn PrDiscovery>,
        check_discovery: Arc<dyn CheckDiscovery>,
        state: Arc<dyn StateDetection>,
        sync: Arc<dyn DataSynchronization>,
        rate: Arc<dyn RateLimitStrategy>,
        cache: Arc<dyn CacheStrategy>,
        events: Arc<dyn EventPublisher>,
        directory: Arc<dyn RepositoryDirectory>,
    ) -> Self {
        let max_concurrent = config.max_concurrent_repositories.max(1);
        Self {
            config,
            pr_discovery,
            check_discovery,
            state,
            sync,
            rate,
            cache,
            events,
            directory,
            slots: Arc::new(Semaphore::new(max_concurrent)),
            active_tasks: Mutex::new(HashSet::new()),
            cycle: Mutex::new(CycleState::default()),
            rolling: Mutex::new(RollingMetrics::default()),
            recent_errors: Mutex::new(VecDeque::new()),
            last_cycle_completed_at: Mutex::new(None),
        }
    }

    /// Run one full discovery cycle. Never fails: every kind of trouble is
    /// collected into results and cycle accounting.
    pub async fn run_cycle(&self, repository_ids: &[Uuid]) -> Vec<DiscoveryResult> {
        if repository_ids.is_empty() {
            info!("no repositories to process");
            return Vec::new();
        }

        self.cycle.lock().await.begin(repository_ids.len());
        info!(
            repositories = repository_ids.len(),
            max_concurrent = self.config.max_concurrent_repositories,
            "starting discovery cycle"
        );

        // Step 1: priority sort.
        let sorted = if self.config.priority_scheduling {
            self.sort_by_priority(repository_ids).await
        } else {
            repository_ids.to_vec()
        };

        // Step 2: bounded fan-out, one window at a time.
        let window = self.config.max_concurrent_repositories.max(1);
        let mut all_results: Vec<DiscoveryResult> = Vec::with_capacity(sorted.len());
        for (index, batch) in sorted.chunks(window).enumerate() {
            let batch_started = std::time::Instant::now();
            let results = join_all(batch.iter().map(|id| self.process_repository(*id))).await;
            self.absorb_batch(index + 1, batch.len(), &results, batch_started.elapsed())
                .await;
            all_results.extend(results);
        }

        // Step 3: change detection against stored state.
        let ids: Vec<Uuid> = all_results.iter().map(|r| r.repository_id).collect();
        let stored_states = self.state.batch_load_states(&ids).await;
        let mut changes: Vec<StateChange> = Vec::new();
        for result in &all_results {
            let stored = stored_states
                .get(&result.repository_id)
                .cloned()
                .unwrap_or_else(|| RepositoryState::empty(result.repository_id));
            changes.extend(self.state.detect_changes(result, &stored));
        }
        self.cycle.lock().await.state_changes_detected = changes.len();
        info!(changes = changes.len(), "state change detection finished");

        // Step 4: synchronization.
        let sync_result = self.sync.synchronize(&all_results, &changes).await;
        let sync_failed_repos = self.absorb_sync_outcome(&all_results, &sync_result).await;

        // Step 5: event publication, with placeholder ids rewritten to the
        // rows the synchronizer resolved. Changes for rolled-back
        // repositories are withheld.
        self.publish_events(&all_results, &changes, &sync_result, &sync_failed_repos)
            .await;

        // Step 6: cycle accounting.
        self.finish_cycle(&all_results).await;

        all_results
    }

    async fn sort_by_priority(&self, repository_ids: &[Uuid]) -> Vec<Uuid> {
        let priorities =
            join_all(repository_ids.iter().map(|id| self.pr_discovery.priority(*id))).await;

        let mut pairs: Vec<(Priority, Uuid)> = priorities
            .into_iter()
            .zip(repository_ids.iter().copied())
            .collect();
        pairs.sort_by_key(|(priority, _)| priority.rank());

        let mut distribution: HashMap<&'static str, usize> = HashMap::new();
        for (priority, _) in &pairs {
            *distribution.entry(priority.as_str()).or_default() += 1;
        }
        debug!(?distribution, "repository priority distribution");

        pairs.into_iter().map(|(_, id)| id).collect()
    }

    /// Process one repository under the global concurrency cap and the
    /// per-repository timeout. Always returns a result.
    async fn process_repository(&self, repository_id: Uuid) -> DiscoveryResult {
        let _permit = self
            .slots
            .acquire()
            .await
            .expect("concurrency semaphore is never closed");
        let task_name = format!("repo-{:.8}", repository_id.to_string());
        self.active_tasks.lock().await.insert(task_name.clone());

        let timeout = Duration::from_secs(self.config.discovery_timeout_seconds.max(1));
        let result = match tokio::time::timeout(timeout, self.process_inner(repository_id)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(repository_id = %repository_id, "repository discovery timed out");
                let _ = self
                    .directory
                    .record_failure(repository_id, "discovery timed out")
                    .await;
                DiscoveryResult::from_error(
                    repository_id,
                    "unknown",
                    DiscoveryError::new(
                        DiscoveryErrorKind::RepositoryProcessingError,
                        format!("discovery timed out after {timeout:?}"),
                    )
                    .with_context(json!({"repository_id": repository_id})),
                )
            }
        };

        self.active_tasks.lock().await.remove(&task_name);
        result
    }

    async fn process_inner(&self, repository_id: Uuid) -> DiscoveryResult {
        let repo = match self.directory.get(repository_id).await {
            Ok(Some(repo)) => repo,
            Ok(None) => {
                let _ = self
                    .directory
                    .record_failure(repository_id, "repository not found")
                    .await;
                return DiscoveryResult::from_error(
                    repository_id,
                    "unknown",
                    DiscoveryError::new(
                        DiscoveryErrorKind::RepositoryProcessingError,
                        format!("repository {repository_id} not found"),
                    )
                    .with_context(json!({"repository_id": repository_id})),
                );
            }
            Err(e) => {
                return DiscoveryResult::from_error(
                    repository_id,
                    "unknown",
                    DiscoveryError::new(
                        DiscoveryErrorKind::RepositoryProcessingError,
                        format!("repository lookup failed: {e:#}"),
                    )
                    .with_context(json!({"repository_id": repository_id})),
                );
            }
        };

        if !repo.is_active() {
            let _ = self
                .directory
                .record_failure(repository_id, "repository not active")
                .await;
            return DiscoveryResult::from_error(
                repository_id,
                &repo.url,
                DiscoveryError::new(
                    DiscoveryErrorKind::RepositoryProcessingError,
                    format!("repository {repository_id} is not active"),
                )
                .with_context(json!({"repository_id": repository_id, "status": repo.status})),
            );
        }

        // Hold back until a minimum token quota is available so one
        // repository cannot strand the whole window mid-scan.
        if self.rate.available("core").await < MIN_TOKEN_RESERVE {
            let replenished = self
                .rate
                .wait_for("core", MIN_TOKEN_RESERVE, Some(TOKEN_RESERVE_WAIT))
                .await;
            if !replenished {
                debug!(repository_id = %repository_id, "token reserve not replenished in time");
            }
        }

        self.rate.acquire("core", 1).await;
        let mut discovery = self
            .pr_discovery
            .discover_prs(
                repository_id,
                &repo.url,
                None,
                Some(self.config.max_prs_per_repository),
            )
            .await;

        if !discovery.discovered_prs.is_empty() {
            self.rate.acquire("core", 1).await;
            let mut outcome = self
                .check_discovery
                .batch_discover_checks(&discovery.discovered_prs, &repo.url)
                .await;
            for pr in &mut discovery.discovered_prs {
                pr.check_runs = outcome
                    .checks_by_pr
                    .remove(&pr.pr_number)
                    .unwrap_or_default();
            }
            discovery.api_calls_used += outcome.api_calls_used;
            discovery.cache_hits += outcome.cache_hits;
            discovery.cache_misses += outcome.cache_misses;
            discovery.errors.extend(outcome.errors);
        }

        if let Err(e) = self.directory.mark_polled(repository_id).await {
            warn!(repository_id = %repository_id, error = %e, "failed to update poll timestamp");
        }

        if discovery.errors.is_empty() {
            if repo.failure_count > 0 {
                let _ = self.directory.reset_failures(repository_id).await;
            }
        } else {
            let message = discovery.errors[0].message.clone();
            let _ = self.directory.record_failure(repository_id, &message).await;
        }

        discovery
    }

    async fn absorb_batch(
        &self,
        batch_number: usize,
        batch_len: usize,
        results: &[DiscoveryResult],
        elapsed: Duration,
    ) {
        let successful = results.iter().filter(|r| r.errors.is_empty()).count();
        let failed = results.len() - successful;
        let prs: usize = results.iter().map(|r| r.discovered_prs.len()).sum();
        let checks: usize = results.iter().map(|r| r.check_count()).sum();

        let mut cycle = self.cycle.lock().await;
        cycle.repositories_processed += batch_len;
        cycle.repositories_successful += successful;
        cycle.repositories_failed += failed;
        cycle.prs_discovered += prs;
        cycle.checks_discovered += checks;
        for result in results {
            cycle.errors.extend(result.errors.iter().cloned());
        }
        cycle.batch_stats.push(BatchStats {
            batch_number,
            timestamp: Utc::now(),
            repositories: batch_len,
            successful,
            failed,
            prs,
            checks,
            api_calls: results.iter().map(|r| r.api_calls_used).sum(),
            cache_hits: results.iter().map(|r| r.cache_hits).sum(),
            processing_time_seconds: elapsed.as_secs_f64(),
        });

        info!(
            batch = batch_number,
            successful,
            failed,
            prs,
            checks,
            progress = format!("{:.1}%", cycle.progress_percentage()),
            "batch completed"
        );
    }

    /// Fold the synchronizer outcome into cycle accounting. A repository
    /// whose batch rolled back counts as failed even when its discovery
    /// succeeded. Returns the set of rolled-back repositories.
    async fn absorb_sync_outcome(
        &self,
        results: &[DiscoveryResult],
        sync_result: &SyncResult,
    ) -> HashSet<Uuid> {
        let failed_repos: HashSet<Uuid> = sync_result
            .errors
            .iter()
            .filter_map(|e| {
                e.context
                    .get("repository_id")
                    .and_then(|v| v.as_str())
                    .and_then(|s| Uuid::parse_str(s).ok())
            })
            .collect();

        let mut cycle = self.cycle.lock().await;
        cycle.errors.extend(sync_result.errors.iter().cloned());
        for repo_id in &failed_repos {
            let discovery_was_clean = results
                .iter()
                .any(|r| r.repository_id == *repo_id && r.errors.is_empty());
            if discovery_was_clean {
                cycle.repositories_successful = cycle.repositories_successful.saturating_sub(1);
                cycle.repositories_failed += 1;
            }
        }
        failed_repos
    }

    async fn publish_events(
        &self,
        results: &[DiscoveryResult],
        changes: &[StateChange],
        sync_result: &SyncResult,
        sync_failed_repos: &HashSet<Uuid>,
    ) {
        self.events.publish_discovery_complete(results).await;

        let resolved = sync_result.resolved_entities();
        for change in changes {
            if sync_failed_repos.contains(&change.repository_id) {
                continue;
            }
            if change.is_placeholder() {
                if let Some(id) = resolved.get(&(change.repository_id, change.external_id.as_str()))
                {
                    let mut rewritten = change.clone();
                    rewritten.entity_id = *id;
                    self.events.publish_state_change(&rewritten).await;
                    continue;
                }
            }
            self.events.publish_state_change(change).await;
        }

        for result in results {
            for pr in &result.discovered_prs {
                for check in &pr.check_runs {
                    if check.is_failed() {
                        self.events
                            .publish_failed_check(result.repository_id, pr.pr_number, check)
                            .await;
                    }
                }
            }
        }
    }

    async fn finish_cycle(&self, results: &[DiscoveryResult]) {
        let mut cycle = self.cycle.lock().await;
        cycle.ended_at = Some(Utc::now());

        let cache_hits: u64 = results.iter().map(|r| r.cache_hits as u64).sum();
        let cache_misses: u64 = results.iter().map(|r| r.cache_misses as u64).sum();
        let cycle_seconds = cycle.processing_time_seconds();

        self.rolling.lock().await.absorb_cycle(
            results.len(),
            cycle.prs_discovered,
            cycle.checks_discovered,
            cycle.errors.len(),
            cycle_seconds,
            cache_hits,
            cache_misses,
        );

        {
            let mut recent = self.recent_errors.lock().await;
            for error in &cycle.errors {
                recent.push_back(ErrorView {
                    kind: error.kind.as_str().to_string(),
                    message: error.message.clone(),
                    timestamp: error.timestamp,
                });
            }
            while recent.len() > RECENT_ERRORS_KEPT {
                recent.pop_front();
            }
        }

        *self.last_cycle_completed_at.lock().await = cycle.ended_at;

        info!(
            seconds = format!("{cycle_seconds:.2}"),
            successful = cycle.repositories_successful,
            failed = cycle.repositories_failed,
            total = cycle.repositories_total,
            prs = cycle.prs_discovered,
            checks = cycle.checks_discovered,
            state_changes = cycle.state_changes_detected,
            errors = cycle.errors.len(),
            "discovery cycle completed"
        );
    }

    /// Consistent point-in-time status snapshot.
    pub async fn status(&self) -> EngineStatus {
        let cycle = self.cycle.lock().await;
        let rolling = self.rolling.lock().await.clone();
        let recent = self.recent_errors.lock().await;
        let active = self.active_tasks.lock().await;

        let cutoff = Utc::now() - chrono::Duration::seconds(DEGRADED_WINDOW_SECS);
        let recent_error_count = recent.iter().filter(|e| e.timestamp >= cutoff).count();
        let status = if cycle.is_running() {
            "running"
        } else if recent_error_count > DEGRADED_ERROR_LIMIT {
            "degraded"
        } else {
            "healthy"
        };

        EngineStatus {
            status: status.to_string(),
            current_cycle: CycleView {
                is_running: cycle.is_running(),
                repositories_processed: cycle.repositories_processed,
                repositories_total: cycle.repositories_total,
                progress_percentage: cycle.progress_percentage(),
                prs_discovered: cycle.prs_discovered,
                checks_discovered: cycle.checks_discovered,
                state_changes_detected: cycle.state_changes_detected,
                processing_time_seconds: cycle.processing_time_seconds(),
                errors_count: cycle.errors.len(),
            },
            overall_metrics: rolling,
            rate_limits: self.rate.status().await,
            cache_stats: self.cache.stats(),
            concurrency: ConcurrencyView {
                max_concurrent: self.config.max_concurrent_repositories,
                available_slots: self.slots.available_permits(),
                active_tasks: active.len(),
                task_names: active.iter().cloned().collect(),
            },
            recent_errors: recent.iter().rev().take(5).rev().cloned().collect(),
            batch_stats: cycle
                .batch_stats
                .iter()
                .rev()
                .take(10)
                .rev()
                .cloned()
                .collect(),
            last_cycle_completed_at: *self.last_cycle_completed_at.lock().await,
        }
    }
}
