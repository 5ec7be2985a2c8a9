//! prm-sync
//!
//! Transactional persistence of a cycle's discoveries. Each repository is
//! synchronized inside its own transaction: PR upserts, check-run upserts
//! and the repository's state-history rows commit together or not at all.
//! A failed repository rolls back and is recorded as an error; the rest of
//! the cycle proceeds.

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use prm_db::sync_ops::{
    existing_checks, existing_prs, insert_check, insert_pr, insert_state_history,
    is_unique_violation, update_check, update_pr, upsert_check, upsert_pr,
};
use prm_schemas::{
    ChangeKind, DataSynchronization, DiscoveryError, DiscoveryErrorKind, DiscoveryResult,
    EntityKind, PrState, StateChange, SyncResult, TriggerEvent,
};

const DEFAULT_BATCH_SIZE: usize = 100;

/// Postgres-backed synchronizer.
pub struct DatabaseSynchronizer {
    pool: PgPool,
    batch_size: usize,
}

/// Row tallies for one repository's sub-transaction.
#[derive(Debug, Default)]
struct Tally {
    prs_processed: u64,
    prs_created: u64,
    prs_updated: u64,
    checks_processed: u64,
    checks_created: u64,
    checks_updated: u64,
    history_rows: u64,
    /// `external_id -> row id`, for placeholder rewriting upstream.
    resolved_prs: Vec<(String, Uuid)>,
    resolved_checks: Vec<(String, Uuid)>,
}

impl DatabaseSynchronizer {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Map a PR-level change onto a history trigger.
    fn trigger_for(change: &StateChange, new_state: PrState) -> TriggerEvent {
        match change.kind {
            ChangeKind::Created => TriggerEvent::Opened,
            ChangeKind::StateChanged => match new_state {
                PrState::Closed | PrState::Merged => TriggerEvent::Closed,
                PrState::Opened => TriggerEvent::Reopened,
            },
            ChangeKind::Updated => {
                if change.metadata.get("change_type").and_then(|v| v.as_str())
                    == Some("head_sha_updated")
                {
                    TriggerEvent::Synchronize
                } else {
                    TriggerEvent::ManualCheck
                }
            }
            ChangeKind::Deleted => TriggerEvent::ManualCheck,
        }
    }

    async fn sync_repository(
        &self,
        result: &DiscoveryResult,
        changes: &[&StateChange],
    ) -> Result<Tally> {
        let repository_id = result.repository_id;
        let mut tally = Tally::default();
        let mut tx = self
            .pool
            .begin()
            .await
            .context("begin repository transaction failed")?;

        // Step 1: partition discovered PRs into create/update against the
        // existing (id, pr_number) rows.
        let numbers: Vec<i32> = result
            .discovered_prs
            .iter()
            .map(|pr| pr.pr_number)
            .collect();
        let mut id_by_number: HashMap<i32, Uuid> = existing_prs(&mut *tx, repository_id, &numbers)
            .await?
            .into_iter()
            .map(|(id, number)| (number, id))
            .collect();

        // Step 2: write PR rows, batched to bound statement bursts. New ids
        // become visible to the check pass through `id_by_number`.
        for batch in result.discovered_prs.chunks(self.batch_size) {
            for pr in batch {
                tally.prs_processed += 1;
                match id_by_number.get(&pr.pr_number).copied() {
                    Some(id) => {
                        update_pr(&mut *tx, id, pr)
                            .await
                            .with_context(|| format!("update pr #{}", pr.pr_number))?;
                        tally.prs_updated += 1;
                    }
                    None => {
                        let id = Uuid::new_v4();
                        match insert_pr(&mut *tx, id, repository_id, pr).await {
                            Ok(()) => {
                                id_by_number.insert(pr.pr_number, id);
                                tally.prs_created += 1;
                            }
                            Err(e) if is_unique_violation(&e) => {
                                // Lost a race with a concurrent writer:
                                // retry once as an upsert.
                                debug!(pr = pr.pr_number, "insert conflict, retrying as upsert");
                                let id = upsert_pr(&mut *tx, id, repository_id, pr)
                                    .await
                                    .with_context(|| {
                                        format!("upsert fallback for pr #{}", pr.pr_number)
                                    })?;
                                id_by_number.insert(pr.pr_number, id);
                                tally.prs_updated += 1;
                            }
                            Err(e) => {
                                return Err(anyhow!(e))
                                    .with_context(|| format!("insert pr #{}", pr.pr_number));
                            }
                        }
                    }
                }
            }
        }

        // Step 3: check runs, resolved against the now-visible PR ids.
        let mut pending_checks = Vec::new();
        for pr in &result.discovered_prs {
            let Some(pr_id) = id_by_number.get(&pr.pr_number).copied() else {
                continue;
            };
            for check in &pr.check_runs {
                pending_checks.push((pr.pr_number, pr_id, check));
            }
        }

        let external_ids: Vec<String> = pending_checks
            .iter()
            .map(|(_, _, check)| check.external_id.clone())
            .collect();
        let check_id_by_external: HashMap<String, Uuid> = existing_checks(&mut *tx, &external_ids)
            .await?
            .into_iter()
            .map(|(id, external_id)| (external_id, id))
            .collect();

        for batch in pending_checks.chunks(self.batch_size) {
            for (pr_number, pr_id, check) in batch {
                tally.checks_processed += 1;
                let change_key = format!("{pr_number}:{}", check.name);
                match check_id_by_external.get(&check.external_id).copied() {
                    Some(id) => {
                        update_check(&mut *tx, id, check)
                            .await
                            .with_context(|| format!("update check {}", check.external_id))?;
                        tally.checks_updated += 1;
                        tally.resolved_checks.push((change_key, id));
                    }
                    None => {
                        let id = Uuid::new_v4();
                        match insert_check(&mut *tx, id, *pr_id, check).await {
                            Ok(()) => {
                                tally.checks_created += 1;
                                tally.resolved_checks.push((change_key, id));
                            }
                            Err(e) if is_unique_violation(&e) => {
                                debug!(
                                    external_id = %check.external_id,
                                    "check insert conflict, retrying as upsert"
                                );
                                let id = upsert_check(&mut *tx, id, *pr_id, check)
                                    .await
                                    .with_context(|| {
                                        format!("upsert fallback for check {}", check.external_id)
                                    })?;
                                tally.checks_updated += 1;
                                tally.resolved_checks.push((change_key, id));
                            }
                            Err(e) => {
                                return Err(anyhow!(e)).with_context(|| {
                                    format!("insert check {}", check.external_id)
                                });
                            }
                        }
                    }
                }
            }
        }

        tally.resolved_prs = id_by_number
            .iter()
            .map(|(number, id)| (number.to_string(), *id))
            .collect();

        // Step 4: history rows. Only PR-level changes map onto the
        // state-history table; created-event placeholders resolve to the
        // ids inserted above.
        let state_by_number: HashMap<i32, PrState> = result
            .discovered_prs
            .iter()
            .map(|pr| (pr.pr_number, pr.state))
            .collect();

        for change in changes {
            if change.entity != EntityKind::PullRequest || change.kind == ChangeKind::Deleted {
                continue;
            }
            let Ok(pr_number) = change.external_id.parse::<i32>() else {
                continue;
            };
            let pr_id = if change.is_placeholder() {
                match id_by_number.get(&pr_number).copied() {
                    Some(id) => id,
                    None => continue,
                }
            } else {
                change.entity_id
            };

            let (old_state, new_state) = match change.kind {
                ChangeKind::Created => (None, PrState::parse(&change.new_state)?),
                ChangeKind::StateChanged => (
                    change
                        .old_state
                        .as_deref()
                        .map(PrState::parse)
                        .transpose()?,
                    PrState::parse(&change.new_state)?,
                ),
                // Head-SHA updates keep the PR state; the row records the
                // synchronize trigger with the state carried through.
                ChangeKind::Updated => match state_by_number.get(&pr_number).copied() {
                    Some(state) => (Some(state), state),
                    None => continue,
                },
                ChangeKind::Deleted => unreachable!("filtered above"),
            };

            insert_state_history(
                &mut tx,
                Uuid::new_v4(),
                pr_id,
                old_state,
                new_state,
                Self::trigger_for(change, new_state),
                &change.metadata,
            )
            .await
            .with_context(|| format!("history row for pr #{pr_number}"))?;
            tally.history_rows += 1;
        }

        tx.commit().await.context("commit repository transaction failed")?;
        Ok(tally)
    }
}

#[async_trait]
impl DataSynchronization for DatabaseSynchronizer {
    async fn synchronize(
        &self,
        results: &[DiscoveryResult],
        changes: &[StateChange],
    ) -> SyncResult {
        let started = std::time::Instant::now();
        let mut out = SyncResult::default();

        let mut changes_by_repo: HashMap<Uuid, Vec<&StateChange>> = HashMap::new();
        for change in changes {
            changes_by_repo
                .entry(change.repository_id)
                .or_default()
                .push(change);
        }

        for result in results {
            let repo_changes = changes_by_repo
                .remove(&result.repository_id)
                .unwrap_or_default();
            if result.discovered_prs.is_empty() && repo_changes.is_empty() {
                continue;
            }

            match self.sync_repository(result, &repo_changes).await {
                Ok(tally) => {
                    out.prs_processed += tally.prs_processed;
                    out.prs_created += tally.prs_created;
                    out.prs_updated += tally.prs_updated;
                    out.checks_processed += tally.checks_processed;
                    out.checks_created += tally.checks_created;
                    out.checks_updated += tally.checks_updated;
                    out.state_changes_recorded += tally.history_rows;
                    out.resolved_pr_ids.extend(
                        tally
                            .resolved_prs
                            .into_iter()
                            .map(|(external, id)| (result.repository_id, external, id)),
                    );
                    out.resolved_check_ids.extend(
                        tally
                            .resolved_checks
                            .into_iter()
                            .map(|(external, id)| (result.repository_id, external, id)),
                    );
                }
                Err(e) => {
                    warn!(
                        repository_id = %result.repository_id,
                        error = %e,
                        "repository batch rolled back"
                    );
                    out.errors.push(
                        DiscoveryError::new(
                            DiscoveryErrorKind::PrBatchSyncError,
                            format!("repository sync failed: {e:#}"),
                        )
                        .with_context(json!({
                            "repository_id": result.repository_id,
                            "repository_url": result.repository_url,
                        })),
                    );
                }
            }
        }

        out.processing_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        info!(
            prs_created = out.prs_created,
            prs_updated = out.prs_updated,
            checks_created = out.checks_created,
            checks_updated = out.checks_updated,
            history_rows = out.state_changes_recorded,
            errors = out.errors.len(),
            "synchronization finished"
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn change(kind: ChangeKind, new_state: &str, metadata: serde_json::Value) -> StateChange {
        StateChange {
            entity: EntityKind::PullRequest,
            entity_id: Uuid::nil(),
            repository_id: Uuid::new_v4(),
            external_id: "1".into(),
            old_state: None,
            new_state: new_state.into(),
            kind,
            metadata,
            detected_at: Utc::now(),
        }
    }

    #[test]
    fn trigger_mapping_follows_change_kind() {
        let created = change(ChangeKind::Created, "opened", json!({}));
        assert_eq!(
            DatabaseSynchronizer::trigger_for(&created, PrState::Opened),
            TriggerEvent::Opened
        );

        let closed = change(ChangeKind::StateChanged, "closed", json!({}));
        assert_eq!(
            DatabaseSynchronizer::trigger_for(&closed, PrState::Closed),
            TriggerEvent::Closed
        );
        assert_eq!(
            DatabaseSynchronizer::trigger_for(&closed, PrState::Merged),
            TriggerEvent::Closed
        );

        let reopened = change(ChangeKind::StateChanged, "opened", json!({}));
        assert_eq!(
            DatabaseSynchronizer::trigger_for(&reopened, PrState::Opened),
            TriggerEvent::Reopened
        );

        let force_push = change(
            ChangeKind::Updated,
            "new-sha",
            json!({"change_type": "head_sha_updated"}),
        );
        assert_eq!(
            DatabaseSynchronizer::trigger_for(&force_push, PrState::Opened),
            TriggerEvent::Synchronize
        );
    }

    #[test]
    fn updated_without_head_sha_falls_back_to_manual_check() {
        let tagged = change(
            ChangeKind::Updated,
            "2025-06-02T11:30:00Z",
            json!({"change_type": "metadata_updated"}),
        );
        assert_eq!(
            DatabaseSynchronizer::trigger_for(&tagged, PrState::Opened),
            TriggerEvent::ManualCheck
        );

        let untagged = change(ChangeKind::Updated, "something", json!({}));
        assert_eq!(
            DatabaseSynchronizer::trigger_for(&untagged, PrState::Opened),
            TriggerEvent::ManualCheck
        );
    }
}
