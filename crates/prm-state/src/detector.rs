//! Discovered-vs-stored diffing.
//!
//! Pure functions over one repository's `(DiscoveryResult, RepositoryState)`
//! pair. PR-level rules are mutually exclusive in order, so a PR yields at
//! most one PR-level emission per cycle; check-level rules are evaluated per
//! check name on top of that.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use prm_schemas::{
    ChangeKind, CheckConclusion, DiscoveredCheckRun, DiscoveredPr, DiscoveryResult, EntityKind,
    StateChange, StoredPrState, RepositoryState,
};

/// Discoveries at or above this size are treated as filtered/paginated, so
/// a stored PR missing from them is not presumed deleted.
const COMPREHENSIVE_SCAN_LIMIT: usize = 100;

/// Diff one discovery result against the stored snapshot. Returns only the
/// significant changes; insignificant emissions (pure metadata refreshes)
/// are generated and then dropped by the significance filter.
pub fn detect_changes(discovered: &DiscoveryResult, stored: &RepositoryState) -> Vec<StateChange> {
    let now = Utc::now();
    let repository_id = discovered.repository_id;
    let mut changes: Vec<StateChange> = Vec::new();

    for pr in &discovered.discovered_prs {
        let stored_pr = stored.pr_state(pr.pr_number);
        if let Some(change) = pr_change(repository_id, pr, stored_pr, now) {
            changes.push(change);
        }
        check_changes(repository_id, pr.pr_number, &pr.check_runs, stored_pr, now, &mut changes);
    }

    // A stored PR absent from a small (comprehensive-looking) discovery is
    // gone upstream; absence from a capped scan proves nothing.
    if discovered.discovered_prs.len() < COMPREHENSIVE_SCAN_LIMIT {
        let seen: HashSet<i32> = discovered
            .discovered_prs
            .iter()
            .map(|pr| pr.pr_number)
            .collect();
        for (number, stored_pr) in &stored.pull_requests {
            if !seen.contains(number) {
                changes.push(StateChange {
                    entity: EntityKind::PullRequest,
                    entity_id: stored_pr.id,
                    repository_id,
                    external_id: number.to_string(),
                    old_state: Some(stored_pr.state.as_str().to_string()),
                    new_state: "not_found".to_string(),
                    kind: ChangeKind::Deleted,
                    metadata: json!({
                        "pr_number": number,
                        "reason": "not_found_in_discovery",
                    }),
                    detected_at: now,
                });
            }
        }
    }

    changes.retain(is_significant);
    changes
}

/// At most one PR-level emission; the listed order decides which.
fn pr_change(
    repository_id: Uuid,
    pr: &DiscoveredPr,
    stored: Option<&StoredPrState>,
    now: DateTime<Utc>,
) -> Option<StateChange> {
    let Some(stored) = stored else {
        return Some(StateChange {
            entity: EntityKind::PullRequest,
            entity_id: Uuid::nil(),
            repository_id,
            external_id: pr.pr_number.to_string(),
            old_state: None,
            new_state: pr.state.as_str().to_string(),
            kind: ChangeKind::Created,
            metadata: json!({
                "pr_number": pr.pr_number,
                "title": pr.title,
                "author": pr.author,
                "head_sha": pr.head_sha,
                "draft": pr.draft,
            }),
            detected_at: now,
        });
    };

    if pr.state != stored.state {
        return Some(StateChange {
            entity: EntityKind::PullRequest,
            entity_id: stored.id,
            repository_id,
            external_id: pr.pr_number.to_string(),
            old_state: Some(stored.state.as_str().to_string()),
            new_state: pr.state.as_str().to_string(),
            kind: ChangeKind::StateChanged,
            metadata: json!({
                "pr_number": pr.pr_number,
                "title": pr.title,
                "head_sha": pr.head_sha,
            }),
            detected_at: now,
        });
    }

    if pr.head_sha != stored.head_sha {
        return Some(StateChange {
            entity: EntityKind::PullRequest,
            entity_id: stored.id,
            repository_id,
            external_id: pr.pr_number.to_string(),
            old_state: Some(stored.head_sha.clone()),
            new_state: pr.head_sha.clone(),
            kind: ChangeKind::Updated,
            metadata: json!({
                "pr_number": pr.pr_number,
                "title": pr.title,
                "change_type": "head_sha_updated",
                "old_sha": stored.head_sha,
                "new_sha": pr.head_sha,
            }),
            detected_at: now,
        });
    }

    if pr.updated_at > stored.updated_at {
        return Some(StateChange {
            entity: EntityKind::PullRequest,
            entity_id: stored.id,
            repository_id,
            external_id: pr.pr_number.to_string(),
            old_state: Some(stored.updated_at.to_rfc3339()),
            new_state: pr.updated_at.to_rfc3339(),
            kind: ChangeKind::Updated,
            metadata: json!({
                "pr_number": pr.pr_number,
                "title": pr.title,
                "change_type": "metadata_updated",
            }),
            detected_at: now,
        });
    }

    None
}

fn conclusion_label(conclusion: Option<CheckConclusion>) -> String {
    conclusion
        .map(|c| c.as_str().to_string())
        .unwrap_or_else(|| "running".to_string())
}

fn check_changes(
    repository_id: Uuid,
    pr_number: i32,
    discovered: &[DiscoveredCheckRun],
    stored: Option<&StoredPrState>,
    now: DateTime<Utc>,
    out: &mut Vec<StateChange>,
) {
    let empty = std::collections::BTreeMap::new();
    let stored_checks = stored.map(|s| &s.check_runs).unwrap_or(&empty);

    let mut seen: HashSet<&str> = HashSet::new();
    for check in discovered {
        seen.insert(check.name.as_str());
        match stored_checks.get(&check.name) {
            None => out.push(StateChange {
                entity: EntityKind::CheckRun,
                entity_id: Uuid::nil(),
                repository_id,
                external_id: format!("{pr_number}:{}", check.name),
                old_state: None,
                new_state: conclusion_label(check.conclusion),
                kind: ChangeKind::Created,
                metadata: json!({
                    "pr_number": pr_number,
                    "check_name": check.name,
                    "conclusion": check.conclusion,
                }),
                detected_at: now,
            }),
            Some(&old) if old != check.conclusion => {
                // A terminal conclusion is a state change; losing one
                // (a re-run back to in-progress) is only an update.
                let kind = if check.conclusion.is_some() {
                    ChangeKind::StateChanged
                } else {
                    ChangeKind::Updated
                };
                out.push(StateChange {
                    entity: EntityKind::CheckRun,
                    entity_id: Uuid::nil(),
                    repository_id,
                    external_id: format!("{pr_number}:{}", check.name),
                    old_state: Some(conclusion_label(old)),
                    new_state: conclusion_label(check.conclusion),
                    kind,
                    metadata: json!({
                        "pr_number": pr_number,
                        "check_name": check.name,
                        "old_conclusion": old,
                        "new_conclusion": check.conclusion,
                        "is_failure": check.conclusion == Some(CheckConclusion::Failure),
                    }),
                    detected_at: now,
                });
            }
            Some(_) => {}
        }
    }

    for (name, old) in stored_checks {
        if !seen.contains(name.as_str()) {
            out.push(StateChange {
                entity: EntityKind::CheckRun,
                entity_id: Uuid::nil(),
                repository_id,
                external_id: format!("{pr_number}:{name}"),
                old_state: Some(conclusion_label(*old)),
                new_state: "deleted".to_string(),
                kind: ChangeKind::Deleted,
                metadata: json!({"pr_number": pr_number, "check_name": name}),
                detected_at: now,
            });
        }
    }
}

/// Significance filter: what earns persistence and publication.
fn is_significant(change: &StateChange) -> bool {
    match change.kind {
        ChangeKind::Created | ChangeKind::Deleted => true,
        ChangeKind::StateChanged => true,
        ChangeKind::Updated => {
            if change.entity == EntityKind::CheckRun && change.new_state == "failure" {
                return true;
            }
            change
                .metadata
                .get("change_type")
                .and_then(|v| v.as_str())
                .map(|t| t != "metadata_updated")
                .unwrap_or(true)
        }
    }
}

/// Aggregate counts over a set of changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub total: usize,
    pub pr_changes: usize,
    pub check_changes: usize,
    pub created: usize,
    pub updated: usize,
    pub state_changed: usize,
    pub deleted: usize,
    pub failed_checks: usize,
}

pub fn change_summary(changes: &[StateChange]) -> ChangeSummary {
    let mut summary = ChangeSummary {
        total: changes.len(),
        ..Default::default()
    };
    for change in changes {
        match change.entity {
            EntityKind::PullRequest => summary.pr_changes += 1,
            EntityKind::CheckRun => {
                summary.check_changes += 1;
                if change.new_state == "failure" {
                    summary.failed_checks += 1;
                }
            }
        }
        match change.kind {
            ChangeKind::Created => summary.created += 1,
            ChangeKind::Updated => summary.updated += 1,
            ChangeKind::StateChanged => summary.state_changed += 1,
            ChangeKind::Deleted => summary.deleted += 1,
        }
    }
    summary
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
