//! Stored-state loading: one repository's PRs plus the latest check run per
//! (PR, check name), shaped for the change detector.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use prm_schemas::{CheckConclusion, PrState, RepositoryState, StoredPrState};

/// Load the diffable snapshot for one repository. "Latest" check per
/// (PR, name) is decided by `updated_at`.
pub async fn load_repository_state(pool: &PgPool, repository_id: Uuid) -> Result<RepositoryState> {
    let pr_rows = sqlx::query(
        r#"
        select id, pr_number, state::text as state, head_sha, updated_at
        from pull_requests
        where repository_id = $1
        "#,
    )
    .bind(repository_id)
    .fetch_all(pool)
    .await
    .context("state pr query failed")?;

    let mut pull_requests: BTreeMap<i32, StoredPrState> = BTreeMap::new();
    let mut pr_ids: Vec<Uuid> = Vec::with_capacity(pr_rows.len());

    for row in &pr_rows {
        let id: Uuid = row.try_get("id")?;
        let pr_number: i32 = row.try_get("pr_number")?;
        let state: String = row.try_get("state")?;
        pr_ids.push(id);
        pull_requests.insert(
            pr_number,
            StoredPrState {
                id,
                pr_number,
                state: PrState::parse(&state)?,
                head_sha: row.try_get("head_sha")?,
                updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
                check_runs: BTreeMap::new(),
            },
        );
    }

    if !pr_ids.is_empty() {
        let check_rows = sqlx::query(
            r#"
            select distinct on (pr_id, check_name)
                pr_id, check_name, conclusion::text as conclusion
            from check_runs
            where pr_id = any($1)
            order by pr_id, check_name, updated_at desc
            "#,
        )
        .bind(&pr_ids)
        .fetch_all(pool)
        .await
        .context("state check query failed")?;

        // pr_id -> pr_number for attachment.
        let by_id: std::collections::HashMap<Uuid, i32> = pull_requests
            .values()
            .map(|pr| (pr.id, pr.pr_number))
            .collect();

        for row in &check_rows {
            let pr_id: Uuid = row.try_get("pr_id")?;
            let name: String = row.try_get("check_name")?;
            let conclusion: Option<String> = row.try_get("conclusion")?;
            let conclusion = conclusion
                .as_deref()
                .map(CheckConclusion::parse)
                .transpose()?;
            if let Some(number) = by_id.get(&pr_id) {
                if let Some(pr) = pull_requests.get_mut(number) {
                    pr.check_runs.insert(name, conclusion);
                }
            }
        }
    }

    Ok(RepositoryState {
        repository_id,
        pull_requests,
        loaded_at: Utc::now(),
    })
}
