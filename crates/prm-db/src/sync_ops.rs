//! Row-level write helpers composed by the synchronizer.
//!
//! Every function takes `&mut PgConnection` so callers decide the
//! transaction boundary; nothing here commits.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use prm_schemas::{DiscoveredCheckRun, DiscoveredPr, PrState, TriggerEvent};

/// Postgres unique-violation SQLSTATE.
const UNIQUE_VIOLATION: &str = "23505";

/// Whether an sqlx error is a duplicate-key constraint violation.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code == UNIQUE_VIOLATION)
        .unwrap_or(false)
}

/// Existing `(id, pr_number)` pairs among `numbers` for one repository.
pub async fn existing_prs(
    conn: &mut PgConnection,
    repository_id: Uuid,
    numbers: &[i32],
) -> Result<Vec<(Uuid, i32)>> {
    if numbers.is_empty() {
        return Ok(Vec::new());
    }
    let rows = sqlx::query(
        r#"
        select id, pr_number
        from pull_requests
        where repository_id = $1 and pr_number = any($2)
        "#,
    )
    .bind(repository_id)
    .bind(numbers)
    .fetch_all(conn)
    .await
    .context("existing_prs query failed")?;

    rows.iter()
        .map(|row| Ok((row.try_get("id")?, row.try_get("pr_number")?)))
        .collect()
}

pub async fn insert_pr(
    conn: &mut PgConnection,
    id: Uuid,
    repository_id: Uuid,
    pr: &DiscoveredPr,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        insert into pull_requests (
          id, repository_id, pr_number, title, author, state, draft,
          base_branch, head_branch, base_sha, head_sha, url, body, metadata,
          last_checked_at, created_at, updated_at
        ) values (
          $1, $2, $3, $4, $5, $6::pr_state, $7,
          $8, $9, $10, $11, $12, $13, $14,
          now(), $15, $16
        )
        "#,
    )
    .bind(id)
    .bind(repository_id)
    .bind(pr.pr_number)
    .bind(&pr.title)
    .bind(&pr.author)
    .bind(pr.state.as_str())
    .bind(pr.draft)
    .bind(&pr.base_branch)
    .bind(&pr.head_branch)
    .bind(&pr.base_sha)
    .bind(&pr.head_sha)
    .bind(&pr.url)
    .bind(&pr.body)
    .bind(&pr.metadata)
    .bind(pr.created_at)
    .bind(pr.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn update_pr(
    conn: &mut PgConnection,
    id: Uuid,
    pr: &DiscoveredPr,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        update pull_requests set
          title = $2, author = $3, state = $4::pr_state, draft = $5,
          base_branch = $6, head_branch = $7, base_sha = $8, head_sha = $9,
          url = $10, body = $11, metadata = $12,
          last_checked_at = now(), updated_at = $13
        where id = $1
        "#,
    )
    .bind(id)
    .bind(&pr.title)
    .bind(&pr.author)
    .bind(pr.state.as_str())
    .bind(pr.draft)
    .bind(&pr.base_branch)
    .bind(&pr.head_branch)
    .bind(&pr.base_sha)
    .bind(&pr.head_sha)
    .bind(&pr.url)
    .bind(&pr.body)
    .bind(&pr.metadata)
    .bind(pr.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

/// Duplicate-safe fall-back used when a plain insert loses a race: writes
/// the row and returns the surviving id.
pub async fn upsert_pr(
    conn: &mut PgConnection,
    id: Uuid,
    repository_id: Uuid,
    pr: &DiscoveredPr,
) -> std::result::Result<Uuid, sqlx::Error> {
    let row = sqlx::query(
        r#"
        insert into pull_requests (
          id, repository_id, pr_number, title, author, state, draft,
          base_branch, head_branch, base_sha, head_sha, url, body, metadata,
          last_checked_at, created_at, updated_at
        ) values (
          $1, $2, $3, $4, $5, $6::pr_state, $7,
          $8, $9, $10, $11, $12, $13, $14,
          now(), $15, $16
        )
        on conflict (repository_id, pr_number) do update set
          title = excluded.title,
          author = excluded.author,
          state = excluded.state,
          draft = excluded.draft,
          base_branch = excluded.base_branch,
          head_branch = excluded.head_branch,
          base_sha = excluded.base_sha,
          head_sha = excluded.head_sha,
          url = excluded.url,
          body = excluded.body,
          metadata = excluded.metadata,
          last_checked_at = now(),
          updated_at = excluded.updated_at
        returning id
        "#,
    )
    .bind(id)
    .bind(repository_id)
    .bind(pr.pr_number)
    .bind(&pr.title)
    .bind(&pr.author)
    .bind(pr.state.as_str())
    .bind(pr.draft)
    .bind(&pr.base_branch)
    .bind(&pr.head_branch)
    .bind(&pr.base_sha)
    .bind(&pr.head_sha)
    .bind(&pr.url)
    .bind(&pr.body)
    .bind(&pr.metadata)
    .bind(pr.created_at)
    .bind(pr.updated_at)
    .fetch_one(conn)
    .await?;
    row.try_get("id")
}

/// Existing `(id, external_id)` pairs among the given external ids.
pub async fn existing_checks(
    conn: &mut PgConnection,
    external_ids: &[String],
) -> Result<Vec<(Uuid, String)>> {
    if external_ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows = sqlx::query(
        r#"
        select id, external_id
        from check_runs
        where external_id = any($1)
        "#,
    )
    .bind(external_ids)
    .fetch_all(conn)
    .await
    .context("existing_checks query failed")?;

    rows.iter()
        .map(|row| Ok((row.try_get("id")?, row.try_get("external_id")?)))
        .collect()
}

pub async fn insert_check(
    conn: &mut PgConnection,
    id: Uuid,
    pr_id: Uuid,
    check: &DiscoveredCheckRun,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        insert into check_runs (
          id, pr_id, external_id, check_name, status, conclusion,
          logs_url, details_url, metadata, started_at, completed_at
        ) values (
          $1, $2, $3, $4, $5::check_status, $6::check_conclusion,
          $7, $8, $9, $10, $11
        )
        "#,
    )
    .bind(id)
    .bind(pr_id)
    .bind(&check.external_id)
    .bind(&check.name)
    .bind(check.status.as_str())
    .bind(check.conclusion.map(|c| c.as_str()))
    .bind(&check.logs_url)
    .bind(&check.details_url)
    .bind(&check.output)
    .bind(check.started_at)
    .bind(check.completed_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn update_check(
    conn: &mut PgConnection,
    id: Uuid,
    check: &DiscoveredCheckRun,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        update check_runs set
          check_name = $2, status = $3::check_status,
          conclusion = $4::check_conclusion, logs_url = $5, details_url = $6,
          metadata = $7, started_at = $8, completed_at = $9, updated_at = now()
        where id = $1
        "#,
    )
    .bind(id)
    .bind(&check.name)
    .bind(check.status.as_str())
    .bind(check.conclusion.map(|c| c.as_str()))
    .bind(&check.logs_url)
    .bind(&check.details_url)
    .bind(&check.output)
    .bind(check.started_at)
    .bind(check.completed_at)
    .execute(conn)
    .await?;
    Ok(())
}

/// Duplicate-safe fall-back keyed on `external_id`.
pub async fn upsert_check(
    conn: &mut PgConnection,
    id: Uuid,
    pr_id: Uuid,
    check: &DiscoveredCheckRun,
) -> std::result::Result<Uuid, sqlx::Error> {
    let row = sqlx::query(
        r#"
        insert into check_runs (
          id, pr_id, external_id, check_name, status, conclusion,
          logs_url, details_url, metadata, started_at, completed_at
        ) values (
          $1, $2, $3, $4, $5::check_status, $6::check_conclusion,
          $7, $8, $9, $10, $11
        )
        on conflict (external_id) do update set
          check_name = excluded.check_name,
          status = excluded.status,
          conclusion = excluded.conclusion,
          logs_url = excluded.logs_url,
          details_url = excluded.details_url,
          metadata = excluded.metadata,
          started_at = excluded.started_at,
          completed_at = excluded.completed_at,
          updated_at = now()
        returning id
        "#,
    )
    .bind(id)
    .bind(pr_id)
    .bind(&check.external_id)
    .bind(&check.name)
    .bind(check.status.as_str())
    .bind(check.conclusion.map(|c| c.as_str()))
    .bind(&check.logs_url)
    .bind(&check.details_url)
    .bind(&check.output)
    .bind(check.started_at)
    .bind(check.completed_at)
    .fetch_one(conn)
    .await?;
    row.try_get("id")
}

/// Append one immutable state-history row.
pub async fn insert_state_history(
    conn: &mut PgConnection,
    id: Uuid,
    pr_id: Uuid,
    old_state: Option<PrState>,
    new_state: PrState,
    trigger: TriggerEvent,
    metadata: &Value,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        insert into pr_state_history (
          id, pr_id, old_state, new_state, trigger_event, metadata
        ) values ($1, $2, $3::pr_state, $4::pr_state, $5::trigger_event, $6)
        "#,
    )
    .bind(id)
    .bind(pr_id)
    .bind(old_state.map(|s| s.as_str()))
    .bind(new_state.as_str())
    .bind(trigger.as_str())
    .bind(metadata)
    .execute(conn)
    .await?;
    Ok(())
}
