//! Repository table queries and the directory used by the engine.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use prm_schemas::{RepoStatus, RepositoryDirectory, RepositoryRecord};

fn record_from_row(row: &PgRow) -> Result<RepositoryRecord> {
    let status: String = row.try_get("status")?;
    Ok(RepositoryRecord {
        id: row.try_get("id")?,
        url: row.try_get("url")?,
        name: row.try_get("name")?,
        status: RepoStatus::parse(&status)?,
        failure_count: row.try_get("failure_count")?,
        config_override: row.try_get::<Option<Value>, _>("config_override")?,
        last_polled_at: row.try_get::<Option<DateTime<Utc>>, _>("last_polled_at")?,
        polling_interval_minutes: row.try_get("polling_interval_minutes")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const SELECT_COLUMNS: &str = r#"
    id, url, name, status::text as status, failure_count, config_override,
    last_polled_at, polling_interval_minutes, created_at, updated_at
"#;

pub async fn get_repository(pool: &PgPool, id: Uuid) -> Result<Option<RepositoryRecord>> {
    let row = sqlx::query(&format!(
        "select {SELECT_COLUMNS} from repositories where id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("get_repository failed")?;

    row.as_ref().map(record_from_row).transpose()
}

/// Active repositories whose poll deadline has elapsed (or that were never
/// polled).
pub async fn repositories_needing_poll(pool: &PgPool) -> Result<Vec<RepositoryRecord>> {
    let rows = sqlx::query(&format!(
        r#"
        select {SELECT_COLUMNS}
        from repositories
        where status = 'active'
          and (
            last_polled_at is null
            or last_polled_at + make_interval(mins => polling_interval_minutes) < now()
          )
        order by last_polled_at nulls first
        "#
    ))
    .fetch_all(pool)
    .await
    .context("repositories_needing_poll failed")?;

    rows.iter().map(record_from_row).collect()
}

pub async fn update_last_polled(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query(
        "update repositories set last_polled_at = now(), updated_at = now() where id = $1",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("update_last_polled failed")?;
    Ok(())
}

pub async fn reset_failure_count(pool: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query(
        "update repositories set failure_count = 0, updated_at = now() where id = $1",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("reset_failure_count failed")?;
    Ok(())
}

pub async fn increment_failure_count(pool: &PgPool, id: Uuid, message: &str) -> Result<()> {
    debug!(repository_id = %id, message, "recording repository failure");
    sqlx::query(
        "update repositories set failure_count = failure_count + 1, updated_at = now() where id = $1",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("increment_failure_count failed")?;
    Ok(())
}

/// Insert helper for admin tooling and integration tests.
pub async fn insert_repository(pool: &PgPool, repo: &RepositoryRecord) -> Result<()> {
    sqlx::query(
        r#"
        insert into repositories (
          id, url, name, status, failure_count, config_override,
          last_polled_at, polling_interval_minutes
        ) values ($1, $2, $3, $4::repository_status, $5, $6, $7, $8)
        "#,
    )
    .bind(repo.id)
    .bind(&repo.url)
    .bind(&repo.name)
    .bind(repo.status.as_str())
    .bind(repo.failure_count)
    .bind(&repo.config_override)
    .bind(repo.last_polled_at)
    .bind(repo.polling_interval_minutes)
    .execute(pool)
    .await
    .context("insert_repository failed")?;
    Ok(())
}

/// Pool-backed [`RepositoryDirectory`].
#[derive(Clone)]
pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RepositoryDirectory for PgDirectory {
    async fn get(&self, id: Uuid) -> Result<Option<RepositoryRecord>> {
        get_repository(&self.pool, id).await
    }

    async fn mark_polled(&self, id: Uuid) -> Result<()> {
        update_last_polled(&self.pool, id).await
    }

    async fn reset_failures(&self, id: Uuid) -> Result<()> {
        reset_failure_count(&self.pool, id).await
    }

    async fn record_failure(&self, id: Uuid, message: &str) -> Result<()> {
        increment_failure_count(&self.pool, id, message).await
    }
}
