//! Shared fixtures for scanner / check-discoverer scenario tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex;
use uuid::Uuid;

use prm_schemas::{
    DiscoveredPr, PrState, RepoStatus, RepositoryDirectory, RepositoryRecord,
};

/// In-memory repository directory for tests.
#[derive(Default)]
pub struct StubDirectory {
    repos: Mutex<HashMap<Uuid, RepositoryRecord>>,
}

impl StubDirectory {
    pub fn with(repos: Vec<RepositoryRecord>) -> Arc<Self> {
        Arc::new(Self {
            repos: Mutex::new(repos.into_iter().map(|r| (r.id, r)).collect()),
        })
    }
}

#[async_trait]
impl RepositoryDirectory for StubDirectory {
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

pub fn repository(url: &str) -> RepositoryRecord {
    RepositoryRecord {
        id: Uuid::new_v4(),
        url: url.to_string(),
        name: "repo-a".into(),
        status: RepoStatus::Active,
        failure_count: 0,
        config_override: None,
        last_polled_at: None,
        polling_interval_minutes: 15,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn discovered_pr(number: i32, head_sha: &str) -> DiscoveredPr {
    DiscoveredPr {
        pr_number: number,
        title: format!("PR #{number}"),
        author: "octocat".into(),
        state: PrState::Opened,
        draft: false,
        base_branch: "main".into(),
        head_branch: format!("feature-{number}"),
        base_sha: "base0000".into(),
        head_sha: head_sha.into(),
        url: format!("https://github.com/test-org/repo-a/pull/{number}"),
        body: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        merged_at: None,
        metadata: json!({}),
        check_runs: vec![],
    }
}

/// A remote-shaped PR payload as the pulls endpoint returns it.
pub fn pr_payload(number: i32, state: &str, head_sha: &str) -> serde_json::Value {
    json!({
        "number": number,
        "id": 1000 + number,
        "title": format!("PR #{number}"),
        "user": {"login": "octocat"},
        "state": state,
        "draft": false,
        "base": {"ref": "main", "sha": "base0000"},
        "head": {"ref": format!("feature-{number}"), "sha": head_sha},
        "html_url": format!("https://github.com/test-org/repo-a/pull/{number}"),
        "body": "body",
        "created_at": "2025-06-01T10:00:00Z",
        "updated_at": "2025-06-02T10:00:00Z",
        "merged_at": null
    })
}

/// A remote-shaped check-run payload.
pub fn check_payload(id: i64, name: &str, conclusion: Option<&str>) -> serde_json::Value {
    json!({
        "id": id,
        "name": name,
        "status": if conclusion.is_some() { "completed" } else { "in_progress" },
        "conclusion": conclusion,
        "started_at": "2025-06-01T10:00:00Z",
        "completed_at": conclusion.map(|_| "2025-06-01T10:05:00Z"),
        "html_url": format!("https://github.com/test-org/repo-a/runs/{id}"),
        "details_url": format!("https://ci.example/build/{id}"),
        "output": {"title": "result", "summary": "summary"}
    })
}
