//! Data factories producing realistic transient projections.

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use uuid::Uuid;

use prm_schemas::{
    CheckConclusion, CheckStatus, DiscoveredCheckRun, DiscoveredPr, DiscoveryResult, PrState,
    RepoStatus, RepositoryRecord, StoredPrState,
};

pub fn repository(url: &str) -> RepositoryRecord {
    RepositoryRecord {
        id: Uuid::new_v4(),
        url: url.to_string(),
        name: url.rsplit('/').next().unwrap_or("repo").to_string(),
        status: RepoStatus::Active,
        failure_count: 0,
        config_override: None,
        last_polled_at: None,
        polling_interval_minutes: 15,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn discovered_pr(number: i32, state: PrState, head_sha: &str) -> DiscoveredPr {
    DiscoveredPr {
        pr_number: number,
        title: format!("PR #{number}"),
        author: "octocat".into(),
        state,
        draft: false,
        base_branch: "main".into(),
        head_branch: format!("feature-{number}"),
        base_sha: "base0000".into(),
        head_sha: head_sha.into(),
        url: format!("https://github.com/test-org/repo-a/pull/{number}"),
        body: Some("body".into()),
        created_at: Utc::now() - ChronoDuration::days(1),
        updated_at: Utc::now() - ChronoDuration::hours(1),
        merged_at: None,
        metadata: json!({}),
        check_runs: vec![],
    }
}

pub fn discovered_check(
    external_id: &str,
    name: &str,
    conclusion: Option<CheckConclusion>,
) -> DiscoveredCheckRun {
    DiscoveredCheckRun {
        external_id: external_id.into(),
        name: name.into(),
        status: if conclusion.is_some() {
            CheckStatus::Completed
        } else {
            CheckStatus::InProgress
        },
        conclusion,
        started_at: Some(Utc::now() - ChronoDuration::minutes(10)),
        completed_at: conclusion.map(|_| Utc::now()),
        logs_url: None,
        details_url: None,
        output: json!({}),
    }
}

pub fn discovery_result(repository_id: Uuid, url: &str, prs: Vec<DiscoveredPr>) -> DiscoveryResult {
    DiscoveryResult {
        repository_id,
        repository_url: url.to_string(),
        discovered_prs: prs,
        discovered_at: Utc::now(),
        api_calls_used: 1,
        cache_hits: 0,
        cache_misses: 1,
        processing_time_ms: 5.0,
        errors: vec![],
    }
}

pub fn stored_pr(number: i32, state: PrState, head_sha: &str) -> StoredPrState {
    StoredPrState {
        id: Uuid::new_v4(),
        pr_number: number,
        state,
        head_sha: head_sha.into(),
        updated_at: Utc::now() - ChronoDuration::hours(1),
        check_runs: Default::default(),
    }
}
