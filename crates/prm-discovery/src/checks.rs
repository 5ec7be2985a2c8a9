//! Check discoverer: per-commit check-run enumeration, batched by head SHA.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde_json::json;
use tracing::{debug, warn};

use prm_github::{GithubClient, Paginator};
use prm_schemas::{
    CacheStrategy, CheckBatchOutcome, CheckDiscovery, DiscoveredCheckRun, DiscoveredPr,
    DiscoveryError, DiscoveryErrorKind,
};

use crate::convert::convert_check;
use crate::url::parse_repository_url;

const DEFAULT_MAX_CONCURRENT: usize = 5;
const CHECK_CACHE_TTL: Duration = Duration::from_secs(300);

/// Outcome of enumerating one head SHA.
struct ShaFetch {
    checks: Vec<DiscoveredCheckRun>,
    api_calls: u32,
    cache_hit: bool,
}

/// GitHub-backed check-run discovery.
pub struct GithubCheckDiscoverer {
    client: Arc<GithubClient>,
    cache: Arc<dyn CacheStrategy>,
    max_concurrent: usize,
    per_page: usize,
}

impl GithubCheckDiscoverer {
    pub fn new(client: Arc<GithubClient>, cache: Arc<dyn CacheStrategy>) -> Self {
        Self {
            client,
            cache,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            per_page: 100,
        }
    }

    pub fn max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    fn cache_key(owner: &str, repo: &str, sha: &str) -> String {
        format!("checks:{owner}:{repo}:{sha}")
    }

    async fn fetch_sha(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
    ) -> Result<ShaFetch, DiscoveryError> {
        let cache_key = Self::cache_key(owner, repo, sha);
        if let Some(cached) = self.cache.get(&cache_key).await {
            if let Ok(checks) = serde_json::from_value::<Vec<DiscoveredCheckRun>>(cached) {
                debug!(owner, repo, sha, "check runs served from cache");
                return Ok(ShaFetch {
                    checks,
                    api_calls: 0,
                    cache_hit: true,
                });
            }
        }

        let mut pages = Paginator::new(
            self.client.as_ref(),
            format!("/repos/{owner}/{repo}/commits/{sha}/check-runs"),
        )
        .per_page(self.per_page)
        .items_key("check_runs");

        let mut checks: Vec<DiscoveredCheckRun> = Vec::new();
        loop {
            match pages.next_page().await {
                Ok(Some(items)) => {
                    for item in &items {
                        match convert_check(item) {
                            Ok(check) => checks.push(check),
                            Err(msg) => {
                                warn!(owner, repo, sha, error = %msg, "check conversion failed");
                            }
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    return Err(DiscoveryError::new(
                        DiscoveryErrorKind::GithubApiError,
                        format!("check enumeration failed for {owner}/{repo}@{sha}: {err}"),
                    )
                    .with_context(json!({"head_sha": sha})));
                }
            }
        }

        if let Ok(snapshot) = serde_json::to_value(&checks) {
            self.cache
                .set(&cache_key, snapshot, Some(CHECK_CACHE_TTL))
                .await;
        }

        Ok(ShaFetch {
            checks,
            api_calls: pages.api_calls(),
            cache_hit: false,
        })
    }
}

#[async_trait]
impl CheckDiscovery for GithubCheckDiscoverer {
    async fn discover_checks(
        &self,
        pr: &DiscoveredPr,
        repository_url: &str,
    ) -> Result<Vec<DiscoveredCheckRun>, DiscoveryError> {
        let (owner, repo) = parse_repository_url(repository_url).map_err(|e| {
            DiscoveryError::new(DiscoveryErrorKind::InvalidRepositoryUrl, e.to_string())
        })?;
        self.fetch_sha(&owner, &repo, &pr.head_sha)
            .await
            .map(|fetch| fetch.checks)
    }

    async fn batch_discover_checks(
        &self,
        prs: &[DiscoveredPr],
        repository_url: &str,
    ) -> CheckBatchOutcome {
        let mut outcome = CheckBatchOutcome::default();
        if prs.is_empty() {
            return outcome;
        }

        let (owner, repo) = match parse_repository_url(repository_url) {
            Ok(parsed) => parsed,
            Err(e) => {
                outcome.errors.push(DiscoveryError::new(
                    DiscoveryErrorKind::InvalidRepositoryUrl,
                    e.to_string(),
                ));
                return outcome;
            }
        };

        // One enumeration per unique head SHA; every PR sharing the SHA
        // reuses the result.
        let mut prs_by_sha: HashMap<String, Vec<i32>> = HashMap::new();
        for pr in prs {
            prs_by_sha
                .entry(pr.head_sha.clone())
                .or_default()
                .push(pr.pr_number);
        }
        debug!(
            repository_url,
            prs = prs.len(),
            unique_shas = prs_by_sha.len(),
            "batch check discovery"
        );

        let shas: Vec<String> = prs_by_sha.keys().cloned().collect();
        let fetches: Vec<(String, Result<ShaFetch, DiscoveryError>)> = stream::iter(shas)
            .map(|sha| {
                let owner = owner.clone();
                let repo = repo.clone();
                async move {
                    let fetched = self.fetch_sha(&owner, &repo, &sha).await;
                    (sha, fetched)
                }
            })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        for (sha, fetched) in fetches {
            let numbers = prs_by_sha.remove(&sha).unwrap_or_default();
            match fetched {
                Ok(fetch) => {
                    outcome.api_calls_used += fetch.api_calls;
                    if fetch.cache_hit {
                        outcome.cache_hits += 1;
                    } else {
                        outcome.cache_misses += 1;
                    }
                    for number in numbers {
                        outcome
                            .checks_by_pr
                            .insert(number, fetch.checks.clone());
                    }
                }
                Err(err) => {
                    // One SHA failing leaves the others intact; affected PRs
                    // report empty check lists.
                    for number in numbers {
                        outcome.checks_by_pr.insert(number, Vec::new());
                    }
                    outcome.errors.push(err);
                }
            }
        }

        outcome
    }
}
