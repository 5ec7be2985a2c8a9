//! Repository scanner: paginated PR enumeration with conditional requests
//! and priority resolution.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use prm_github::{GithubClient, GithubError, Paginator};
use prm_schemas::{
    CacheStrategy, DiscoveredPr, DiscoveryError, DiscoveryErrorKind, DiscoveryResult, PrDiscovery,
    Priority, RateLimitStrategy, RepositoryDirectory, RepositoryRecord,
};

use crate::convert::convert_pr;
use crate::url::parse_repository_url;

const DEFAULT_MAX_PAGES: u32 = 10;
const DEFAULT_PER_PAGE: usize = 100;
const SCAN_CACHE_TTL: Duration = Duration::from_secs(300);

/// GitHub-backed PR discovery.
pub struct GithubRepositoryScanner {
    client: Arc<GithubClient>,
    directory: Arc<dyn RepositoryDirectory>,
    cache: Arc<dyn CacheStrategy>,
    rate: Arc<dyn RateLimitStrategy>,
    max_pages: u32,
    per_page: usize,
    use_etag_caching: bool,
}

impl GithubRepositoryScanner {
    pub fn new(
        client: Arc<GithubClient>,
        directory: Arc<dyn RepositoryDirectory>,
        cache: Arc<dyn CacheStrategy>,
        rate: Arc<dyn RateLimitStrategy>,
    ) -> Self {
        Self {
            client,
            directory,
            cache,
            rate,
            max_pages: DEFAULT_MAX_PAGES,
            per_page: DEFAULT_PER_PAGE,
            use_etag_caching: true,
        }
    }

    pub fn max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn per_page(mut self, per_page: usize) -> Self {
        self.per_page = per_page.min(100);
        self
    }

    pub fn use_etag_caching(mut self, enabled: bool) -> Self {
        self.use_etag_caching = enabled;
        self
    }

    fn cache_key(owner: &str, repo: &str) -> String {
        format!("prs:{owner}:{repo}:all")
    }

    /// Discovery stats for one repository: ownership, poll bookkeeping,
    /// resolved priority and cache/ETag presence.
    pub async fn repository_stats(&self, repository_id: Uuid) -> serde_json::Value {
        let repo = match self.directory.get(repository_id).await {
            Ok(Some(repo)) => repo,
            Ok(None) => return json!({}),
            Err(e) => return json!({"error": e.to_string()}),
        };
        let parsed = parse_repository_url(&repo.url);
        let (cached, etag) = match &parsed {
            Ok((owner, name)) => {
                self.cache
                    .get_with_etag(&Self::cache_key(owner, name))
                    .await
            }
            Err(_) => (None, None),
        };
        json!({
            "repository_id": repository_id,
            "owner": parsed.as_ref().map(|(o, _)| o.clone()).unwrap_or_default(),
            "repo": parsed.as_ref().map(|(_, r)| r.clone()).unwrap_or_default(),
            "last_polled_at": repo.last_polled_at,
            "failure_count": repo.failure_count,
            "polling_interval_minutes": repo.polling_interval_minutes,
            "priority": self.priority(repository_id).await.as_str(),
            "cached_data_available": cached.is_some(),
            "cache_etag": etag,
        })
    }

    fn resolve_priority(repo: &RepositoryRecord, now: DateTime<Utc>) -> Priority {
        if let Some(p) = priority_override(repo) {
            return p;
        }
        if repo.failure_count > 3 {
            return Priority::Critical;
        }
        if repo.failure_count > 1 {
            return Priority::High;
        }
        match repo.last_polled_at {
            None => return Priority::High,
            Some(last) => {
                let idle = (now - last).num_seconds();
                if idle > 3600 {
                    return Priority::High;
                }
                if idle > 1800 {
                    return Priority::Normal;
                }
            }
        }
        if repo.polling_interval_minutes <= 5 {
            return Priority::High;
        }
        if repo.polling_interval_minutes <= 15 {
            return Priority::Normal;
        }
        Priority::Low
    }
}

/// Explicit override from the repository's config bag. Accepts either the
/// priority name or its numeric rank.
fn priority_override(repo: &RepositoryRecord) -> Option<Priority> {
    let value = repo.config_override.as_ref()?.get("discovery_priority")?;
    if let Some(name) = value.as_str() {
        return Priority::parse(name).ok();
    }
    match value.as_u64()? {
        1 => Some(Priority::Critical),
        2 => Some(Priority::High),
        3 => Some(Priority::Normal),
        4 => Some(Priority::Low),
        _ => None,
    }
}

fn map_github_error(err: GithubError, owner: &str, repo: &str, url: &str) -> DiscoveryError {
    match err {
        GithubError::NotFound => DiscoveryError::new(
            DiscoveryErrorKind::RepositoryNotFound,
            format!("repository not found: {owner}/{repo}"),
        )
        .with_context(json!({"repository_url": url})),
        GithubError::Authentication { status } => DiscoveryError::new(
            DiscoveryErrorKind::AuthenticationError,
            format!("authentication failed for {owner}/{repo} (status={status})"),
        )
        .with_context(json!({"repository_url": url, "status_code": status})),
        GithubError::RateLimited { reset_at, remaining } => DiscoveryError::new(
            DiscoveryErrorKind::RateLimitExceeded,
            format!("rate limit exceeded for {owner}/{repo}"),
        )
        .with_context(json!({
            "repository_url": url,
            "reset_time": reset_at,
            "remaining": remaining,
        })),
        GithubError::Api { status, message } => DiscoveryError::new(
            DiscoveryErrorKind::GithubApiError,
            format!("remote api error for {owner}/{repo}: {message}"),
        )
        .with_context(json!({"repository_url": url, "status_code": status})),
        GithubError::Transport(msg) | GithubError::Decode(msg) => DiscoveryError::new(
            DiscoveryErrorKind::GithubApiError,
            format!("remote error for {owner}/{repo}: {msg}"),
        )
        .with_context(json!({"repository_url": url})),
    }
}

#[async_trait]
impl PrDiscovery for GithubRepositoryScanner {
    async fn discover_prs(
        &self,
        repository_id: Uuid,
        repository_url: &str,
        since: Option<DateTime<Utc>>,
        max_prs: Option<usize>,
    ) -> DiscoveryResult {
        let started = std::time::Instant::now();
        let mut errors: Vec<DiscoveryError> = Vec::new();
        let mut discovered: Vec<DiscoveredPr> = Vec::new();
        let mut api_calls_used = 0u32;
        let mut cache_hits = 0u32;
        let mut cache_misses = 0u32;

        match parse_repository_url(repository_url) {
            Err(e) => {
                errors.push(
                    DiscoveryError::new(DiscoveryErrorKind::InvalidRepositoryUrl, e.to_string())
                        .with_context(json!({"repository_url": repository_url})),
                );
            }
            Ok((owner, repo)) => {
                let cache_key = Self::cache_key(&owner, &repo);
                let (cached, etag) = if self.use_etag_caching {
                    self.cache.get_with_etag(&cache_key).await
                } else {
                    (None, None)
                };

                let mut query = vec![
                    ("state".to_string(), "all".to_string()),
                    ("sort".to_string(), "updated".to_string()),
                    ("direction".to_string(), "desc".to_string()),
                ];
                if let Some(since) = since {
                    query.push(("since".to_string(), since.to_rfc3339()));
                }

                let mut pages = Paginator::new(self.client.as_ref(), format!("/repos/{owner}/{repo}/pulls"))
                    .query(query)
                    .per_page(self.per_page)
                    .max_pages(self.max_pages)
                    .conditional(etag);

                let mut remote_failed = false;
                'pages: loop {
                    match pages.next_page().await {
                        Ok(Some(items)) => {
                            for item in &items {
                                if let Some(cap) = max_prs {
                                    if discovered.len() >= cap {
                                        break 'pages;
                                    }
                                }
                                match convert_pr(item) {
                                    Ok(pr) => discovered.push(pr),
                                    Err(msg) => {
                                        let number = item.get("number").cloned();
                                        warn!(%repository_url, error = %msg, "pr conversion failed");
                                        errors.push(
                                            DiscoveryError::new(
                                                DiscoveryErrorKind::PrConversionError,
                                                format!("failed to convert pr: {msg}"),
                                            )
                                            .with_context(json!({"pr_number": number})),
                                        );
                                    }
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            errors.push(map_github_error(err, &owner, &repo, repository_url));
                            remote_failed = true;
                            break;
                        }
                    }
                }

                api_calls_used = pages.api_calls();
                if let Some(rate) = pages.last_rate() {
                    self.rate
                        .update_limits("core", rate.limit, rate.remaining, rate.reset_at)
                        .await;
                }

                if pages.was_not_modified() {
                    // 304 covers the whole listing: reuse the cached snapshot.
                    cache_hits += 1;
                    match cached.and_then(|v| serde_json::from_value::<Vec<DiscoveredPr>>(v).ok()) {
                        Some(prior) => {
                            debug!(owner, repo, prs = prior.len(), "scan served from etag cache");
                            discovered = prior;
                        }
                        None => {
                            // Etag survived the value; force a clean refetch
                            // next cycle.
                            self.cache.invalidate(&cache_key).await;
                        }
                    }
                } else if !remote_failed {
                    // Any remote success is cached, an empty listing
                    // included, so the next cycle can go conditional.
                    cache_misses += 1;
                    let tag = pages
                        .last_etag()
                        .map(String::from)
                        .unwrap_or_else(|| format!("scan-{}", Utc::now().timestamp()));
                    match serde_json::to_value(&discovered) {
                        Ok(snapshot) => {
                            self.cache
                                .set_with_etag(&cache_key, snapshot, &tag, Some(SCAN_CACHE_TTL))
                                .await;
                        }
                        Err(e) => debug!(error = %e, "snapshot serialize failed"),
                    }
                }

                info!(
                    owner,
                    repo,
                    prs = discovered.len(),
                    api_calls = api_calls_used,
                    errors = errors.len(),
                    "pr discovery finished"
                );
            }
        }

        DiscoveryResult {
            repository_id,
            repository_url: repository_url.to_string(),
            discovered_prs: discovered,
            discovered_at: Utc::now(),
            api_calls_used,
            cache_hits,
            cache_misses,
            processing_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            errors,
        }
    }

    async fn priority(&self, repository_id: Uuid) -> Priority {
        match self.directory.get(repository_id).await {
            Ok(Some(repo)) => Self::resolve_priority(&repo, Utc::now()),
            Ok(None) => Priority::Low,
            Err(e) => {
                warn!(repository_id = %repository_id, error = %e, "priority resolution failed");
                Priority::Normal
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn record(failure_count: i32, last_polled_mins_ago: Option<i64>, interval: i32) -> RepositoryRecord {
        let now = Utc::now();
        RepositoryRecord {
            id: Uuid::new_v4(),
            url: "https://github.com/test-org/repo-a".into(),
            name: "repo-a".into(),
            status: prm_schemas::RepoStatus::Active,
            failure_count,
            config_override: None,
            last_polled_at: last_polled_mins_ago.map(|m| now - ChronoDuration::minutes(m)),
            polling_interval_minutes: interval,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn priority_table_first_match_wins() {
        let now = Utc::now();
        // (b) repeated failures beat everything but the override.
        assert_eq!(
            GithubRepositoryScanner::resolve_priority(&record(4, Some(1), 60), now),
            Priority::Critical
        );
        // (c)
        assert_eq!(
            GithubRepositoryScanner::resolve_priority(&record(2, Some(1), 60), now),
            Priority::High
        );
        // (d) never polled.
        assert_eq!(
            GithubRepositoryScanner::resolve_priority(&record(0, None, 60), now),
            Priority::High
        );
        // (e) idle more than an hour.
        assert_eq!(
            GithubRepositoryScanner::resolve_priority(&record(0, Some(61), 60), now),
            Priority::High
        );
        // (f) idle more than half an hour.
        assert_eq!(
            GithubRepositoryScanner::resolve_priority(&record(0, Some(31), 60), now),
            Priority::Normal
        );
        // (g) tight polling interval.
        assert_eq!(
            GithubRepositoryScanner::resolve_priority(&record(0, Some(1), 5), now),
            Priority::High
        );
        // (h)
        assert_eq!(
            GithubRepositoryScanner::resolve_priority(&record(0, Some(1), 15), now),
            Priority::Normal
        );
        // (i)
        assert_eq!(
            GithubRepositoryScanner::resolve_priority(&record(0, Some(1), 60), now),
            Priority::Low
        );
    }

    #[test]
    fn priority_override_accepts_name_and_rank() {
        let now = Utc::now();
        let mut repo = record(0, Some(1), 60);
        repo.config_override = Some(json!({"discovery_priority": "critical"}));
        assert_eq!(
            GithubRepositoryScanner::resolve_priority(&repo, now),
            Priority::Critical
        );

        repo.config_override = Some(json!({"discovery_priority": 2}));
        assert_eq!(
            GithubRepositoryScanner::resolve_priority(&repo, now),
            Priority::High
        );

        // Garbage override falls through to the computed rules.
        repo.config_override = Some(json!({"discovery_priority": "urgent"}));
        assert_eq!(
            GithubRepositoryScanner::resolve_priority(&repo, now),
            Priority::Low
        );
    }
}
