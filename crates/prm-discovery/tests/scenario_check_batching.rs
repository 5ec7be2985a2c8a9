//! Check discoverer scenarios: SHA-level batching, failure isolation and
//! per-SHA caching.

mod common;

use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;
use serde_json::json;

use common::{check_payload, discovered_pr};
use prm_cache::DiscoveryCache;
use prm_discovery::GithubCheckDiscoverer;
use prm_github::GithubClient;
use prm_schemas::{CacheStrategy, CheckDiscovery, DiscoveryErrorKind};

const REPO_URL: &str = "https://github.com/test-org/repo-a";

fn discoverer(server: &MockServer) -> GithubCheckDiscoverer {
    let cache = Arc::new(DiscoveryCache::new(100, Duration::from_secs(300)));
    let client = Arc::new(GithubClient::with_base_url(
        "test-token".into(),
        server.base_url(),
    ));
    GithubCheckDiscoverer::new(client, cache as Arc<dyn CacheStrategy>)
}

#[tokio::test]
async fn batch_issues_one_enumeration_per_unique_sha() {
    let server = MockServer::start();
    let shared = server.mock(|when, then| {
        when.method(GET)
            .path("/repos/test-org/repo-a/commits/shared-sha/check-runs");
        then.status(200).json_body(json!({
            "total_count": 2,
            "check_runs": [
                check_payload(1, "ci/test", Some("success")),
                check_payload(2, "ci/lint", Some("success")),
            ]
        }));
    });
    let unique = server.mock(|when, then| {
        when.method(GET)
            .path("/repos/test-org/repo-a/commits/unique-sha/check-runs");
        then.status(200).json_body(json!({
            "total_count": 1,
            "check_runs": [check_payload(3, "ci/test", Some("failure"))]
        }));
    });

    let prs = vec![
        discovered_pr(200, "shared-sha"),
        discovered_pr(201, "shared-sha"),
        discovered_pr(202, "unique-sha"),
    ];

    let outcome = discoverer(&server)
        .batch_discover_checks(&prs, REPO_URL)
        .await;

    shared.assert_hits(1);
    unique.assert_hits(1);
    assert!(outcome.errors.is_empty());
    assert_eq!(outcome.checks_by_pr[&200].len(), 2);
    assert_eq!(outcome.checks_by_pr[&201].len(), 2);
    assert_eq!(outcome.checks_by_pr[&202].len(), 1);
    assert!(outcome.checks_by_pr[&202][0].is_failed());
    assert_eq!(outcome.api_calls_used, 2);
    assert_eq!(outcome.cache_misses, 2);
}

#[tokio::test]
async fn one_failing_sha_does_not_stop_the_others() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET)
            .path("/repos/test-org/repo-a/commits/good-sha/check-runs");
        then.status(200).json_body(json!({
            "total_count": 1,
            "check_runs": [check_payload(10, "ci/test", Some("success"))]
        }));
    });
    server.mock(|when, then| {
        when.method(GET)
            .path("/repos/test-org/repo-a/commits/bad-sha/check-runs");
        then.status(500).body("server error");
    });

    let prs = vec![discovered_pr(300, "good-sha"), discovered_pr(301, "bad-sha")];
    let outcome = discoverer(&server)
        .batch_discover_checks(&prs, REPO_URL)
        .await;

    assert_eq!(outcome.checks_by_pr[&300].len(), 1);
    assert_eq!(outcome.checks_by_pr[&301].len(), 0);
    assert_eq!(outcome.errors.len(), 1);
    assert_eq!(outcome.errors[0].kind, DiscoveryErrorKind::GithubApiError);
}

#[tokio::test]
async fn second_batch_for_same_sha_is_served_from_cache() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET)
            .path("/repos/test-org/repo-a/commits/hot-sha/check-runs");
        then.status(200).json_body(json!({
            "total_count": 1,
            "check_runs": [check_payload(20, "ci/test", Some("success"))]
        }));
    });

    let discoverer = discoverer(&server);
    let prs = vec![discovered_pr(400, "hot-sha")];

    let first = discoverer.batch_discover_checks(&prs, REPO_URL).await;
    assert_eq!(first.cache_misses, 1);

    let second = discoverer.batch_discover_checks(&prs, REPO_URL).await;
    assert_eq!(second.cache_hits, 1);
    assert_eq!(second.api_calls_used, 0);
    assert_eq!(second.checks_by_pr[&400].len(), 1);

    mock.assert_hits(1);
}

#[tokio::test]
async fn single_pr_discovery_returns_checks() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET)
            .path("/repos/test-org/repo-a/commits/solo-sha/check-runs");
        then.status(200).json_body(json!({
            "total_count": 2,
            "check_runs": [
                check_payload(30, "ci/test", Some("success")),
                check_payload(31, "ci/build", None),
            ]
        }));
    });

    let pr = discovered_pr(500, "solo-sha");
    let checks = discoverer(&server)
        .discover_checks(&pr, REPO_URL)
        .await
        .unwrap();

    assert_eq!(checks.len(), 2);
    assert_eq!(checks[1].conclusion, None);
}
