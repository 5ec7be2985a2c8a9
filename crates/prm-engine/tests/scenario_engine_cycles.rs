//! End-to-end engine cycles over in-memory collaborators.

use std::sync::Arc;

use uuid::Uuid;

use prm_engine::DiscoveryEngine;
use prm_ratelimit::TokenBucketLimiter;
use prm_schemas::{
    CacheStrategy, ChangeKind, CheckConclusion, CheckDiscovery, DataSynchronization,
    DiscoveryConfig, EntityKind, EventPublisher, PrDiscovery, PrState, Priority,
    RateLimitStrategy, RepoStatus, RepositoryDirectory, RepositoryState, StateDetection,
};
use prm_testkit::{
    discovered_check, discovered_pr, discovery_result, repository, stored_pr, InMemoryCache,
    InMemoryDirectory, InMemoryStateStore, RecordingPublisher, RecordingSynchronizer,
    StaticCheckDiscovery, StaticPrDiscovery,
};

struct Harness {
    engine: DiscoveryEngine,
    scanner: Arc<StaticPrDiscovery>,
    checks: Arc<StaticCheckDiscovery>,
    state: Arc<InMemoryStateStore>,
    sync: Arc<RecordingSynchronizer>,
    publisher: Arc<RecordingPublisher>,
    directory: Arc<InMemoryDirectory>,
    limiter: Arc<TokenBucketLimiter>,
}

fn harness(repos: Vec<prm_schemas::RepositoryRecord>, config: DiscoveryConfig) -> Harness {
    let scanner = StaticPrDiscovery::new();
    let checks = StaticCheckDiscovery::new();
    let state = InMemoryStateStore::new();
    let sync = RecordingSynchronizer::new();
    let publisher = RecordingPublisher::new();
    let directory = InMemoryDirectory::with(repos);
    let limiter = Arc::new(TokenBucketLimiter::github_defaults());
    let cache = Arc::new(InMemoryCache::default());

    let engine = DiscoveryEngine::new(
        config,
        Arc::clone(&scanner) as Arc<dyn PrDiscovery>,
        Arc::clone(&checks) as Arc<dyn CheckDiscovery>,
        Arc::clone(&state) as Arc<dyn StateDetection>,
        Arc::clone(&sync) as Arc<dyn DataSynchronization>,
        Arc::clone(&limiter) as Arc<dyn RateLimitStrategy>,
        cache as Arc<dyn CacheStrategy>,
        Arc::clone(&publisher) as Arc<dyn EventPublisher>,
        Arc::clone(&directory) as Arc<dyn RepositoryDirectory>,
    );

    Harness {
        engine,
        scanner,
        checks,
        state,
        sync,
        publisher,
        directory,
        limiter,
    }
}

#[tokio::test]
async fn first_cycle_discovers_creates_and_publishes() {
    let repo = repository("https://github.com/test-org/repo-a");
    let repo_id = repo.id;
    let repo_url = repo.url.clone();
    let h = harness(vec![repo], DiscoveryConfig::default());

    let prs = vec![
        discovered_pr(1, PrState::Opened, "sha-1"),
        discovered_pr(2, PrState::Opened, "sha-2"),
        discovered_pr(3, PrState::Opened, "sha-3"),
    ];
    h.scanner
        .put_result(discovery_result(repo_id, &repo_url, prs))
        .await;
    for number in 1..=3 {
        h.checks
            .put_checks(
                number,
                vec![
                    discovered_check(
                        &format!("ext-{number}-1"),
                        "ci/test",
                        Some(CheckConclusion::Success),
                    ),
                    discovered_check(
                        &format!("ext-{number}-2"),
                        "ci/lint",
                        Some(CheckConclusion::Success),
                    ),
                ],
            )
            .await;
    }

    let results = h.engine.run_cycle(&[repo_id]).await;

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].discovered_prs.len(), 3);
    assert_eq!(results[0].check_count(), 6);
    assert!(results[0].errors.is_empty());

    // One synchronize call carrying 3 PR creations and 6 check creations.
    let calls = h.sync.calls.lock().await;
    assert_eq!(calls.len(), 1);
    let (_, changes) = &calls[0];
    assert_eq!(changes.len(), 9);
    assert!(changes.iter().all(|c| c.kind == ChangeKind::Created));
    assert_eq!(
        changes.iter().filter(|c| c.entity == EntityKind::PullRequest).count(),
        3
    );
    drop(calls);

    // Events: one completion, nine state changes with placeholders
    // rewritten, no failed checks.
    assert_eq!(*h.publisher.completions.lock().await, vec![1]);
    let published = h.publisher.state_changes.lock().await;
    assert_eq!(published.len(), 9);
    assert!(published.iter().all(|c| !c.is_placeholder()));
    drop(published);
    assert!(h.publisher.failed_checks.lock().await.is_empty());

    // Cycle accounting.
    let status = h.engine.status().await;
    assert_eq!(status.status, "healthy");
    assert_eq!(status.current_cycle.repositories_processed, 1);
    assert_eq!(status.current_cycle.prs_discovered, 3);
    assert_eq!(status.current_cycle.checks_discovered, 6);
    assert_eq!(status.current_cycle.state_changes_detected, 9);
    assert_eq!(status.overall_metrics.total_cycles, 1);
    assert!(status.last_cycle_completed_at.is_some());

    // Poll bookkeeping happened; at most two core tokens were spent.
    assert!(h.directory.last_polled_at(repo_id).await.is_some());
    assert!(h.limiter.available("core").await >= 4498);
}

#[tokio::test]
async fn state_transition_emits_exactly_one_change() {
    let repo = repository("https://github.com/test-org/repo-b");
    let repo_id = repo.id;
    let repo_url = repo.url.clone();
    let h = harness(vec![repo], DiscoveryConfig::default());

    // Stored: #42 opened at sha aaa. Remote now reports it closed, same sha.
    let stored = stored_pr(42, PrState::Opened, "aaa");
    let mut discovered = discovered_pr(42, PrState::Closed, "aaa");
    discovered.updated_at = stored.updated_at;
    h.state
        .put_state(RepositoryState {
            repository_id: repo_id,
            pull_requests: [(42, stored)].into(),
            loaded_at: chrono::Utc::now(),
        })
        .await;
    h.scanner
        .put_result(discovery_result(repo_id, &repo_url, vec![discovered]))
        .await;

    h.engine.run_cycle(&[repo_id]).await;

    let published = h.publisher.state_changes.lock().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].kind, ChangeKind::StateChanged);
    assert_eq!(published[0].old_state.as_deref(), Some("opened"));
    assert_eq!(published[0].new_state, "closed");
    assert!(!published[0].is_placeholder());
}

#[tokio::test]
async fn failed_checks_are_published() {
    let repo = repository("https://github.com/test-org/repo-c");
    let repo_id = repo.id;
    let repo_url = repo.url.clone();
    let h = harness(vec![repo], DiscoveryConfig::default());

    h.scanner
        .put_result(discovery_result(
            repo_id,
            &repo_url,
            vec![discovered_pr(5, PrState::Opened, "sha-5")],
        ))
        .await;
    h.checks
        .put_checks(
            5,
            vec![discovered_check("ext-5-1", "ci/test", Some(CheckConclusion::Failure))],
        )
        .await;

    h.engine.run_cycle(&[repo_id]).await;

    let failed = h.publisher.failed_checks.lock().await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0], (repo_id, 5, "ci/test".to_string()));
}

#[tokio::test]
async fn sync_failure_rolls_back_one_repository_and_spares_the_rest() {
    let repos: Vec<_> = (0..5)
        .map(|i| repository(&format!("https://github.com/test-org/repo-{i}")))
        .collect();
    let ids: Vec<Uuid> = repos.iter().map(|r| r.id).collect();
    let urls: Vec<String> = repos.iter().map(|r| r.url.clone()).collect();
    let h = harness(repos, DiscoveryConfig::default());

    for (i, id) in ids.iter().enumerate() {
        h.scanner
            .put_result(discovery_result(
                *id,
                &urls[i],
                vec![discovered_pr(1, PrState::Opened, "sha")],
            ))
            .await;
    }
    h.sync.fail_repository(ids[2]).await;

    h.engine.run_cycle(&ids).await;

    let status = h.engine.status().await;
    assert_eq!(status.current_cycle.repositories_total, 5);
    assert_eq!(status.current_cycle.repositories_processed, 5);
    // The rolled-back repository counts as failed even though discovery
    // succeeded.
    assert_eq!(status.current_cycle.errors_count, 1);

    // Events for the failed repository are withheld; the others publish.
    let published = h.publisher.state_changes.lock().await;
    assert_eq!(published.len(), 4);
    assert!(published.iter().all(|c| c.repository_id != ids[2]));
    assert_eq!(*h.publisher.completions.lock().await, vec![5]);
}

#[tokio::test]
async fn successful_and_failed_counts_always_sum_to_total() {
    let good = repository("https://github.com/test-org/good");
    let missing_result = repository("https://github.com/test-org/missing");
    let good_id = good.id;
    let missing_id = missing_result.id;
    let good_url = good.url.clone();
    let h = harness(vec![good, missing_result], DiscoveryConfig::default());

    h.scanner
        .put_result(discovery_result(
            good_id,
            &good_url,
            vec![discovered_pr(1, PrState::Opened, "sha")],
        ))
        .await;
    // No canned result for `missing_id`: the scanner reports an error
    // result for it.

    h.engine.run_cycle(&[good_id, missing_id]).await;

    let status = h.engine.status().await;
    assert_eq!(status.current_cycle.repositories_total, 2);
    assert_eq!(status.current_cycle.repositories_processed, 2);
    assert_eq!(status.current_cycle.errors_count, 1);

    // The failing repository accrues a failure count for next cycle's
    // priority boost.
    assert_eq!(h.directory.failure_count(missing_id).await, 1);
    assert_eq!(h.directory.failure_count(good_id).await, 0);
}

#[tokio::test]
async fn inactive_repository_yields_error_result() {
    let mut repo = repository("https://github.com/test-org/suspended");
    repo.status = RepoStatus::Suspended;
    let repo_id = repo.id;
    let h = harness(vec![repo], DiscoveryConfig::default());

    let results = h.engine.run_cycle(&[repo_id]).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].errors.len(), 1);
    assert!(results[0].errors[0].message.contains("not active"));
}

#[tokio::test]
async fn empty_repository_list_is_a_clean_noop() {
    let h = harness(vec![], DiscoveryConfig::default());
    let results = h.engine.run_cycle(&[]).await;
    assert!(results.is_empty());
    assert_eq!(h.sync.call_count().await, 0);
    assert!(h.publisher.completions.lock().await.is_empty());
}

#[tokio::test]
async fn priority_scheduling_processes_critical_repositories_first() {
    let repos: Vec<_> = (0..3)
        .map(|i| repository(&format!("https://github.com/test-org/prio-{i}")))
        .collect();
    let ids: Vec<Uuid> = repos.iter().map(|r| r.id).collect();
    let urls: Vec<String> = repos.iter().map(|r| r.url.clone()).collect();

    // Window of one serialises batches so result order mirrors schedule
    // order.
    let config = DiscoveryConfig {
        max_concurrent_repositories: 1,
        ..DiscoveryConfig::default()
    };
    let h = harness(repos, config);

    for (i, id) in ids.iter().enumerate() {
        h.scanner
            .put_result(discovery_result(
                *id,
                &urls[i],
                vec![discovered_pr(1, PrState::Opened, "sha")],
            ))
            .await;
    }
    h.scanner.put_priority(ids[0], Priority::Low).await;
    h.scanner.put_priority(ids[1], Priority::Critical).await;
    h.scanner.put_priority(ids[2], Priority::Normal).await;

    let results = h.engine.run_cycle(&ids).await;
    let order: Vec<Uuid> = results.iter().map(|r| r.repository_id).collect();
    assert_eq!(order, vec![ids[1], ids[2], ids[0]]);
}
