//! prm-events
//!
//! Outbound discovery notifications. Delivery is at-least-once and
//! best-effort: publishers log and count failures but never surface them to
//! the cycle. The no-op publisher is the default when no downstream
//! consumer is configured.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use prm_schemas::{DiscoveredCheckRun, DiscoveredPr, DiscoveryResult, EventPublisher, StateChange};

/// Discards every event. Valid default wiring.
#[derive(Debug, Default)]
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish_new_pr(&self, repository_id: Uuid, pr: &DiscoveredPr) {
        debug!(repository_id = %repository_id, pr = pr.pr_number, "new pr event dropped (no consumer)");
    }

    async fn publish_state_change(&self, change: &StateChange) {
        debug!(kind = change.kind.as_str(), "state change event dropped (no consumer)");
    }

    async fn publish_failed_check(
        &self,
        repository_id: Uuid,
        pr_number: i32,
        check: &DiscoveredCheckRun,
    ) {
        debug!(
            repository_id = %repository_id,
            pr_number,
            check = %check.name,
            "failed check event dropped (no consumer)"
        );
    }

    async fn publish_discovery_complete(&self, results: &[DiscoveryResult]) {
        debug!(repositories = results.len(), "discovery complete (no consumer)");
    }
}

/// Emits events to the log under the `prm::events` target and counts them,
/// for deployments that only need an audit trail of the event stream.
#[derive(Debug, Default)]
pub struct LogEventPublisher {
    published: AtomicU64,
}

impl LogEventPublisher {
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EventPublisher for LogEventPublisher {
    async fn publish_new_pr(&self, repository_id: Uuid, pr: &DiscoveredPr) {
        self.published.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "prm::events",
            repository_id = %repository_id,
            pr = pr.pr_number,
            title = %pr.title,
            "new pull request"
        );
    }

    async fn publish_state_change(&self, change: &StateChange) {
        self.published.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "prm::events",
            entity = change.entity.as_str(),
            kind = change.kind.as_str(),
            external_id = %change.external_id,
            old = change.old_state.as_deref().unwrap_or("-"),
            new = %change.new_state,
            "state change"
        );
    }

    async fn publish_failed_check(
        &self,
        repository_id: Uuid,
        pr_number: i32,
        check: &DiscoveredCheckRun,
    ) {
        self.published.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "prm::events",
            repository_id = %repository_id,
            pr_number,
            check = %check.name,
            "check failed"
        );
    }

    async fn publish_discovery_complete(&self, results: &[DiscoveryResult]) {
        self.published.fetch_add(1, Ordering::Relaxed);
        let prs: usize = results.iter().map(|r| r.discovered_prs.len()).sum();
        info!(
            target: "prm::events",
            repositories = results.len(),
            prs,
            "discovery cycle complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn sample_change() -> StateChange {
        StateChange {
            entity: prm_schemas::EntityKind::PullRequest,
            entity_id: Uuid::new_v4(),
            repository_id: Uuid::new_v4(),
            external_id: "1".into(),
            old_state: Some("opened".into()),
            new_state: "closed".into(),
            kind: prm_schemas::ChangeKind::StateChanged,
            metadata: json!({}),
            detected_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn log_publisher_counts_events() {
        let publisher = LogEventPublisher::default();
        publisher.publish_state_change(&sample_change()).await;
        publisher.publish_discovery_complete(&[]).await;
        assert_eq!(publisher.published(), 2);
    }

    #[tokio::test]
    async fn noop_publisher_accepts_everything() {
        let publisher = NoopEventPublisher;
        publisher.publish_state_change(&sample_change()).await;
        publisher.publish_discovery_complete(&[]).await;
    }
}
