//! HTTP status surface: /healthz and /v1/status.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;

use prm_engine::DiscoveryEngine;
use prm_metrics::{HealthMonitor, HealthStatus};

/// Worker-level loop statistics surfaced under /v1/status.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub started_at: Option<DateTime<Utc>>,
    pub total_cycles: u64,
    pub successful_cycles: u64,
    pub failed_cycles: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Shared handler state.
pub struct AppState {
    pub engine: Arc<DiscoveryEngine>,
    pub health: Arc<HealthMonitor>,
    pub stats: Mutex<WorkerStats>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(status))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = state.health.check_health(true).await;
    let code = match report.overall_status {
        HealthStatus::Critical => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (code, Json(report))
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let engine = state.engine.status().await;
    let stats = state.stats.lock().await.clone();
    Json(json!({
        "worker": stats,
        "engine": engine,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use prm_schemas::{
        CacheStrategy, CheckDiscovery, DataSynchronization, DiscoveryConfig, EventPublisher,
        PrDiscovery, RateLimitStrategy, RepositoryDirectory, StateDetection,
    };
    use prm_testkit::{
        InMemoryCache, InMemoryDirectory, InMemoryStateStore, RecordingPublisher,
        RecordingSynchronizer, StaticCheckDiscovery, StaticPrDiscovery,
    };

    fn test_state() -> Arc<AppState> {
        let limiter = Arc::new(prm_ratelimit::TokenBucketLimiter::github_defaults());
        let engine = Arc::new(DiscoveryEngine::new(
            DiscoveryConfig::default(),
            StaticPrDiscovery::new() as Arc<dyn PrDiscovery>,
            StaticCheckDiscovery::new() as Arc<dyn CheckDiscovery>,
            InMemoryStateStore::new() as Arc<dyn StateDetection>,
            RecordingSynchronizer::new() as Arc<dyn DataSynchronization>,
            limiter as Arc<dyn RateLimitStrategy>,
            Arc::new(InMemoryCache::default()) as Arc<dyn CacheStrategy>,
            RecordingPublisher::new() as Arc<dyn EventPublisher>,
            InMemoryDirectory::with(vec![]) as Arc<dyn RepositoryDirectory>,
        ));
        Arc::new(AppState {
            engine,
            health: Arc::new(HealthMonitor::new()),
            stats: Mutex::new(WorkerStats::default()),
        })
    }

    async fn get_json(router: Router, path: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri(path)
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let code = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (code, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn healthz_is_ok_with_no_probes() {
        let router = build_router(test_state());
        let (code, body) = get_json(router, "/healthz").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["overall_status"], "healthy");
    }

    #[tokio::test]
    async fn status_exposes_worker_and_engine_sections() {
        let state = test_state();
        {
            let mut stats = state.stats.lock().await;
            stats.total_cycles = 3;
            stats.successful_cycles = 2;
            stats.failed_cycles = 1;
        }
        let router = build_router(Arc::clone(&state));
        let (code, body) = get_json(router, "/v1/status").await;

        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["worker"]["total_cycles"], 3);
        assert_eq!(body["engine"]["status"], "healthy");
        assert_eq!(body["engine"]["current_cycle"]["is_running"], false);
        assert!(body["engine"]["rate_limits"]["core"]["capacity"].is_number());
    }
}
