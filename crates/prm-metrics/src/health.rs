//! Composable health checking with per-probe timeouts and a short result
//! cache.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

const RESULT_CACHE_TTL: Duration = Duration::from_secs(30);

/// Ordered worst-last so `max` picks the most severe status.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Degraded,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Critical => "critical",
        }
    }
}

/// Outcome of one probe run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
    pub duration_ms: f64,
    pub details: Value,
}

impl HealthCheckResult {
    pub fn healthy(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status: HealthStatus::Healthy,
            message: message.into(),
            duration_ms: 0.0,
            details: Value::Null,
        }
    }

    pub fn failing(name: &str, status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            message: message.into(),
            duration_ms: 0.0,
            details: Value::Null,
        }
    }
}

/// One named health probe. Implementations decide their own timeout and
/// whether they gate overall health.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &str;

    fn timeout(&self) -> Duration {
        Duration::from_secs(10)
    }

    fn required(&self) -> bool {
        true
    }

    async fn check(&self) -> HealthCheckResult;
}

/// Full health report as served by the status surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub overall_status: HealthStatus,
    pub checked_at: DateTime<Utc>,
    pub checks: BTreeMap<String, HealthCheckResult>,
    pub summary: HealthSummary,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub warning: usize,
    pub degraded: usize,
    pub critical: usize,
}

/// Runs registered probes concurrently, each under its own timeout, and
/// caches the assembled report for a short window.
#[derive(Default)]
pub struct HealthMonitor {
    probes: Vec<Arc<dyn HealthProbe>>,
    cached: Mutex<Option<(HealthReport, Instant)>>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, probe: Arc<dyn HealthProbe>) {
        self.probes.push(probe);
    }

    pub async fn check_health(&self, use_cache: bool) -> HealthReport {
        if use_cache {
            let cached = self.cached.lock().await;
            if let Some((report, at)) = cached.as_ref() {
                if at.elapsed() < RESULT_CACHE_TTL {
                    debug!("serving cached health report");
                    return report.clone();
                }
            }
        }

        let runs = self.probes.iter().map(|probe| {
            let probe = Arc::clone(probe);
            async move {
                let started = Instant::now();
                let mut result = match tokio::time::timeout(probe.timeout(), probe.check()).await {
                    Ok(result) => result,
                    Err(_) => HealthCheckResult::failing(
                        probe.name(),
                        HealthStatus::Critical,
                        format!("probe timed out after {:?}", probe.timeout()),
                    ),
                };
                result.duration_ms = started.elapsed().as_secs_f64() * 1000.0;
                (probe.required(), result)
            }
        });
        let results: Vec<(bool, HealthCheckResult)> = join_all(runs).await;

        let mut overall = HealthStatus::Healthy;
        let mut summary = HealthSummary::default();
        let mut checks = BTreeMap::new();
        for (required, result) in results {
            summary.total += 1;
            match result.status {
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Warning => summary.warning += 1,
                HealthStatus::Degraded => summary.degraded += 1,
                HealthStatus::Critical => summary.critical += 1,
            }
            if required {
                overall = overall.max(result.status);
            } else if result.status > HealthStatus::Healthy {
                // A sick optional component is worth a warning, no more.
                overall = overall.max(HealthStatus::Warning);
            }
            checks.insert(result.name.clone(), result);
        }

        let report = HealthReport {
            overall_status: overall,
            checked_at: Utc::now(),
            checks,
            summary,
        };
        *self.cached.lock().await = Some((report.clone(), Instant::now()));
        report
    }
}
