//! Health probes for the worker's components.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;

use prm_cache::DiscoveryCache;
use prm_engine::DiscoveryEngine;
use prm_github::GithubClient;
use prm_metrics::{HealthCheckResult, HealthProbe, HealthStatus};
use prm_ratelimit::TokenBucketLimiter;
use prm_schemas::RateLimitStrategy;

pub struct DatabaseProbe {
    pub pool: PgPool,
}

#[async_trait]
impl HealthProbe for DatabaseProbe {
    fn name(&self) -> &str {
        "database"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(5)
    }

    async fn check(&self) -> HealthCheckResult {
        match prm_db::ping(&self.pool).await {
            Ok(()) => HealthCheckResult::healthy("database", "connection ok"),
            Err(e) => HealthCheckResult::failing("database", HealthStatus::Critical, e.to_string()),
        }
    }
}

pub struct GithubProbe {
    pub client: Arc<GithubClient>,
}

#[async_trait]
impl HealthProbe for GithubProbe {
    fn name(&self) -> &str {
        "github_api"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(10)
    }

    async fn check(&self) -> HealthCheckResult {
        match self.client.ping().await {
            Ok(()) => HealthCheckResult::healthy("github_api", "rate_limit endpoint reachable"),
            Err(e) => {
                HealthCheckResult::failing("github_api", HealthStatus::Critical, e.to_string())
            }
        }
    }
}

pub struct CacheProbe {
    pub cache: Arc<DiscoveryCache>,
}

#[async_trait]
impl HealthProbe for CacheProbe {
    fn name(&self) -> &str {
        "cache"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(5)
    }

    fn required(&self) -> bool {
        false
    }

    async fn check(&self) -> HealthCheckResult {
        let health = self.cache.health_check().await;
        if health.healthy {
            HealthCheckResult::healthy("cache", "round trip ok")
        } else {
            let detail = health
                .l2
                .error
                .or(health.l1.error)
                .unwrap_or_else(|| "unhealthy".into());
            HealthCheckResult::failing("cache", HealthStatus::Degraded, detail)
        }
    }
}

pub struct RateLimiterProbe {
    pub limiter: Arc<TokenBucketLimiter>,
}

#[async_trait]
impl HealthProbe for RateLimiterProbe {
    fn name(&self) -> &str {
        "rate_limiter"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(2)
    }

    fn required(&self) -> bool {
        false
    }

    async fn check(&self) -> HealthCheckResult {
        let status = self.limiter.status().await;
        let core_exhausted = status
            .get("core")
            .map(|core| core.utilization > 0.95)
            .unwrap_or(false);
        if core_exhausted {
            HealthCheckResult::failing(
                "rate_limiter",
                HealthStatus::Warning,
                "core bucket nearly exhausted",
            )
        } else {
            HealthCheckResult::healthy("rate_limiter", "token budget available")
        }
    }
}

pub struct EngineProbe {
    pub engine: Arc<DiscoveryEngine>,
}

#[async_trait]
impl HealthProbe for EngineProbe {
    fn name(&self) -> &str {
        "discovery_engine"
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(5)
    }

    async fn check(&self) -> HealthCheckResult {
        let status = self.engine.status().await;
        match status.status.as_str() {
            "degraded" => HealthCheckResult::failing(
                "discovery_engine",
                HealthStatus::Degraded,
                "error rate over threshold in the last hour",
            ),
            other => HealthCheckResult::healthy("discovery_engine", other),
        }
    }
}
