//! Worker supervisor: dependency wiring, the cycle loop and graceful
//! shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::{watch, Mutex};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{error, info, warn, Level};
use uuid::Uuid;

use prm_cache::DiscoveryCache;
use prm_config::WorkerConfig;
use prm_db::PgDirectory;
use prm_discovery::{GithubCheckDiscoverer, GithubRepositoryScanner};
use prm_engine::DiscoveryEngine;
use prm_events::NoopEventPublisher;
use prm_github::GithubClient;
use prm_metrics::{CycleMetrics, HealthMonitor, MetricsCollector};
use prm_ratelimit::TokenBucketLimiter;
use prm_schemas::{
    CacheStrategy, CheckDiscovery, DataSynchronization, DiscoveryError, DiscoveryErrorKind,
    EventPublisher, PrDiscovery, RateLimitStrategy, RepositoryDirectory, StateDetection,
};
use prm_state::RepositoryStateManager;
use prm_sync::DatabaseSynchronizer;

use crate::probes::{CacheProbe, DatabaseProbe, EngineProbe, GithubProbe, RateLimiterProbe};
use crate::routes::{build_router, AppState, WorkerStats};

const L1_CACHE_ENTRIES: usize = 1000;
const DEFAULT_BIND: ([u8; 4], u16) = ([127, 0, 0, 1], 8909);

/// Fully wired worker, ready to run.
pub struct Worker {
    config: WorkerConfig,
    pool: PgPool,
    engine: Arc<DiscoveryEngine>,
    limiter: Arc<TokenBucketLimiter>,
    cache: Arc<DiscoveryCache>,
    metrics: Arc<MetricsCollector>,
    app_state: Arc<AppState>,
}

impl Worker {
    /// Build every dependency. Any failure here is fatal (exit code 1).
    pub async fn initialize(config_paths: &[String]) -> Result<Self> {
        info!("initializing pr-monitor worker");

        let loaded = if config_paths.is_empty() {
            prm_config::load_default()
        } else {
            let paths: Vec<&str> = config_paths.iter().map(String::as_str).collect();
            prm_config::load_layered_yaml(&paths)?
        };
        let config = loaded.worker_config()?;
        info!(config_hash = %loaded.config_hash, "configuration loaded");

        let database_url = config.database_url.clone().ok_or_else(|| {
            anyhow!(
                "database url not configured (set {} or database.url)",
                prm_config::ENV_DB_URL
            )
        })?;
        let pool = prm_db::connect(&database_url).await?;
        prm_db::migrate(&pool).await?;
        info!("database ready");

        let token = config.github_token.clone().ok_or_else(|| {
            anyhow!(
                "github token not configured (set {} or github.token)",
                prm_config::ENV_GITHUB_TOKEN
            )
        })?;
        let client = Arc::new(match config.github_base_url.clone() {
            Some(base_url) => GithubClient::with_base_url(token, base_url),
            None => GithubClient::new(token),
        });
        client
            .ping()
            .await
            .context("github connectivity check failed")?;
        info!("github client ready");

        let cache = Arc::new(
            DiscoveryCache::with_redis(
                config.redis_url.as_deref(),
                L1_CACHE_ENTRIES,
                Duration::from_secs(config.discovery.cache_ttl_seconds),
            )
            .await,
        );

        let limiter = Arc::new(TokenBucketLimiter::github_defaults());
        limiter.start().await;

        let directory = Arc::new(PgDirectory::new(pool.clone()));
        let scanner = Arc::new(
            GithubRepositoryScanner::new(
                Arc::clone(&client),
                Arc::clone(&directory) as Arc<dyn RepositoryDirectory>,
                Arc::clone(&cache) as Arc<dyn CacheStrategy>,
                Arc::clone(&limiter) as Arc<dyn RateLimitStrategy>,
            )
            .use_etag_caching(config.discovery.use_etag_caching),
        );
        let check_discoverer = Arc::new(GithubCheckDiscoverer::new(
            Arc::clone(&client),
            Arc::clone(&cache) as Arc<dyn CacheStrategy>,
        ));
        let state_manager = Arc::new(RepositoryStateManager::new(
            pool.clone(),
            Some(Arc::clone(&cache) as Arc<dyn CacheStrategy>),
        ));
        let synchronizer = Arc::new(
            DatabaseSynchronizer::new(pool.clone()).batch_size(config.discovery.batch_size),
        );
        let events: Arc<dyn EventPublisher> = Arc::new(NoopEventPublisher);

        let metrics = Arc::new(MetricsCollector::default());
        MetricsCollector::start_cleanup(&metrics);

        let engine = Arc::new(DiscoveryEngine::new(
            config.discovery.clone(),
            scanner as Arc<dyn PrDiscovery>,
            check_discoverer as Arc<dyn CheckDiscovery>,
            state_manager as Arc<dyn StateDetection>,
            synchronizer as Arc<dyn DataSynchronization>,
            Arc::clone(&limiter) as Arc<dyn RateLimitStrategy>,
            Arc::clone(&cache) as Arc<dyn CacheStrategy>,
            events,
            directory as Arc<dyn RepositoryDirectory>,
        ));

        let mut health = HealthMonitor::new();
        health.register(Arc::new(DatabaseProbe { pool: pool.clone() }));
        health.register(Arc::new(GithubProbe {
            client: Arc::clone(&client),
        }));
        health.register(Arc::new(CacheProbe {
            cache: Arc::clone(&cache),
        }));
        health.register(Arc::new(RateLimiterProbe {
            limiter: Arc::clone(&limiter),
        }));
        health.register(Arc::new(EngineProbe {
            engine: Arc::clone(&engine),
        }));

        let app_state = Arc::new(AppState {
            engine: Arc::clone(&engine),
            health: Arc::new(health),
            stats: Mutex::new(WorkerStats {
                started_at: Some(Utc::now()),
                ..WorkerStats::default()
            }),
        });

        info!("pr-monitor worker initialized");
        Ok(Self {
            config,
            pool,
            engine,
            limiter,
            cache,
            metrics,
            app_state,
        })
    }

    /// Run until SIGINT/SIGTERM, then clean up.
    pub async fn run(self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        spawn_signal_listener(shutdown_tx);

        self.spawn_status_server().await?;

        let interval = Duration::from_secs(self.config.discovery.interval_seconds.max(1));
        info!(interval_seconds = interval.as_secs(), "starting discovery loop");

        let mut shutdown = shutdown_rx.clone();
        loop {
            if *shutdown.borrow() {
                break;
            }

            self.run_one_cycle().await;

            // Wait out the inter-cycle interval, or leave immediately on
            // shutdown.
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }

        self.cleanup().await;
        info!("pr-monitor worker stopped");
        Ok(())
    }

    /// One loop iteration. Cycle-level failures are recorded and absorbed;
    /// the supervisor never exits because of them.
    async fn run_one_cycle(&self) {
        let cycle_started = Utc::now();

        let due: Vec<Uuid> = match prm_db::repositories_needing_poll(&self.pool).await {
            Ok(repos) => repos.into_iter().map(|r| r.id).collect(),
            Err(e) => {
                // Cycle-level store failure: log, account, wait out the
                // interval. The supervisor never exits for this.
                error!("failed to query repositories needing poll: {e:#}");
                let cycle_error = DiscoveryError::new(
                    DiscoveryErrorKind::DiscoveryCycleError,
                    format!("repository poll query failed: {e:#}"),
                );
                let mut stats = self.app_state.stats.lock().await;
                stats.total_cycles += 1;
                stats.failed_cycles += 1;
                stats.last_error = Some(format!(
                    "{}: {}",
                    cycle_error.kind.as_str(),
                    cycle_error.message
                ));
                return;
            }
        };

        if due.is_empty() {
            info!("no repositories need polling");
            return;
        }

        let results = self.engine.run_cycle(&due).await;
        let elapsed = (Utc::now() - cycle_started).num_milliseconds() as f64 / 1000.0;

        self.metrics.record_cycle(CycleMetrics {
            duration_seconds: elapsed,
            repositories: results.len() as u64,
            prs_discovered: results.iter().map(|r| r.discovered_prs.len() as u64).sum(),
            checks_discovered: results.iter().map(|r| r.check_count() as u64).sum(),
            errors: results.iter().map(|r| r.errors.len() as u64).sum(),
            api_calls: results.iter().map(|r| r.api_calls_used as u64).sum(),
            cache_hits: results.iter().map(|r| r.cache_hits as u64).sum(),
            cache_misses: results.iter().map(|r| r.cache_misses as u64).sum(),
        });

        let mut stats = self.app_state.stats.lock().await;
        stats.total_cycles += 1;
        stats.successful_cycles += 1;
        stats.last_cycle_at = Some(cycle_started);
        info!(repositories = results.len(), "discovery cycle finished");
    }

    async fn spawn_status_server(&self) -> Result<()> {
        let app = build_router(Arc::clone(&self.app_state)).layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        );
        let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(DEFAULT_BIND));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind status server on {addr}"))?;
        info!("status surface listening on http://{addr}");

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!("status server stopped: {e}");
            }
        });
        Ok(())
    }

    async fn cleanup(&self) {
        info!("shutting down worker components");
        self.limiter.stop().await;
        self.cache.close();
        self.metrics.stop_cleanup();
        self.pool.close().await;
    }
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("PRM_WORKER_ADDR").ok()?.parse().ok()
}

fn spawn_signal_listener(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut terminate =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("sigterm handler installation failed");
            tokio::select! {
                _ = ctrl_c => info!("received SIGINT, shutting down"),
                _ = terminate.recv() => info!("received SIGTERM, shutting down"),
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("received interrupt, shutting down");
        }

        let _ = shutdown_tx.send(true);
    });
}
