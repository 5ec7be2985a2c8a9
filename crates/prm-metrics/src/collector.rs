//! Metrics collection with bounded retention.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::debug;

const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 3600);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct MetricPoint {
    name: String,
    value: f64,
    at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    points: VecDeque<MetricPoint>,
    counters: HashMap<String, u64>,
    gauges: HashMap<String, f64>,
    timers: HashMap<String, Vec<f64>>,
}

/// Inputs for per-cycle metric recording.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleMetrics {
    pub duration_seconds: f64,
    pub repositories: u64,
    pub prs_discovered: u64,
    pub checks_discovered: u64,
    pub errors: u64,
    pub api_calls: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// Aggregates over one metric within a summary window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub count: usize,
    pub sum: f64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

/// Process-wide collector. All recording methods are synchronous and lock
/// briefly; the cleanup task prunes points past the retention window.
pub struct MetricsCollector {
    retention: Duration,
    inner: Mutex<Inner>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

impl MetricsCollector {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            inner: Mutex::new(Inner::default()),
            cleanup: Mutex::new(None),
        }
    }

    fn key(name: &str, tags: &BTreeMap<String, String>) -> String {
        if tags.is_empty() {
            return name.to_string();
        }
        let rendered: Vec<String> = tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
        format!("{name}[{}]", rendered.join(","))
    }

    pub fn record(&self, name: &str, value: f64, tags: &BTreeMap<String, String>) {
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        inner.points.push_back(MetricPoint {
            name: Self::key(name, tags),
            value,
            at: Utc::now(),
        });
    }

    pub fn increment(&self, name: &str, by: u64, tags: &BTreeMap<String, String>) {
        let key = Self::key(name, tags);
        let current = {
            let mut inner = self.inner.lock().expect("metrics lock poisoned");
            let counter = inner.counters.entry(key).or_insert(0);
            *counter += by;
            *counter
        };
        self.record(name, current as f64, tags);
    }

    pub fn set_gauge(&self, name: &str, value: f64, tags: &BTreeMap<String, String>) {
        {
            let mut inner = self.inner.lock().expect("metrics lock poisoned");
            inner.gauges.insert(Self::key(name, tags), value);
        }
        self.record(name, value, tags);
    }

    pub fn record_timer(&self, name: &str, duration: Duration, tags: &BTreeMap<String, String>) {
        let secs = duration.as_secs_f64();
        {
            let mut inner = self.inner.lock().expect("metrics lock poisoned");
            let key = Self::key(name, tags);
            inner.timers.entry(key).or_default().push(secs);
        }
        self.record(&format!("{name}_duration"), secs, tags);
    }

    /// Core cycle metrics plus the derived rates.
    pub fn record_cycle(&self, cycle: CycleMetrics) {
        let no_tags = BTreeMap::new();
        self.record("discovery_cycle_duration_seconds", cycle.duration_seconds, &no_tags);
        self.record("discovery_repositories_processed", cycle.repositories as f64, &no_tags);
        self.record("discovery_prs_discovered", cycle.prs_discovered as f64, &no_tags);
        self.record("discovery_checks_discovered", cycle.checks_discovered as f64, &no_tags);
        self.record("discovery_errors_total", cycle.errors as f64, &no_tags);
        self.record("github_api_calls_total", cycle.api_calls as f64, &no_tags);
        self.record("cache_hits_total", cycle.cache_hits as f64, &no_tags);
        self.record("cache_misses_total", cycle.cache_misses as f64, &no_tags);

        let cache_total = cycle.cache_hits + cycle.cache_misses;
        if cache_total > 0 {
            self.record(
                "cache_hit_rate_percent",
                cycle.cache_hits as f64 / cache_total as f64 * 100.0,
                &no_tags,
            );
        }
        if cycle.duration_seconds > 0.0 {
            self.record(
                "discovery_prs_per_second",
                cycle.prs_discovered as f64 / cycle.duration_seconds,
                &no_tags,
            );
            self.record(
                "discovery_repositories_per_second",
                cycle.repositories as f64 / cycle.duration_seconds,
                &no_tags,
            );
        }
        if cycle.repositories > 0 {
            self.record(
                "discovery_error_rate_percent",
                cycle.errors as f64 / cycle.repositories as f64 * 100.0,
                &no_tags,
            );
        }
    }

    /// Per-repository breakdown, tagged by repository id.
    pub fn record_repository(
        &self,
        repository_id: &str,
        prs: u64,
        checks: u64,
        processing_time_ms: f64,
    ) {
        let tags: BTreeMap<String, String> =
            [("repository".to_string(), repository_id.to_string())].into();
        self.record("repository_prs_processed", prs as f64, &tags);
        self.record("repository_checks_processed", checks as f64, &tags);
        self.record("repository_processing_time_ms", processing_time_ms, &tags);
    }

    /// Count/sum/avg/min/max per metric over the trailing window.
    pub fn summary(&self, hours: f64) -> BTreeMap<String, MetricSummary> {
        let cutoff = Utc::now() - chrono::Duration::seconds((hours * 3600.0) as i64);
        let inner = self.inner.lock().expect("metrics lock poisoned");

        let mut grouped: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for point in &inner.points {
            if point.at >= cutoff {
                grouped.entry(point.name.clone()).or_default().push(point.value);
            }
        }

        grouped
            .into_iter()
            .map(|(name, values)| {
                let count = values.len();
                let sum: f64 = values.iter().sum();
                let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
                let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                (
                    name,
                    MetricSummary {
                        count,
                        sum,
                        avg: sum / count as f64,
                        min,
                        max,
                    },
                )
            })
            .collect()
    }

    pub fn counter(&self, name: &str, tags: &BTreeMap<String, String>) -> u64 {
        self.inner
            .lock()
            .expect("metrics lock poisoned")
            .counters
            .get(&Self::key(name, tags))
            .copied()
            .unwrap_or(0)
    }

    pub fn gauge(&self, name: &str, tags: &BTreeMap<String, String>) -> Option<f64> {
        self.inner
            .lock()
            .expect("metrics lock poisoned")
            .gauges
            .get(&Self::key(name, tags))
            .copied()
    }

    /// Drop points recorded before `now - retention`.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now
            - chrono::Duration::from_std(self.retention).unwrap_or_else(|_| chrono::Duration::hours(24));
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        let before = inner.points.len();
        inner.points.retain(|p| p.at >= cutoff);
        before - inner.points.len()
    }

    /// Spawn the retention cleanup task for a shared collector. Idempotent.
    pub fn start_cleanup(collector: &std::sync::Arc<Self>) {
        let mut guard = collector.cleanup.lock().expect("metrics lock poisoned");
        if guard.is_some() {
            return;
        }
        let collector = std::sync::Arc::clone(collector);
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                ticker.tick().await;
                let dropped = collector.prune(Utc::now());
                if dropped > 0 {
                    debug!(dropped, "pruned expired metric points");
                }
            }
        }));
    }

    pub fn stop_cleanup(&self) {
        if let Some(handle) = self.cleanup.lock().expect("metrics lock poisoned").take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_tags() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[test]
    fn counters_accumulate_and_surface_in_summary() {
        let collector = MetricsCollector::default();
        collector.increment("cycles", 1, &no_tags());
        collector.increment("cycles", 2, &no_tags());
        assert_eq!(collector.counter("cycles", &no_tags()), 3);

        let summary = collector.summary(1.0);
        let cycles = &summary["cycles"];
        assert_eq!(cycles.count, 2);
        assert_eq!(cycles.max, 3.0);
    }

    #[test]
    fn tags_separate_series() {
        let collector = MetricsCollector::default();
        let tag_a: BTreeMap<String, String> = [("repository".into(), "a".into())].into();
        let tag_b: BTreeMap<String, String> = [("repository".into(), "b".into())].into();
        collector.increment("prs", 5, &tag_a);
        collector.increment("prs", 7, &tag_b);
        assert_eq!(collector.counter("prs", &tag_a), 5);
        assert_eq!(collector.counter("prs", &tag_b), 7);
    }

    #[test]
    fn record_cycle_emits_derived_rates() {
        let collector = MetricsCollector::default();
        collector.record_cycle(CycleMetrics {
            duration_seconds: 10.0,
            repositories: 5,
            prs_discovered: 50,
            checks_discovered: 100,
            errors: 1,
            api_calls: 20,
            cache_hits: 8,
            cache_misses: 2,
        });

        let summary = collector.summary(1.0);
        assert_eq!(summary["discovery_prs_per_second"].avg, 5.0);
        assert_eq!(summary["cache_hit_rate_percent"].avg, 80.0);
        assert_eq!(summary["discovery_error_rate_percent"].avg, 20.0);
    }

    #[test]
    fn prune_drops_expired_points() {
        let collector = MetricsCollector::new(Duration::from_secs(3600));
        collector.record("m", 1.0, &no_tags());

        assert_eq!(collector.prune(Utc::now()), 0);
        let dropped = collector.prune(Utc::now() + chrono::Duration::hours(2));
        assert_eq!(dropped, 1);
        assert!(collector.summary(24.0).is_empty());
    }

    #[test]
    fn gauge_reflects_last_write() {
        let collector = MetricsCollector::default();
        collector.set_gauge("queue_depth", 4.0, &no_tags());
        collector.set_gauge("queue_depth", 2.0, &no_tags());
        assert_eq!(collector.gauge("queue_depth", &no_tags()), Some(2.0));
    }

    #[test]
    fn timers_record_durations() {
        let collector = MetricsCollector::default();
        collector.record_timer("scan", Duration::from_millis(250), &no_tags());
        let summary = collector.summary(1.0);
        assert!((summary["scan_duration"].avg - 0.25).abs() < 1e-9);
    }
}
