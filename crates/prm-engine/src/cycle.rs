//! Cycle bookkeeping and the status surface shape.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use prm_schemas::{CacheStats, DiscoveryError, ResourceStatus};

/// Per-batch accounting, kept for the status surface (last 10 shown).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchStats {
    pub batch_number: usize,
    pub timestamp: DateTime<Utc>,
    pub repositories: usize,
    pub successful: usize,
    pub failed: usize,
    pub prs: usize,
    pub checks: usize,
    pub api_calls: u32,
    pub cache_hits: u32,
    pub processing_time_seconds: f64,
}

/// Mutable state of the cycle currently (or last) run.
#[derive(Debug, Default)]
pub(crate) struct CycleState {
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub repositories_total: usize,
    pub repositories_processed: usize,
    pub repositories_successful: usize,
    pub repositories_failed: usize,
    pub prs_discovered: usize,
    pub checks_discovered: usize,
    pub state_changes_detected: usize,
    pub errors: Vec<DiscoveryError>,
    pub batch_stats: Vec<BatchStats>,
}

impl CycleState {
    pub fn begin(&mut self, total: usize) {
        *self = CycleState {
            started_at: Some(Utc::now()),
            repositories_total: total,
            ..CycleState::default()
        };
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some() && self.ended_at.is_none()
    }

    pub fn processing_time_seconds(&self) -> f64 {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds() as f64 / 1000.0,
            (Some(start), None) => (Utc::now() - start).num_milliseconds() as f64 / 1000.0,
            _ => 0.0,
        }
    }

    pub fn progress_percentage(&self) -> f64 {
        if self.repositories_total == 0 {
            return 0.0;
        }
        self.repositories_processed as f64 / self.repositories_total as f64 * 100.0
    }
}

/// Rolling aggregates across cycles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollingMetrics {
    pub total_cycles: u64,
    pub total_repositories: u64,
    pub total_prs: u64,
    pub total_checks: u64,
    pub total_errors: u64,
    pub avg_cycle_time: f64,
    /// Exponentially smoothed, weight 0.7 on the latest cycle.
    pub cache_hit_rate: f64,
}

impl RollingMetrics {
    pub(crate) fn absorb_cycle(
        &mut self,
        repositories: usize,
        prs: usize,
        checks: usize,
        errors: usize,
        cycle_seconds: f64,
        cache_hits: u64,
        cache_misses: u64,
    ) {
        self.total_cycles += 1;
        self.total_repositories += repositories as u64;
        self.total_prs += prs as u64;
        self.total_checks += checks as u64;
        self.total_errors += errors as u64;

        if cycle_seconds > 0.0 {
            let previous = self.avg_cycle_time * (self.total_cycles - 1) as f64;
            self.avg_cycle_time = (previous + cycle_seconds) / self.total_cycles as f64;
        }

        let requests = cache_hits + cache_misses;
        if requests > 0 {
            let current = cache_hits as f64 / requests as f64;
            const WEIGHT: f64 = 0.7;
            self.cache_hit_rate = WEIGHT * current + (1.0 - WEIGHT) * self.cache_hit_rate;
        }
    }
}

/// Condensed error entry for the status surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorView {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleView {
    pub is_running: bool,
    pub repositories_processed: usize,
    pub repositories_total: usize,
    pub progress_percentage: f64,
    pub prs_discovered: usize,
    pub checks_discovered: usize,
    pub state_changes_detected: usize,
    pub processing_time_seconds: f64,
    pub errors_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyView {
    pub max_concurrent: usize,
    pub available_slots: usize,
    pub active_tasks: usize,
    pub task_names: Vec<String>,
}

/// Full engine status as served over the worker's HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    /// `running` during a cycle, else `healthy` or `degraded`.
    pub status: String,
    pub current_cycle: CycleView,
    pub overall_metrics: RollingMetrics,
    pub rate_limits: BTreeMap<String, ResourceStatus>,
    pub cache_stats: CacheStats,
    pub concurrency: ConcurrencyView,
    pub recent_errors: Vec<ErrorView>,
    pub batch_stats: Vec<BatchStats>,
    pub last_cycle_completed_at: Option<DateTime<Utc>>,
}
