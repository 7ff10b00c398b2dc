//! Cumulative collection statistics
//!
//! The flush loop records every collect attempt here; `stats()` and
//! `collector_stats()` combine these counters with a fresh health probe.

use crate::manager::ManagerState;
use crate::metric::{Category, Timestamp};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Health of a single collector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    /// The collector is disabled and was not probed
    Disabled,
    #[default]
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Disabled => write!(f, "disabled"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Point-in-time report for one collector
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectorStats {
    pub name: String,
    pub category: Category,
    pub enabled: bool,
    pub interval: Duration,
    pub last_collect_time: Option<Timestamp>,
    /// Every `collect()` attempt made by the flush loop
    pub collect_count: u64,
    pub error_count: u64,
    pub metrics_count: u64,
    /// Most recent collect/start error, or the current health failure
    pub last_error: Option<String>,
    pub health_status: HealthStatus,
}

/// Point-in-time report for the whole manager
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagerStats {
    pub running: bool,
    pub state: ManagerState,
    pub collector_count: usize,
    pub enabled_count: usize,
    pub total_metrics: u64,
    pub total_errors: u64,
    /// Metric batches dropped because the metrics channel was full
    pub dropped_batches: u64,
    /// Metrics inside the dropped batches
    pub dropped_metrics: u64,
    /// Collector errors dropped because the error channel was full
    pub dropped_errors: u64,
    /// Flush ticks completed since construction
    pub flush_ticks: u64,
    pub collector_stats: HashMap<String, CollectorStats>,
    pub last_update_time: Timestamp,
}

/// Accumulated counters of one collector
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectorCounters {
    pub last_collect_time: Option<Timestamp>,
    pub collect_count: u64,
    pub error_count: u64,
    pub metrics_count: u64,
    pub last_error: Option<String>,
}

/// Drop and tick counters of the delivery pipeline
#[derive(Debug, Default)]
pub struct PipelineCounters {
    ticks: AtomicU64,
    dropped_batches: AtomicU64,
    dropped_metrics: AtomicU64,
    dropped_errors: AtomicU64,
}

impl PipelineCounters {
    pub fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_batch(&self, metrics: usize) {
        self.dropped_batches.fetch_add(1, Ordering::Relaxed);
        self.dropped_metrics
            .fetch_add(metrics as u64, Ordering::Relaxed);
    }

    pub fn record_dropped_error(&self) {
        self.dropped_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn dropped_batches(&self) -> u64 {
        self.dropped_batches.load(Ordering::Relaxed)
    }

    pub fn dropped_metrics(&self) -> u64 {
        self.dropped_metrics.load(Ordering::Relaxed)
    }

    pub fn dropped_errors(&self) -> u64 {
        self.dropped_errors.load(Ordering::Relaxed)
    }
}

/// Per-collector counters plus pipeline counters, shared with the background tasks
#[derive(Debug, Default)]
pub struct StatsTracker {
    collectors: Mutex<HashMap<String, CollectorCounters>>,
    pipeline: PipelineCounters,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    // Counters stay meaningful even if a holder panicked mid-update.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, CollectorCounters>> {
        self.collectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pipeline(&self) -> &PipelineCounters {
        &self.pipeline
    }

    /// Record a successful `collect()` that returned `metrics` metrics
    pub fn record_success(&self, name: &str, metrics: usize) {
        let mut collectors = self.lock();
        let counters = collectors.entry(name.to_string()).or_default();
        counters.last_collect_time = Some(Utc::now());
        counters.collect_count += 1;
        counters.metrics_count += metrics as u64;
    }

    /// Record a failed `collect()`
    pub fn record_collect_error(&self, name: &str, error: &dyn fmt::Display) {
        let mut collectors = self.lock();
        let counters = collectors.entry(name.to_string()).or_default();
        counters.last_collect_time = Some(Utc::now());
        counters.collect_count += 1;
        counters.error_count += 1;
        counters.last_error = Some(error.to_string());
    }

    /// Record a failure of the collector's background loop
    pub fn record_start_error(&self, name: &str, error: &dyn fmt::Display) {
        let mut collectors = self.lock();
        let counters = collectors.entry(name.to_string()).or_default();
        counters.error_count += 1;
        counters.last_error = Some(error.to_string());
    }

    pub fn counters(&self, name: &str) -> CollectorCounters {
        self.lock().get(name).cloned().unwrap_or_default()
    }

    /// Drop the counters of a removed collector
    pub fn forget(&self, name: &str) {
        self.lock().remove(name);
    }

    pub fn total_metrics(&self) -> u64 {
        self.lock().values().map(|c| c.metrics_count).sum()
    }

    pub fn total_errors(&self) -> u64 {
        self.lock().values().map(|c| c.error_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_success_and_errors() {
        let tracker = StatsTracker::new();
        tracker.record_success("cpu", 3);
        tracker.record_success("cpu", 2);
        tracker.record_collect_error("mem", &"boom");
        tracker.record_start_error("mem", &"no loop");

        let cpu = tracker.counters("cpu");
        assert_eq!(cpu.collect_count, 2);
        assert_eq!(cpu.metrics_count, 5);
        assert_eq!(cpu.error_count, 0);
        assert!(cpu.last_collect_time.is_some());

        let mem = tracker.counters("mem");
        assert_eq!(mem.collect_count, 1);
        assert_eq!(mem.error_count, 2);
        assert_eq!(mem.metrics_count, 0);
        assert_eq!(mem.last_error.as_deref(), Some("no loop"));

        assert_eq!(tracker.total_metrics(), 5);
        assert_eq!(tracker.total_errors(), 2);
    }

    #[test]
    fn test_forget_removes_counters() {
        let tracker = StatsTracker::new();
        tracker.record_success("cpu", 1);
        tracker.forget("cpu");

        assert_eq!(tracker.counters("cpu"), CollectorCounters::default());
        assert_eq!(tracker.total_metrics(), 0);
    }

    #[test]
    fn test_pipeline_counters() {
        let tracker = StatsTracker::new();
        let pipeline = tracker.pipeline();
        pipeline.record_tick();
        pipeline.record_dropped_batch(4);
        pipeline.record_dropped_batch(1);
        pipeline.record_dropped_error();

        assert_eq!(pipeline.ticks(), 1);
        assert_eq!(pipeline.dropped_batches(), 2);
        assert_eq!(pipeline.dropped_metrics(), 5);
        assert_eq!(pipeline.dropped_errors(), 1);
    }

    #[test]
    fn test_health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Disabled).unwrap(),
            "\"disabled\""
        );
        assert_eq!(HealthStatus::default(), HealthStatus::Unknown);
        assert_eq!(HealthStatus::Unhealthy.to_string(), "unhealthy");
    }
}
