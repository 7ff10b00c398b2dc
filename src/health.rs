//! Synchronous health probing across collectors
//!
//! Health is computed on demand, independently of the flush loop. Every
//! enabled collector is probed and all failures are reported together.

use crate::collector::{Collector, SharedCollector};
use crate::error::{CollectError, HealthCheckError};
use crate::stats::{CollectorCounters, CollectorStats, HealthStatus};
use log::{debug, warn};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Probes above this duration are logged; collectors should cache instead
pub const SLOW_PROBE_THRESHOLD: Duration = Duration::from_millis(5);

/// Aggregates collector health into one report
#[derive(Debug, Clone)]
pub struct HealthAggregator {
    slow_probe_threshold: Duration,
}

impl Default for HealthAggregator {
    fn default() -> Self {
        Self::new(SLOW_PROBE_THRESHOLD)
    }
}

impl HealthAggregator {
    pub fn new(slow_probe_threshold: Duration) -> Self {
        Self {
            slow_probe_threshold,
        }
    }

    /// Probe every enabled collector and combine all failures
    ///
    /// Disabled collectors are skipped. The probe is not fail-fast: one
    /// unhealthy collector does not prevent the others from being checked.
    pub fn check(&self, collectors: &[(String, SharedCollector)]) -> Result<(), HealthCheckError> {
        let mut failures: Vec<(String, String)> = collectors
            .iter()
            .filter(|(_, collector)| collector.is_enabled())
            .filter_map(|(name, collector)| {
                self.probe(name, collector.as_ref())
                    .err()
                    .map(|e| (name.clone(), e.to_string()))
            })
            .collect();

        if failures.is_empty() {
            return Ok(());
        }
        failures.sort();
        Err(HealthCheckError { failures })
    }

    /// Health status of one collector plus the diagnostic when unhealthy
    pub fn status(&self, name: &str, collector: &dyn Collector) -> (HealthStatus, Option<String>) {
        if !collector.is_enabled() {
            return (HealthStatus::Disabled, None);
        }
        match self.probe(name, collector) {
            Ok(()) => (HealthStatus::Healthy, None),
            Err(e) => (HealthStatus::Unhealthy, Some(e.to_string())),
        }
    }

    /// Build the stats entry of one collector from its counters and a fresh probe
    pub fn collector_stats(
        &self,
        name: &str,
        collector: &dyn Collector,
        counters: CollectorCounters,
    ) -> CollectorStats {
        let (health_status, health_error) = self.status(name, collector);
        CollectorStats {
            name: name.to_string(),
            category: collector.category(),
            enabled: collector.is_enabled(),
            interval: collector.interval(),
            last_collect_time: counters.last_collect_time,
            collect_count: counters.collect_count,
            error_count: counters.error_count,
            metrics_count: counters.metrics_count,
            last_error: health_error.or(counters.last_error),
            health_status,
        }
    }

    fn probe(&self, name: &str, collector: &dyn Collector) -> Result<(), CollectError> {
        let started = Instant::now();
        let result = collector.health();
        let elapsed = started.elapsed();
        if elapsed > self.slow_probe_threshold {
            warn!(
                "Health probe of collector {} took {:?}, consider caching it",
                name, elapsed
            );
        }
        if let Err(ref e) = result {
            debug!("Collector {} unhealthy: {}", name, e);
        }
        result
    }
}

/// Time-bounded cache for an expensive health probe
///
/// Collectors call [`HealthCache::get_or_refresh`] from `health()` and may
/// keep it fresh from their background loop with [`HealthCache::store`].
#[derive(Debug)]
pub struct HealthCache {
    ttl: Duration,
    entry: Mutex<Option<(Instant, Result<(), String>)>>,
}

impl HealthCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: Mutex::new(None),
        }
    }

    /// Serve the cached result while it is fresh, otherwise run `probe`
    pub fn get_or_refresh<F>(&self, probe: F) -> Result<(), CollectError>
    where
        F: FnOnce() -> Result<(), CollectError>,
    {
        if let Some(result) = self.fresh() {
            return result.map_err(CollectError::Unavailable);
        }
        let result = probe();
        self.store(&result);
        result
    }

    /// Replace the cached result
    pub fn store(&self, result: &Result<(), CollectError>) {
        let value = result.as_ref().map(|_| ()).map_err(ToString::to_string);
        *self.entry.lock().unwrap_or_else(PoisonError::into_inner) = Some((Instant::now(), value));
    }

    fn fresh(&self) -> Option<Result<(), String>> {
        let entry = self.entry.lock().unwrap_or_else(PoisonError::into_inner);
        match entry.as_ref() {
            Some((stored_at, result)) if stored_at.elapsed() < self.ttl => Some(result.clone()),
            _ => None,
        }
    }
}
