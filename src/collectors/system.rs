use crate::collector::{BoxFuture, Collector, CollectorSpec, SharedCollector};
use crate::error::CollectError;
use crate::health::HealthCache;
use crate::metric::{Category, Labels, Metric, Timestamp};
use chrono::Utc;
use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Host and process resource collector
///
/// Reports the host load average and CPU count together with the resident
/// memory of the current process. Every metric carries the category labels
/// plus `collector` and `hostname`.
///
/// Recognised options in the `[system.options]` table:
///
/// * `collect_load` (default `true`)
/// * `collect_memory` (default `true`)
pub struct SystemCollector {
    name: String,
    interval: Duration,
    enabled: AtomicBool,
    labels: Labels,
    collect_load: bool,
    collect_memory: bool,
    /// Load average probe result, refreshed by the background loop
    health: HealthCache,
}

impl SystemCollector {
    /// Create a new SystemCollector
    ///
    /// # Example
    ///
    /// ```
    /// use collector_manager::collector::Collector;
    /// use collector_manager::collectors::SystemCollector;
    /// use std::time::Duration;
    ///
    /// let collector = SystemCollector::new("system", Duration::from_secs(5), Default::default());
    /// assert!(collector.is_enabled());
    /// ```
    pub fn new(name: impl Into<String>, interval: Duration, labels: Labels) -> Self {
        let name = name.into();
        let mut labels = labels;
        labels.insert("collector".to_string(), name.clone());
        if let Some(hostname) = hostname() {
            labels.entry("hostname".to_string()).or_insert(hostname);
        }

        Self {
            name,
            interval,
            enabled: AtomicBool::new(true),
            labels,
            collect_load: true,
            collect_memory: true,
            health: HealthCache::new(interval),
        }
    }

    /// Factory used by `initialize()` for the `system` category
    pub fn build(spec: &CollectorSpec<'_>) -> Result<SharedCollector, CollectError> {
        let mut collector =
            SystemCollector::new(spec.name.clone(), spec.interval, spec.config.labels.clone());
        collector.collect_load = option_flag(&spec.config.options, "collect_load")?.unwrap_or(true);
        collector.collect_memory =
            option_flag(&spec.config.options, "collect_memory")?.unwrap_or(true);
        Ok(Arc::new(collector))
    }

    fn sample(&self) -> Result<Vec<Metric>, CollectError> {
        // One timestamp per sample so the metrics line up downstream
        let now = Utc::now();
        let mut metrics = Vec::with_capacity(5);

        if self.collect_load {
            let [load1, load5, load15] = load_average()?;
            for (name, value) in [
                ("system.load1", load1),
                ("system.load5", load5),
                ("system.load15", load15),
            ] {
                metrics.push(
                    self.gauge(name, value, now)
                        .with_description("Run queue load average"),
                );
            }
        }

        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        metrics.push(
            self.gauge("system.cpu.count", cpus as f64, now)
                .with_description("Logical CPUs available to the process"),
        );

        if self.collect_memory {
            match resident_memory_bytes() {
                Some(bytes) => metrics.push(
                    self.gauge("process.memory.rss", bytes as f64, now)
                        .with_unit("bytes")
                        .with_description("Resident memory of the monitoring process"),
                ),
                None => debug!("Resident memory unavailable on this platform"),
            }
        }

        Ok(metrics)
    }

    fn gauge(&self, name: &str, value: f64, timestamp: Timestamp) -> Metric {
        Metric::gauge(name, value, Category::System)
            .with_labels(&self.labels)
            .with_source(&self.name)
            .with_timestamp(timestamp)
    }

    fn probe() -> Result<(), CollectError> {
        load_average().map(|_| ())
    }
}

impl Collector for SystemCollector {
    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> Category {
        Category::System
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn start<'a>(&'a self, token: CancellationToken) -> BoxFuture<'a, Result<(), CollectError>> {
        Box::pin(async move {
            if !self.is_enabled() {
                return Ok(());
            }
            info!("SystemCollector {} started with interval {:?}", self.name, self.interval);

            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => self.health.store(&Self::probe()),
                }
            }

            debug!("SystemCollector {} loop stopped", self.name);
            Ok(())
        })
    }

    fn stop(&self) -> Result<(), CollectError> {
        if self.enabled.swap(false, Ordering::SeqCst) {
            info!("SystemCollector {} stopped", self.name);
        }
        Ok(())
    }

    fn health(&self) -> Result<(), CollectError> {
        self.health.get_or_refresh(Self::probe)
    }

    fn collect<'a>(
        &'a self,
        token: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Vec<Metric>, CollectError>> {
        Box::pin(async move {
            if token.is_cancelled() {
                return Err(CollectError::Cancelled);
            }
            self.sample()
        })
    }
}

fn option_flag(options: &toml::Table, key: &str) -> Result<Option<bool>, CollectError> {
    match options.get(key) {
        None => Ok(None),
        Some(value) => value
            .as_bool()
            .map(Some)
            .ok_or_else(|| CollectError::Failed(format!("option {} must be a boolean", key))),
    }
}

/// 1, 5 and 15 minute load averages
#[cfg(unix)]
fn load_average() -> Result<[f64; 3], CollectError> {
    let mut loads = [0f64; 3];
    // SAFETY: the buffer holds exactly the three samples requested
    let filled = unsafe { libc::getloadavg(loads.as_mut_ptr(), 3) };
    if filled != 3 {
        return Err(CollectError::Unavailable(
            "getloadavg returned no samples".to_string(),
        ));
    }
    Ok(loads)
}

#[cfg(not(unix))]
fn load_average() -> Result<[f64; 3], CollectError> {
    Err(CollectError::Unavailable(
        "load average is not supported on this platform".to_string(),
    ))
}

#[cfg(unix)]
fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: gethostname writes at most `buf.len()` bytes into the buffer
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..end]).into_owned();
    (!name.is_empty()).then_some(name)
}

#[cfg(not(unix))]
fn hostname() -> Option<String> {
    None
}

/// Resident memory of the current process in bytes
fn resident_memory_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            if let Some(bytes) = parse_vm_rss(&status) {
                return Some(bytes);
            }
        }
    }

    // Fallback: rusage reports the peak, not the current size
    max_resident_memory_bytes()
}

#[cfg(unix)]
fn max_resident_memory_bytes() -> Option<u64> {
    // SAFETY: getrusage only writes into the zeroed struct we own
    let usage = unsafe {
        let mut usage: libc::rusage = std::mem::zeroed();
        if libc::getrusage(libc::RUSAGE_SELF, &mut usage) != 0 {
            return None;
        }
        usage
    };

    // ru_maxrss is in KB on Linux, bytes on macOS
    let raw = usage.ru_maxrss.max(0) as u64;
    if cfg!(target_os = "macos") {
        Some(raw)
    } else {
        Some(raw * 1024)
    }
}

#[cfg(not(unix))]
fn max_resident_memory_bytes() -> Option<u64> {
    None
}

/// Extract `VmRSS` from the contents of `/proc/<pid>/status`
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_vm_rss(status: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}
