//! Lifecycle controller and public facade
//!
//! A [`Manager`] owns the collector registry, the flush loop and the error
//! drain. While running it keeps one task per enabled collector, each under a
//! child of the run's cancellation token, so a single collector can be
//! cancelled without touching the others.
//!
//! Lifecycle operations are serialized by one async mutex. The lock order is
//! lifecycle, then config, then registry.

use crate::collector::{CollectorFactory, CollectorSpec, SharedCollector};
use crate::collectors::SystemCollector;
use crate::config::ManagerConfig;
use crate::error::{
    CollectError, CollectOnceError, CollectorError, HealthCheckError, ManagerError, RestartStep,
};
use crate::error_sink::{ErrorReporter, ErrorSink};
use crate::health::HealthAggregator;
use crate::metric::{Category, Metric};
use crate::pipeline::{collect_bounded, AggregationPipeline};
use crate::registry::CollectorRegistry;
use crate::stats::{CollectorStats, ManagerStats, StatsTracker};
use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a [`Manager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ManagerState {
    #[default]
    Uninitialized,
    Initialized,
    Running,
    Stopped,
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerState::Uninitialized => write!(f, "uninitialized"),
            ManagerState::Initialized => write!(f, "initialized"),
            ManagerState::Running => write!(f, "running"),
            ManagerState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Senders prepared for the next run
struct Outlets {
    metrics_tx: mpsc::Sender<Vec<Metric>>,
    errors_tx: mpsc::Sender<CollectorError>,
}

/// Receivers not yet handed out to a consumer
struct Receivers {
    metrics: Option<mpsc::Receiver<Vec<Metric>>>,
    errors: Option<mpsc::Receiver<CollectorError>>,
}

fn channels(config: &ManagerConfig) -> (Outlets, Receivers) {
    // mpsc::channel panics on zero capacity; validate() rejects it later
    let (metrics_tx, metrics_rx) = mpsc::channel(config.metrics_buffer_size.max(1));
    let (errors_tx, errors_rx) = mpsc::channel(config.error_buffer_size.max(1));
    (
        Outlets {
            metrics_tx,
            errors_tx,
        },
        Receivers {
            metrics: Some(metrics_rx),
            errors: Some(errors_rx),
        },
    )
}

struct CollectorTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl CollectorTask {
    fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }
}

/// Everything spawned by one `start()`
struct Run {
    token: CancellationToken,
    reporter: ErrorReporter,
    flush: JoinHandle<()>,
    drain: JoinHandle<()>,
    collectors: HashMap<String, CollectorTask>,
}

struct Lifecycle {
    outlets: Option<Outlets>,
    run: Option<Run>,
    /// Collectors disabled by the last `stop()` that `start()` re-enables
    suspended: HashSet<String>,
}

/// Orchestrates a set of metric collectors
///
/// # Example
///
/// ```no_run
/// use collector_manager::{Manager, ManagerConfig};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let manager = Manager::new(ManagerConfig::default());
/// manager.initialize().await?;
/// let mut metrics = manager.metrics_receiver().expect("receiver taken once");
/// manager.start().await?;
///
/// while let Some(batch) = metrics.recv().await {
///     for metric in batch {
///         println!("{} = {}", metric.name, metric.value);
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct Manager {
    config: RwLock<ManagerConfig>,
    registry: Arc<CollectorRegistry>,
    factories: HashMap<Category, Arc<dyn CollectorFactory>>,
    stats: Arc<StatsTracker>,
    health: HealthAggregator,
    lifecycle: Mutex<Lifecycle>,
    state: StdMutex<ManagerState>,
    receivers: StdMutex<Receivers>,
}

impl Manager {
    /// Create a manager with the built-in `system` collector factory
    pub fn new(config: ManagerConfig) -> Self {
        let (outlets, receivers) = channels(&config);
        let mut factories: HashMap<Category, Arc<dyn CollectorFactory>> = HashMap::new();
        factories.insert(Category::System, Arc::new(SystemCollector::build));

        Self {
            config: RwLock::new(config),
            registry: Arc::new(CollectorRegistry::new()),
            factories,
            stats: Arc::new(StatsTracker::new()),
            health: HealthAggregator::default(),
            lifecycle: Mutex::new(Lifecycle {
                outlets: Some(outlets),
                run: None,
                suspended: HashSet::new(),
            }),
            state: StdMutex::new(ManagerState::Uninitialized),
            receivers: StdMutex::new(receivers),
        }
    }

    /// Register the factory `initialize()` uses for `category`
    ///
    /// Replaces any factory already registered for that category.
    pub fn with_factory(
        mut self,
        category: Category,
        factory: impl CollectorFactory + 'static,
    ) -> Self {
        self.factories.insert(category, Arc::new(factory));
        self
    }

    pub fn state(&self) -> ManagerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.state() == ManagerState::Running
    }

    fn set_state(&self, state: ManagerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn receivers(&self) -> MutexGuard<'_, Receivers> {
        self.receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Build the collectors of every enabled category
    ///
    /// Global labels are merged into each category first. A collector built
    /// here replaces a registered collector of the same name; dynamically
    /// added collectors under other names are kept.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` while running, `Config` if validation fails and
    /// `BuildFailed` if a factory fails. On error the registry is unchanged.
    pub async fn initialize(&self) -> Result<(), ManagerError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_running() {
            return Err(ManagerError::AlreadyRunning);
        }

        let mut config = self.config.write().await;
        config.validate()?;
        config.merge_global_labels();

        let mut built = Vec::new();
        for category in Category::ALL {
            let section = config.category(category);
            if !section.enabled {
                continue;
            }
            let Some(factory) = self.factories.get(&category) else {
                warn!("No collector factory for category {}, skipping", category);
                continue;
            };

            let spec = CollectorSpec {
                name: config.name_for(category),
                category,
                interval: config.interval_for(category),
                config: section,
            };
            let collector = factory
                .build(&spec)
                .map_err(|source| ManagerError::BuildFailed {
                    category: category.to_string(),
                    source,
                })?;
            built.push(collector);
        }
        drop(config);

        for collector in built {
            let name = collector.name().to_string();
            if self.registry.replace(collector).await.is_some() {
                debug!("Replaced collector {}", name);
            } else {
                info!("Initialized collector {}", name);
            }
        }

        if self.state() == ManagerState::Uninitialized {
            self.set_state(ManagerState::Initialized);
        }
        Ok(())
    }

    /// Spawn the flush loop, the error drain and one task per enabled collector
    ///
    /// Collectors suspended by the previous `stop()` are re-enabled first.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning`, or `Config` if the current configuration is invalid;
    /// nothing is spawned in either case.
    pub async fn start(&self) -> Result<(), ManagerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.run.is_some() {
            return Err(ManagerError::AlreadyRunning);
        }
        let config = self.config.read().await.clone();
        config.validate()?;

        let suspended: Vec<String> = lifecycle.suspended.drain().collect();
        for name in suspended {
            if self.registry.enable(&name).await.is_ok() {
                debug!("Resumed collector {}", name);
            }
        }

        let outlets = match lifecycle.outlets.take() {
            Some(outlets) => outlets,
            None => {
                let (outlets, receivers) = channels(&config);
                *self.receivers() = receivers;
                outlets
            }
        };

        let token = CancellationToken::new();
        let (reporter, sink) = ErrorSink::new(
            config.error_buffer_size.max(1),
            outlets.errors_tx,
            Arc::clone(&self.stats),
        );
        let drain = sink.spawn(token.clone());
        let flush = AggregationPipeline::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.stats),
            outlets.metrics_tx,
            reporter.clone(),
            config.flush_interval(),
            config.collect_timeout(),
        )
        .spawn(token.clone());

        let mut run = Run {
            token,
            reporter,
            flush,
            drain,
            collectors: HashMap::new(),
        };
        for (name, collector) in self.registry.snapshot_enabled().await {
            let task = self.spawn_collector(&run, name.clone(), collector);
            run.collectors.insert(name, task);
        }

        info!(
            "Collector manager started with {} collectors",
            run.collectors.len()
        );
        lifecycle.run = Some(run);
        self.set_state(ManagerState::Running);
        Ok(())
    }

    fn spawn_collector(&self, run: &Run, name: String, collector: SharedCollector) -> CollectorTask {
        let token = run.token.child_token();
        let task_token = token.clone();
        let reporter = run.reporter.clone();
        let stats = Arc::clone(&self.stats);
        let registry = Arc::clone(&self.registry);

        let handle = tokio::spawn(async move {
            debug!("Starting collector {}", name);
            match collector.start(task_token).await {
                Ok(()) | Err(CollectError::Cancelled) => {
                    debug!("Collector {} task exited", name);
                }
                Err(e) => {
                    warn!("Collector {} failed to start: {}", name, e);
                    let recorded = registry
                        .while_registered(&name, &collector, || {
                            stats.record_start_error(&name, &e)
                        })
                        .await;
                    if recorded.is_some() {
                        reporter.report(CollectorError::start(name, e));
                    }
                }
            }
        });
        CollectorTask { token, handle }
    }

    /// Stop collection and close both channels
    ///
    /// Every collector's `stop()` is called even if an earlier one fails.
    /// Tasks still running after the shutdown timeout are detached with a
    /// warning. Stopping a manager that is not running is a no-op.
    ///
    /// # Errors
    ///
    /// `StopFailed` for the first collector whose `stop()` failed. The manager
    /// is stopped regardless.
    pub async fn stop(&self) -> Result<(), ManagerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(run) = lifecycle.run.take() else {
            debug!("Collector manager is not running");
            return Ok(());
        };
        info!("Stopping collector manager");
        run.token.cancel();

        let mut first_error = None;
        for (name, collector) in self.registry.list().await {
            let was_enabled = collector.is_enabled();
            match collector.stop() {
                Ok(()) if was_enabled => {
                    lifecycle.suspended.insert(name);
                }
                Ok(()) => {}
                Err(source) => {
                    warn!("Failed to stop collector {}: {}", name, source);
                    if first_error.is_none() {
                        first_error = Some(ManagerError::StopFailed { name, source });
                    }
                }
            }
        }

        let config = self.config.read().await.clone();
        let deadline = Instant::now() + config.shutdown_timeout();
        let Run {
            flush,
            drain,
            collectors,
            ..
        } = run;
        for (name, task) in collectors {
            join_until(deadline, &format!("collector {}", name), task.handle).await;
        }
        join_until(deadline, "flush loop", flush).await;
        join_until(deadline, "error drain", drain).await;

        // The old senders are gone with the tasks; prepare the next run
        let (outlets, receivers) = channels(&config);
        lifecycle.outlets = Some(outlets);
        *self.receivers() = receivers;

        self.set_state(ManagerState::Stopped);
        info!("Collector manager stopped");
        first_error.map_or(Ok(()), Err)
    }

    /// Stop, initialize and start again
    ///
    /// # Errors
    ///
    /// `Restart` wrapping the error of the first step that failed.
    pub async fn restart(&self) -> Result<(), ManagerError> {
        info!("Restarting collector manager");
        self.stop()
            .await
            .map_err(|e| restart_error(RestartStep::Stop, e))?;
        self.initialize()
            .await
            .map_err(|e| restart_error(RestartStep::Initialize, e))?;
        self.start()
            .await
            .map_err(|e| restart_error(RestartStep::Start, e))
    }

    /// Register a collector; while running an enabled one is started at once
    pub async fn add_collector(&self, collector: SharedCollector) -> Result<(), ManagerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let name = collector.name().to_string();
        self.registry.add(Arc::clone(&collector)).await?;
        info!("Added collector {}", name);

        if let Some(run) = lifecycle.run.as_mut() {
            if collector.is_enabled() {
                let task = self.spawn_collector(run, name.clone(), collector);
                run.collectors.insert(name, task);
            }
        }
        Ok(())
    }

    /// Stop and unregister a collector, cancelling its task
    ///
    /// # Errors
    ///
    /// `NotFound`, or `StopFailed` in which case the collector stays registered.
    pub async fn remove_collector(&self, name: &str) -> Result<(), ManagerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        self.registry.remove(name).await?;
        lifecycle.suspended.remove(name);

        let task = lifecycle
            .run
            .as_mut()
            .and_then(|run| run.collectors.remove(name));
        if let Some(task) = task {
            self.cancel_task(name, task).await;
        }
        self.stats.forget(name);
        Ok(())
    }

    /// Enable a collector, starting its task if running
    ///
    /// Enabling a collector that is already enabled is a no-op.
    pub async fn enable_collector(&self, name: &str) -> Result<(), ManagerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let (collector, was_enabled) = self.registry.enable(name).await?;
        if was_enabled {
            debug!("Collector {} is already enabled", name);
            return Ok(());
        }

        if let Some(run) = lifecycle.run.as_mut() {
            let alive = run
                .collectors
                .get(name)
                .is_some_and(CollectorTask::is_alive);
            if !alive {
                let task = self.spawn_collector(run, name.to_string(), collector);
                run.collectors.insert(name.to_string(), task);
            }
        }
        Ok(())
    }

    /// Disable a collector and cancel its task; `stop()` is not called
    pub async fn disable_collector(&self, name: &str) -> Result<(), ManagerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        self.registry.disable(name).await?;
        lifecycle.suspended.remove(name);

        let task = lifecycle
            .run
            .as_mut()
            .and_then(|run| run.collectors.remove(name));
        if let Some(task) = task {
            self.cancel_task(name, task).await;
        }
        Ok(())
    }

    // Bounded by one flush interval
    async fn cancel_task(&self, name: &str, task: CollectorTask) {
        task.token.cancel();
        let bound = self.config.read().await.flush_interval();
        join_until(
            Instant::now() + bound,
            &format!("collector {}", name),
            task.handle,
        )
        .await;
    }

    pub async fn get_collector(&self, name: &str) -> Result<SharedCollector, ManagerError> {
        self.registry.get(name).await
    }

    /// Copy of the registry; mutating it does not affect the manager
    pub async fn list_collectors(&self) -> HashMap<String, SharedCollector> {
        self.registry.list().await
    }

    /// Probe every enabled collector, reporting all failures together
    pub async fn health(&self) -> Result<(), HealthCheckError> {
        let collectors: Vec<(String, SharedCollector)> =
            self.registry.list().await.into_iter().collect();
        self.health.check(&collectors)
    }

    pub async fn stats(&self) -> ManagerStats {
        let collectors = self.registry.list().await;
        let collector_stats: HashMap<String, CollectorStats> = collectors
            .iter()
            .map(|(name, collector)| {
                let stats =
                    self.health
                        .collector_stats(name, collector.as_ref(), self.stats.counters(name));
                (name.clone(), stats)
            })
            .collect();
        let pipeline = self.stats.pipeline();
        let state = self.state();

        ManagerStats {
            running: state == ManagerState::Running,
            state,
            collector_count: collectors.len(),
            enabled_count: collectors.values().filter(|c| c.is_enabled()).count(),
            total_metrics: self.stats.total_metrics(),
            total_errors: self.stats.total_errors(),
            dropped_batches: pipeline.dropped_batches(),
            dropped_metrics: pipeline.dropped_metrics(),
            dropped_errors: pipeline.dropped_errors(),
            flush_ticks: pipeline.ticks(),
            collector_stats,
            last_update_time: Utc::now(),
        }
    }

    pub async fn collector_stats(&self, name: &str) -> Result<CollectorStats, ManagerError> {
        let collector = self.registry.get(name).await?;
        Ok(self
            .health
            .collector_stats(name, collector.as_ref(), self.stats.counters(name)))
    }

    /// Take the receiving end of the metrics channel for the current run
    ///
    /// Returns `None` once taken; a fresh receiver is available after `stop()`.
    pub fn metrics_receiver(&self) -> Option<mpsc::Receiver<Vec<Metric>>> {
        self.receivers().metrics.take()
    }

    /// Take the receiving end of the error channel for the current run
    pub fn error_receiver(&self) -> Option<mpsc::Receiver<CollectorError>> {
        self.receivers().errors.take()
    }

    /// Poll every enabled collector once, outside the flush loop
    ///
    /// Stats are not updated and nothing is sent on the channels.
    ///
    /// # Errors
    ///
    /// `CollectOnceError` with the successful batches and every failure.
    pub async fn collect_once(&self) -> Result<HashMap<String, Vec<Metric>>, CollectOnceError> {
        let timeout = self.config.read().await.collect_timeout();
        let token = CancellationToken::new();

        let mut collected = HashMap::new();
        let mut failures = Vec::new();
        for (name, collector) in self.registry.snapshot_enabled().await {
            match collect_bounded(collector.as_ref(), &token, timeout).await {
                Ok(batch) => {
                    collected.insert(name, batch);
                }
                Err(e) => failures.push(CollectorError::collect(name, e)),
            }
        }

        if failures.is_empty() {
            return Ok(collected);
        }
        failures.sort_by(|a, b| a.collector.cmp(&b.collector));
        Err(CollectOnceError {
            collected,
            failures,
        })
    }

    pub async fn get_config(&self) -> ManagerConfig {
        self.config.read().await.clone()
    }

    /// Replace the configuration while not running
    ///
    /// The pending channels are re-created with the new buffer sizes; a
    /// receiver taken earlier observes end-of-stream.
    ///
    /// # Errors
    ///
    /// `ConfigLockedWhileRunning` or `Config`; the previous config is kept.
    pub async fn update_config(&self, config: ManagerConfig) -> Result<(), ManagerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.run.is_some() {
            return Err(ManagerError::ConfigLockedWhileRunning);
        }
        config.validate()?;

        let (outlets, receivers) = channels(&config);
        *self.config.write().await = config;
        lifecycle.outlets = Some(outlets);
        *self.receivers() = receivers;
        info!("Configuration updated");
        Ok(())
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        if let Some(run) = self.lifecycle.get_mut().run.as_ref() {
            run.token.cancel();
        }
    }
}

fn restart_error(step: RestartStep, source: ManagerError) -> ManagerError {
    ManagerError::Restart {
        step,
        source: Box::new(source),
    }
}

/// Wait for a task until `deadline`
///
/// A task still running afterwards is detached, not aborted; it exits on its
/// own once it observes the cancelled token.
async fn join_until(deadline: Instant, what: &str, handle: JoinHandle<()>) {
    match tokio::time::timeout_at(deadline, handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("{} ended abnormally: {}", what, e),
        Err(_) => warn!("{} still running after shutdown timeout, detaching it", what),
    }
}
