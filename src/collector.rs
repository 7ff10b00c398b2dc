//! Capability contract every telemetry source implements
//!
//! The manager only ever talks to collectors through [`Collector`]. Concrete
//! sources (OS metrics, SQL or Redis introspection, business KPIs) live behind
//! it and are built from configuration by a [`CollectorFactory`].

use crate::config::CategoryConfig;
use crate::error::CollectError;
use crate::metric::{Category, Metric};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Boxed future returned by the async collector methods
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Shared handle to a registered collector
pub type SharedCollector = Arc<dyn Collector>;

/// Trait for telemetry sources driven by the manager
///
/// Implementations must be cheap to share: the manager holds them behind an
/// `Arc` and may call `collect` from the flush loop while `start` is running
/// on another task.
pub trait Collector: Send + Sync {
    /// Unique registry key
    fn name(&self) -> &str;

    fn category(&self) -> Category;

    /// The collector's own cadence, used by its `start` loop
    fn interval(&self) -> Duration;

    fn is_enabled(&self) -> bool;

    fn set_enabled(&self, enabled: bool);

    /// Run the collector's background loop until `token` is cancelled
    ///
    /// The loop is optional; a collector with nothing to do in the background
    /// may return `Ok(())` immediately.
    fn start<'a>(&'a self, token: CancellationToken) -> BoxFuture<'a, Result<(), CollectError>>;

    /// Release resources and mark the collector disabled. Must be idempotent.
    fn stop(&self) -> Result<(), CollectError>;

    /// Cheap health probe; expensive probes should be served from a
    /// [`HealthCache`](crate::health::HealthCache)
    fn health(&self) -> Result<(), CollectError>;

    /// Produce one batch of metrics
    ///
    /// Must return within a bounded time and honour `token` cancellation.
    /// Metric order inside the batch is preserved through the pipeline.
    fn collect<'a>(
        &'a self,
        token: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Vec<Metric>, CollectError>>;
}

/// Everything a factory needs to build the collector of one category
#[derive(Debug, Clone)]
pub struct CollectorSpec<'a> {
    /// Registry name for the new collector
    pub name: String,
    pub category: Category,
    /// Resolved interval (category interval or the global one)
    pub interval: Duration,
    /// Category settings with global labels already merged in
    pub config: &'a CategoryConfig,
}

/// Builds collectors for a category during `initialize()`
pub trait CollectorFactory: Send + Sync {
    fn build(&self, spec: &CollectorSpec<'_>) -> Result<SharedCollector, CollectError>;
}

impl<F> CollectorFactory for F
where
    F: Fn(&CollectorSpec<'_>) -> Result<SharedCollector, CollectError> + Send + Sync,
{
    fn build(&self, spec: &CollectorSpec<'_>) -> Result<SharedCollector, CollectError> {
        self(spec)
    }
}
