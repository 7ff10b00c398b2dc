use crate::collector::{BoxFuture, Collector};
use crate::error::CollectError;
use crate::metric::{Category, Metric};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Collector backed by a plain closure
///
/// Handy for business KPIs and other values the application already has at
/// hand. Every returned metric is stamped with this collector's name as its
/// source and with its category. The collector reports unhealthy while its
/// most recent `collect()` failed.
///
/// # Example
///
/// ```
/// use collector_manager::collectors::FnCollector;
/// use collector_manager::metric::{Category, Metric};
/// use std::time::Duration;
///
/// let orders = FnCollector::new("orders", Category::Business, Duration::from_secs(30), || {
///     Ok(vec![Metric::counter("orders.total", 1234.0, Category::Business)])
/// });
/// ```
pub struct FnCollector<F> {
    name: String,
    category: Category,
    interval: Duration,
    enabled: AtomicBool,
    last_error: Mutex<Option<String>>,
    sample: F,
}

impl<F> FnCollector<F>
where
    F: Fn() -> Result<Vec<Metric>, CollectError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, category: Category, interval: Duration, sample: F) -> Self {
        Self {
            name: name.into(),
            category,
            interval,
            enabled: AtomicBool::new(true),
            last_error: Mutex::new(None),
            sample,
        }
    }
}

impl<F> Collector for FnCollector<F>
where
    F: Fn() -> Result<Vec<Metric>, CollectError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> Category {
        self.category
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

    fn start<'a>(&'a self, _token: CancellationToken) -> BoxFuture<'a, Result<(), CollectError>> {
        // Sampling happens on demand only
        Box::pin(async { Ok(()) })
    }

    fn stop(&self) -> Result<(), CollectError> {
        self.set_enabled(false);
        Ok(())
    }

    fn health(&self) -> Result<(), CollectError> {
        match &*self.last_error.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(message) => Err(CollectError::Unavailable(message.clone())),
            None => Ok(()),
        }
    }

    fn collect<'a>(
        &'a self,
        token: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Vec<Metric>, CollectError>> {
        Box::pin(async move {
            if token.is_cancelled() {
                return Err(CollectError::Cancelled);
            }
            let result = (self.sample)().map(|metrics| {
                metrics
                    .into_iter()
                    .map(|mut metric| {
                        metric.source = self.name.clone();
                        metric.category = self.category;
                        metric
                    })
                    .collect::<Vec<_>>()
            });

            *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) =
                result.as_ref().err().map(ToString::to_string);
            result
        })
    }
}
