//! Scriptable collector used by the unit tests

use crate::collector::{BoxFuture, Collector};
use crate::error::CollectError;
use crate::metric::{Category, Metric};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct TestCollector {
    name: String,
    category: Category,
    interval: Duration,
    enabled: AtomicBool,
    gauges: Vec<(String, f64)>,
    fail_on_calls: HashSet<usize>,
    always_fail: bool,
    collect_delay: Option<Duration>,
    fail_stop: bool,
    health_error: Option<String>,
    start_error: Option<String>,
    collect_calls: AtomicUsize,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    running_loops: AtomicUsize,
}

impl TestCollector {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            category: Category::System,
            interval: Duration::from_millis(50),
            enabled: AtomicBool::new(true),
            gauges: Vec::new(),
            fail_on_calls: HashSet::new(),
            always_fail: false,
            collect_delay: None,
            fail_stop: false,
            health_error: None,
            start_error: None,
            collect_calls: AtomicUsize::new(0),
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            running_loops: AtomicUsize::new(0),
        }
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    pub fn with_gauge(mut self, name: &str, value: f64) -> Self {
        self.gauges.push((name.to_string(), value));
        self
    }

    /// Fail on the given 1-based `collect()` call
    pub fn failing_on_call(mut self, call: usize) -> Self {
        self.fail_on_calls.insert(call);
        self
    }

    pub fn always_failing(mut self) -> Self {
        self.always_fail = true;
        self
    }

    pub fn with_collect_delay(mut self, delay: Duration) -> Self {
        self.collect_delay = Some(delay);
        self
    }

    pub fn failing_stop(mut self) -> Self {
        self.fail_stop = true;
        self
    }

    pub fn unhealthy(mut self, message: &str) -> Self {
        self.health_error = Some(message.to_string());
        self
    }

    pub fn failing_start(mut self, message: &str) -> Self {
        self.start_error = Some(message.to_string());
        self
    }

    pub fn disabled(self) -> Self {
        self.enabled.store(false, Ordering::SeqCst);
        self
    }

    pub fn collect_calls(&self) -> usize {
        self.collect_calls.load(Ordering::SeqCst)
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// Number of `start` loops currently alive
    pub fn running_loops(&self) -> usize {
        self.running_loops.load(Ordering::SeqCst)
    }
}

impl Collector for TestCollector {
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

    fn start<'a>(&'a self, token: CancellationToken) -> BoxFuture<'a, Result<(), CollectError>> {
        Box::pin(async move {
            self.start_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(message) = &self.start_error {
                return Err(CollectError::Unavailable(message.clone()));
            }
            self.running_loops.fetch_add(1, Ordering::SeqCst);
            token.cancelled().await;
            self.running_loops.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn stop(&self) -> Result<(), CollectError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop {
            return Err(CollectError::Failed("stop refused".to_string()));
        }
        self.set_enabled(false);
        Ok(())
    }

    fn health(&self) -> Result<(), CollectError> {
        match &self.health_error {
            Some(message) => Err(CollectError::Unavailable(message.clone())),
            None => Ok(()),
        }
    }

    fn collect<'a>(
        &'a self,
        token: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Vec<Metric>, CollectError>> {
        Box::pin(async move {
            let call = self.collect_calls.fetch_add(1, Ordering::SeqCst) + 1;

            if let Some(delay) = self.collect_delay {
                tokio::select! {
                    _ = token.cancelled() => return Err(CollectError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            if self.always_fail || self.fail_on_calls.contains(&call) {
                return Err(CollectError::Failed(format!("call {} failed", call)));
            }

            Ok(self
                .gauges
                .iter()
                .map(|(name, value)| {
                    Metric::gauge(name.clone(), *value, self.category).with_source(&self.name)
                })
                .collect())
        })
    }
}
