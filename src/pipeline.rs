//! Ticker-driven flush loop
//!
//! On every tick the pipeline polls each enabled collector once and fans the
//! results out: batches to the metrics channel, failures to the error sink.
//! Both hand-offs are non-blocking; when a consumer falls behind the newest
//! data is dropped and counted, so the monitored process never waits on its
//! own monitoring.

use crate::collector::{Collector, SharedCollector};
use crate::error::{CollectError, CollectorError};
use crate::error_sink::ErrorReporter;
use crate::metric::Metric;
use crate::registry::CollectorRegistry;
use crate::stats::StatsTracker;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Call `collect()` bounded by `timeout` and by cancellation of `token`
pub async fn collect_bounded(
    collector: &dyn Collector,
    token: &CancellationToken,
    timeout: Duration,
) -> Result<Vec<Metric>, CollectError> {
    tokio::select! {
        _ = token.cancelled() => Err(CollectError::Cancelled),
        result = tokio::time::timeout(timeout, collector.collect(token)) => {
            result.unwrap_or(Err(CollectError::Timeout(timeout)))
        }
    }
}

/// The flush loop and everything it writes to
pub struct AggregationPipeline {
    registry: Arc<CollectorRegistry>,
    stats: Arc<StatsTracker>,
    metrics_tx: mpsc::Sender<Vec<Metric>>,
    errors: ErrorReporter,
    flush_interval: Duration,
    collect_timeout: Duration,
}

impl AggregationPipeline {
    pub fn new(
        registry: Arc<CollectorRegistry>,
        stats: Arc<StatsTracker>,
        metrics_tx: mpsc::Sender<Vec<Metric>>,
        errors: ErrorReporter,
        flush_interval: Duration,
        collect_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            stats,
            metrics_tx,
            errors,
            flush_interval,
            collect_timeout,
        }
    }

    /// Spawn the flush loop; it exits once `token` is cancelled
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(token))
    }

    async fn run(self, token: CancellationToken) {
        info!(
            "Flush loop started with interval {:?}, collect timeout {:?}",
            self.flush_interval, self.collect_timeout
        );
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; the first flush is one interval in
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => self.flush(&token).await,
            }
        }
        info!("Flush loop stopped");
    }

    /// Poll every enabled collector once
    ///
    /// The registry lock is only held while taking the snapshot.
    pub async fn flush(&self, token: &CancellationToken) {
        let collectors = self.registry.snapshot_enabled().await;
        debug!("Flushing {} collectors", collectors.len());

        for (name, collector) in collectors {
            if token.is_cancelled() {
                return;
            }
            self.flush_one(&name, &collector, token).await;
        }
        self.stats.pipeline().record_tick();
    }

    async fn flush_one(&self, name: &str, collector: &SharedCollector, token: &CancellationToken) {
        // Disabled between the snapshot and now
        if !collector.is_enabled() {
            return;
        }

        let result = collect_bounded(collector.as_ref(), token, self.collect_timeout).await;
        if matches!(result, Err(CollectError::Cancelled)) && token.is_cancelled() {
            debug!("Collection from {} interrupted by shutdown", name);
            return;
        }

        // Removed while collecting: its counters are already forgotten
        let recorded = self
            .registry
            .while_registered(name, collector, || match &result {
                Ok(batch) => self.stats.record_success(name, batch.len()),
                Err(e) => self.stats.record_collect_error(name, e),
            })
            .await;
        if recorded.is_none() {
            debug!("Collector {} was removed during collection, discarding result", name);
            return;
        }

        match result {
            Ok(batch) if batch.is_empty() => {}
            Ok(batch) => self.send_batch(name, batch),
            Err(e) => self.errors.report(CollectorError::collect(name, e)),
        }
    }

    fn send_batch(&self, name: &str, batch: Vec<Metric>) {
        match self.metrics_tx.try_send(batch) {
            Ok(()) => {}
            Err(TrySendError::Full(batch)) => {
                self.stats.pipeline().record_dropped_batch(batch.len());
                warn!(
                    "Metrics channel full, dropping {} metrics from {}",
                    batch.len(),
                    name
                );
            }
            Err(TrySendError::Closed(batch)) => {
                debug!(
                    "Metrics channel closed, dropping {} metrics from {}",
                    batch.len(),
                    name
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_sink::ErrorSink;
    use crate::stats::CollectorCounters;
    use crate::test_support::TestCollector;

    struct Harness {
        registry: Arc<CollectorRegistry>,
        stats: Arc<StatsTracker>,
        pipeline: AggregationPipeline,
        metrics_rx: mpsc::Receiver<Vec<Metric>>,
        sink: ErrorSink,
        errors_rx: mpsc::Receiver<CollectorError>,
    }

    fn harness(metrics_capacity: usize, collect_timeout: Duration) -> Harness {
        let registry = Arc::new(CollectorRegistry::new());
        let stats = Arc::new(StatsTracker::new());
        let (metrics_tx, metrics_rx) = mpsc::channel(metrics_capacity);
        let (errors_tx, errors_rx) = mpsc::channel(16);
        let (reporter, sink) = ErrorSink::new(16, errors_tx, Arc::clone(&stats));
        let pipeline = AggregationPipeline::new(
            Arc::clone(&registry),
            Arc::clone(&stats),
            metrics_tx,
            reporter,
            Duration::from_millis(20),
            collect_timeout,
        );
        Harness {
            registry,
            stats,
            pipeline,
            metrics_rx,
            sink,
            errors_rx,
        }
    }

    #[tokio::test]
    async fn test_flush_isolates_failing_collector() {
        let mut h = harness(8, Duration::from_secs(1));
        h.registry
            .add(Arc::new(TestCollector::new("cpu").with_gauge("cpu.usage", 42.0)))
            .await
            .unwrap();
        h.registry
            .add(Arc::new(TestCollector::new("bad").always_failing()))
            .await
            .unwrap();

        let token = CancellationToken::new();
        h.pipeline.flush(&token).await;
        h.pipeline.flush(&token).await;

        for _ in 0..2 {
            let batch = h.metrics_rx.try_recv().unwrap();
            assert_eq!(batch[0].name, "cpu.usage");
            assert_eq!(batch[0].value, 42.0);
        }
        assert_eq!(h.stats.counters("bad").error_count, 2);
        assert_eq!(h.stats.counters("bad").metrics_count, 0);
        assert_eq!(h.stats.counters("cpu").metrics_count, 2);
        assert_eq!(h.stats.pipeline().ticks(), 2);

        // The failures are queued in the sink; drain them
        let drain = CancellationToken::new();
        drain.cancel();
        h.sink.spawn(drain).await.unwrap();
        assert_eq!(h.errors_rx.try_recv().unwrap().collector, "bad");
        assert_eq!(h.errors_rx.try_recv().unwrap().collector, "bad");
    }

    #[tokio::test]
    async fn test_batch_order_is_preserved() {
        let mut h = harness(8, Duration::from_secs(1));
        h.registry
            .add(Arc::new(
                TestCollector::new("app")
                    .with_gauge("first", 1.0)
                    .with_gauge("second", 2.0)
                    .with_gauge("third", 3.0),
            ))
            .await
            .unwrap();

        h.pipeline.flush(&CancellationToken::new()).await;

        let names: Vec<String> = h
            .metrics_rx
            .try_recv()
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_empty_batches_are_not_sent() {
        let mut h = harness(8, Duration::from_secs(1));
        h.registry
            .add(Arc::new(TestCollector::new("quiet")))
            .await
            .unwrap();

        h.pipeline.flush(&CancellationToken::new()).await;

        assert!(h.metrics_rx.try_recv().is_err());
        assert_eq!(h.stats.counters("quiet").collect_count, 1);
    }

    #[tokio::test]
    async fn test_full_channel_drops_newest() {
        let mut h = harness(1, Duration::from_secs(1));
        h.registry
            .add(Arc::new(
                TestCollector::new("cpu")
                    .with_gauge("cpu.usage", 1.0)
                    .with_gauge("cpu.idle", 2.0),
            ))
            .await
            .unwrap();

        let token = CancellationToken::new();
        for _ in 0..3 {
            tokio::time::timeout(Duration::from_millis(500), h.pipeline.flush(&token))
                .await
                .expect("flush must not block on a full channel");
        }

        assert_eq!(h.stats.pipeline().dropped_batches(), 2);
        assert_eq!(h.stats.pipeline().dropped_metrics(), 4);
        assert!(h.metrics_rx.try_recv().is_ok());
        assert!(h.metrics_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disabled_collectors_are_not_polled() {
        let h = harness(8, Duration::from_secs(1));
        let collector = Arc::new(TestCollector::new("off").disabled());
        h.registry.add(collector.clone()).await.unwrap();

        h.pipeline.flush(&CancellationToken::new()).await;

        assert_eq!(collector.collect_calls(), 0);
    }

    #[tokio::test]
    async fn test_hung_collector_times_out() {
        let h = harness(8, Duration::from_millis(30));
        h.registry
            .add(Arc::new(
                TestCollector::new("slow").with_collect_delay(Duration::from_secs(10)),
            ))
            .await
            .unwrap();

        tokio::time::timeout(
            Duration::from_secs(1),
            h.pipeline.flush(&CancellationToken::new()),
        )
        .await
        .expect("flush is bounded by the collect timeout");

        let counters = h.stats.counters("slow");
        assert_eq!(counters.error_count, 1);
        assert!(counters.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_collector_removed_mid_collect_is_not_recorded() {
        let mut h = harness(8, Duration::from_secs(1));
        h.registry
            .add(Arc::new(
                TestCollector::new("slow")
                    .with_gauge("slow.value", 1.0)
                    .with_collect_delay(Duration::from_millis(100)),
            ))
            .await
            .unwrap();

        let token = CancellationToken::new();
        let remove = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            h.registry.remove("slow").await.unwrap();
        };
        tokio::join!(h.pipeline.flush(&token), remove);

        assert_eq!(h.stats.counters("slow"), CollectorCounters::default());
        assert_eq!(h.stats.total_metrics(), 0);
        assert!(h.metrics_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_run_loop_stops_on_cancel() {
        let h = harness(64, Duration::from_secs(1));
        h.registry
            .add(Arc::new(TestCollector::new("cpu").with_gauge("cpu.usage", 1.0)))
            .await
            .unwrap();
        let stats = Arc::clone(&h.stats);
        let token = CancellationToken::new();
        let handle = h.pipeline.spawn(token.clone());

        tokio::time::sleep(Duration::from_millis(110)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("flush loop exits within one tick")
            .unwrap();

        assert!(stats.pipeline().ticks() >= 2);
    }
}
