//! Bounded sink for non-fatal collector errors
//!
//! Producers (the flush loop and collector tasks) report through an
//! [`ErrorReporter`] that never blocks. A single drain task logs every error
//! and forwards it to the public error channel.

use crate::error::CollectorError;
use crate::stats::StatsTracker;
use log::{debug, error, warn};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Non-blocking handle used to report collector errors
#[derive(Clone)]
pub struct ErrorReporter {
    tx: mpsc::Sender<CollectorError>,
    stats: Arc<StatsTracker>,
}

impl ErrorReporter {
    /// Queue an error for the drain task, dropping it if the sink is full
    pub fn report(&self, err: CollectorError) {
        match self.tx.try_send(err) {
            Ok(()) => {}
            Err(TrySendError::Full(err)) => {
                self.stats.pipeline().record_dropped_error();
                warn!("Error channel full, dropping error: {}", err);
            }
            Err(TrySendError::Closed(err)) => {
                debug!("Error sink closed, dropping error: {}", err);
            }
        }
    }
}

/// Bounded error channel plus its drain task
pub struct ErrorSink {
    rx: mpsc::Receiver<CollectorError>,
    forward: mpsc::Sender<CollectorError>,
    stats: Arc<StatsTracker>,
}

impl ErrorSink {
    /// Create the sink and the reporter feeding it
    ///
    /// Drained errors are forwarded to `forward`, the public error channel.
    pub fn new(
        capacity: usize,
        forward: mpsc::Sender<CollectorError>,
        stats: Arc<StatsTracker>,
    ) -> (ErrorReporter, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        let reporter = ErrorReporter {
            tx,
            stats: Arc::clone(&stats),
        };
        (reporter, Self { rx, forward, stats })
    }

    /// Spawn the drain task; it exits once `token` is cancelled
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(token))
    }

    async fn run(mut self, token: CancellationToken) {
        debug!("Error drain task started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                received = self.rx.recv() => match received {
                    Some(err) => self.handle(err),
                    None => break,
                },
            }
        }

        // Whatever was queued before cancellation is still delivered
        while let Ok(err) = self.rx.try_recv() {
            self.handle(err);
        }
        debug!("Error drain task stopped");
    }

    fn handle(&self, err: CollectorError) {
        error!("{}", err);
        match self.forward.try_send(err) {
            Ok(()) => {}
            Err(TrySendError::Full(err)) => {
                self.stats.pipeline().record_dropped_error();
                debug!("Public error channel full, dropping: {}", err);
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CollectError;
    use std::time::Duration;

    fn failure(name: &str) -> CollectorError {
        CollectorError::collect(name, CollectError::Failed("boom".to_string()))
    }

    #[tokio::test]
    async fn test_errors_are_forwarded() {
        let stats = Arc::new(StatsTracker::new());
        let (forward_tx, mut forward_rx) = mpsc::channel(8);
        let (reporter, sink) = ErrorSink::new(8, forward_tx, Arc::clone(&stats));
        let token = CancellationToken::new();
        let handle = sink.spawn(token.clone());

        reporter.report(failure("mem"));
        let received = tokio::time::timeout(Duration::from_secs(1), forward_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.collector, "mem");

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_full_sink_drops_and_counts() {
        let stats = Arc::new(StatsTracker::new());
        let (forward_tx, _forward_rx) = mpsc::channel(8);
        let (reporter, _sink) = ErrorSink::new(1, forward_tx, Arc::clone(&stats));

        // Nothing drains the sink, so only the first report fits
        reporter.report(failure("a"));
        reporter.report(failure("b"));
        reporter.report(failure("c"));

        assert_eq!(stats.pipeline().dropped_errors(), 2);
    }

    #[tokio::test]
    async fn test_slow_consumer_does_not_block_drain() {
        let stats = Arc::new(StatsTracker::new());
        let (forward_tx, mut forward_rx) = mpsc::channel(1);
        let (reporter, sink) = ErrorSink::new(8, forward_tx, Arc::clone(&stats));
        let token = CancellationToken::new();

        for name in ["a", "b", "c"] {
            reporter.report(failure(name));
        }
        token.cancel();
        // Cancelled before start: the queued errors are still drained on exit
        sink.spawn(token).await.unwrap();

        assert_eq!(forward_rx.recv().await.unwrap().collector, "a");
        assert_eq!(stats.pipeline().dropped_errors(), 2);
    }

    #[tokio::test]
    async fn test_drain_exits_when_reporters_are_gone() {
        let stats = Arc::new(StatsTracker::new());
        let (forward_tx, mut forward_rx) = mpsc::channel(4);
        let (reporter, sink) = ErrorSink::new(4, forward_tx, stats);
        let handle = sink.spawn(CancellationToken::new());

        drop(reporter);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        // The sink owned the only forward sender, so the public channel is closed
        assert!(forward_rx.recv().await.is_none());
    }
}
