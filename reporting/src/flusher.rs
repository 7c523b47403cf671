use crate::aggregator::ReportingAggregator;
use crate::metrics_defs::REPORTING_FLUSH_DURATION;
use shared::histogram;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Background task flushing the aggregator. The next flush is scheduled once the current
/// one completes, one period after it started.
pub struct FlushTask {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl FlushTask {
    pub fn spawn(aggregator: Arc<ReportingAggregator>, period: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut delay = period;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        let started = Instant::now();
                        let summary = aggregator.flush().await;
                        let elapsed = started.elapsed();
                        histogram!(REPORTING_FLUSH_DURATION).record(elapsed.as_secs_f64());
                        if summary.sent + summary.failed > 0 {
                            tracing::debug!(sent = summary.sent, failed = summary.failed, "Flushed usage report");
                        }
                        delay = period.saturating_sub(elapsed);
                    }
                    _ = &mut shutdown_rx => {
                        let summary = aggregator.flush().await;
                        tracing::info!(sent = summary.sent, failed = summary.failed, "Final usage report flushed");
                        break;
                    }
                }
            }
        });

        FlushTask {
            shutdown_tx,
            handle,
        }
    }

    /// Stops the task after one last flush.
    pub async fn shutdown(self) {
        if self.shutdown_tx.send(()).is_err() {
            tracing::debug!("Flush task already stopped");
        }
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "Flush task terminated abnormally");
        }
    }
}
