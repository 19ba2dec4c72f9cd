//! Periodic consumer-lag sampling
//!
//! A detached task that asks the source for its assigned partitions and
//! their end offsets, subtracts what the commit cursor says this group has
//! committed, and exports the difference per partition. Lag is the one
//! number that tells an operator whether the consumer is keeping up, so
//! the task keeps running through sampling errors - it just backs off
//! harder before trying again.

use super::cursor::CommitCursor;
use std::sync::Arc;
use std::time::Duration;
use sulake_core::{ClientError, MessageSource, MetricsSink};
use tokio::sync::watch;

/// Wait after a failed sampling round before the next attempt.
const ERROR_BACKOFF: Duration = Duration::from_secs(60);

/// Detached lag-sampling task state
pub(crate) struct LagMonitor {
    source: Arc<dyn MessageSource>,
    cursor: Arc<CommitCursor>,
    metrics: Arc<dyn MetricsSink>,
    group: String,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl LagMonitor {
    pub(crate) fn new(
        source: Arc<dyn MessageSource>,
        cursor: Arc<CommitCursor>,
        metrics: Arc<dyn MetricsSink>,
        group: String,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            source,
            cursor,
            metrics,
            group,
            interval,
            shutdown,
        }
    }

    /// Sample immediately, then on every interval tick until shutdown.
    /// Every await is raced against the shutdown watch so a hung source
    /// cannot pin the task past stop().
    pub(crate) async fn run(self) {
        tracing::debug!(group = %self.group, interval = ?self.interval, "lag monitor started");
        // Race the watch through its own handle so sampling can keep
        // borrowing the rest of the monitor.
        let mut shutdown = self.shutdown.clone();
        loop {
            let delay = tokio::select! {
                result = self.sample() => match result {
                    Ok(()) => self.interval,
                    Err(e) => {
                        tracing::warn!(
                            source = self.source.name(),
                            error = %e,
                            "lag sampling failed"
                        );
                        ERROR_BACKOFF
                    }
                },
                _ = shutdown.changed() => break,
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }
        tracing::debug!(group = %self.group, "lag monitor stopped");
    }

    async fn sample(&self) -> Result<(), ClientError> {
        let partitions = self.source.assigned_partitions().await?;
        if partitions.is_empty() {
            return Ok(());
        }
        let ends = self.source.end_offsets(&partitions).await?;
        for partition in partitions {
            // A partition the source could not report ends for this round
            // is skipped, not zeroed; the stale gauge is closer to truth.
            let Some(&end) = ends.get(&partition) else {
                continue;
            };
            let committed = self.cursor.position(&partition).unwrap_or(0);
            let lag = end - committed;
            self.metrics
                .set_lag(partition.topic.as_str(), partition.partition, &self.group, lag);
            tracing::trace!(
                partition = %partition,
                end,
                committed,
                lag,
                "lag sampled"
            );
        }
        Ok(())
    }
}
