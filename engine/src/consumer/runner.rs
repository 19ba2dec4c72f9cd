//! The poll loop - single reader feeding the worker pool
//!
//! One task owns the source's read side. It polls, appends records to the
//! open batch in partition-sorted order, and seals a batch whenever the
//! size threshold is hit or the batch has been open for `batch_timeout`.
//! Sealed batches go down a bounded channel; when the
//! workers fall behind, the channel fills and the send blocks, which is
//! the backpressure that stops the loop from polling the source dry.
//!
//! Batches deliberately accumulate across polls and partitions: a trickle
//! of records per partition still fills size-`batch_size` batches instead
//! of stuttering through tiny per-poll ones.
//!
//! Poll errors are transient (log, back off, keep going) except a lost
//! connection, which terminates the loop; a supervisor owns the restart.

use super::batch::Batch;
use super::ConsumerConfig;
use crate::error::EngineError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use sulake_core::{ClientError, Message, MessageSource, TopicPartition};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// Wait after a transient poll error before polling again.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// State of the polling task.
pub(crate) struct PollRunner {
    config: Arc<ConsumerConfig>,
    source: Arc<dyn MessageSource>,
    batch_tx: mpsc::Sender<Batch>,
    shutdown: watch::Receiver<bool>,
    open: Vec<Message>,
    last_dispatch: Instant,
}

impl PollRunner {
    pub(crate) fn new(
        config: Arc<ConsumerConfig>,
        source: Arc<dyn MessageSource>,
        batch_tx: mpsc::Sender<Batch>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            source,
            batch_tx,
            shutdown,
            open: Vec::new(),
            last_dispatch: Instant::now(),
        }
    }

    /// Poll until shutdown or a fatal source error, then flush whatever is
    /// still open. Dropping `self` afterwards closes the batch channel,
    /// which is what lets the workers drain and exit.
    pub(crate) async fn run(mut self) -> Result<(), EngineError> {
        tracing::debug!(source = self.source.name(), "poll loop running");
        let result = self.poll_loop().await;

        if !self.open.is_empty() {
            tracing::info!(size = self.open.len(), "flushing open batch on shutdown");
            if let Err(e) = self.dispatch().await {
                tracing::warn!(error = %e, "failed to flush final batch");
            }
        }
        match &result {
            Ok(()) => tracing::info!("poll loop stopped"),
            Err(e) => tracing::error!(error = %e, "poll loop terminated"),
        }
        result
    }

    async fn poll_loop(&mut self) -> Result<(), EngineError> {
        loop {
            if *self.shutdown.borrow() {
                tracing::debug!("shutdown observed, leaving poll loop");
                return Ok(());
            }
            let polled = self
                .source
                .poll(self.config.batch_timeout, self.config.max_poll_records)
                .await;
            match polled {
                Ok(records) => {
                    if !records.is_empty() {
                        self.append(records).await?;
                    }
                    // Runs on empty polls too, and again after appending,
                    // so neither silence nor a slow trickle can hold a
                    // partial batch open past the timeout.
                    self.maybe_time_flush().await?;
                }
                Err(ClientError::Connection(msg)) => {
                    tracing::error!(
                        source = self.source.name(),
                        error = %msg,
                        "source connection lost, terminating poll loop"
                    );
                    return Err(EngineError::SourceConnection(msg));
                }
                Err(ClientError::Closed) => {
                    tracing::error!(
                        source = self.source.name(),
                        "source closed underneath the poll loop"
                    );
                    return Err(EngineError::SourceConnection("source closed".to_string()));
                }
                Err(err) => {
                    tracing::error!(
                        source = self.source.name(),
                        error = %err,
                        "poll failed, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                        _ = self.shutdown.changed() => {}
                    }
                }
            }
        }
    }

    /// Append polled records to the open batch in partition-sorted order,
    /// sealing a batch every time the size threshold is reached.
    async fn append(
        &mut self,
        mut records: HashMap<TopicPartition, Vec<Message>>,
    ) -> Result<(), EngineError> {
        let mut partitions: Vec<TopicPartition> = records.keys().copied().collect();
        partitions.sort_unstable();
        for partition in partitions {
            let Some(messages) = records.remove(&partition) else {
                continue;
            };
            for message in messages {
                self.open.push(message);
                if self.open.len() >= self.config.batch_size {
                    self.dispatch().await?;
                }
            }
        }
        Ok(())
    }

    async fn maybe_time_flush(&mut self) -> Result<(), EngineError> {
        if !self.open.is_empty() && self.last_dispatch.elapsed() >= self.config.batch_timeout {
            tracing::debug!(size = self.open.len(), "batch timeout reached, flushing");
            self.dispatch().await?;
        }
        Ok(())
    }

    /// Seal the open batch and hand it to the worker pool. Blocks when the
    /// pool is saturated; that backpressure is load-bearing.
    async fn dispatch(&mut self) -> Result<(), EngineError> {
        let batch = Batch::new(std::mem::take(&mut self.open));
        tracing::debug!(batch = %batch.id(), size = batch.len(), "dispatching batch");
        self.batch_tx
            .send(batch)
            .await
            .map_err(|_| EngineError::Shutdown("batch channel closed".to_string()))?;
        self.last_dispatch = Instant::now();
        Ok(())
    }
}
