//! Worker pool - where batches get processed, committed or dead-lettered
//!
//! N workers share one bounded batch channel; whichever worker is idle
//! takes the next batch. A batch runs through the handler with retries,
//! and only a fully successful batch commits its offsets. A batch that
//! exhausts its retries fans out per message to the error callback and the
//! dead-letter sink, and commits nothing - the source redelivers those
//! offsets after a restart or rebalance.

use super::batch::Batch;
use super::cursor::CommitCursor;
use super::{dlq, ConsumerConfig, ErrorHandler};
use crate::error::EngineError;
use std::collections::HashMap;
use std::sync::Arc;
use sulake_core::{
    DeadLetterSink, HandlerError, MessageHandler, MessageSource, MetricsSink, ProcessStatus,
    TopicPartition,
};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

/// Everything a worker needs, shared across the pool.
pub(crate) struct WorkerContext {
    pub(crate) config: Arc<ConsumerConfig>,
    pub(crate) source: Arc<dyn MessageSource>,
    pub(crate) handler: Arc<dyn MessageHandler>,
    pub(crate) dead_letter: Option<Arc<dyn DeadLetterSink>>,
    pub(crate) metrics: Arc<dyn MetricsSink>,
    pub(crate) error_handler: ErrorHandler,
    pub(crate) cursor: Arc<CommitCursor>,
    /// Serializes the filter-then-commit step across workers. Without it,
    /// a slow batch could commit behind a faster one and drag the broker
    /// offset backwards even though the cursor itself never regresses.
    pub(crate) commit_gate: Mutex<()>,
}

/// One worker: take batches off the shared queue until it closes.
pub(crate) async fn run(
    worker_id: usize,
    ctx: Arc<WorkerContext>,
    queue: Arc<Mutex<mpsc::Receiver<Batch>>>,
) {
    tracing::debug!(worker_id, "worker started");
    loop {
        let batch = {
            let mut rx = queue.lock().await;
            rx.recv().await
        };
        match batch {
            Some(batch) => process_batch(worker_id, &ctx, batch).await,
            // Channel closed by the poll loop after its final flush.
            None => break,
        }
    }
    tracing::debug!(worker_id, "worker stopped");
}

async fn process_batch(worker_id: usize, ctx: &WorkerContext, batch: Batch) {
    let started = Instant::now();
    match run_with_retries(ctx, &batch).await {
        Ok(attempt) => {
            if let Some(topic) = batch.first_topic() {
                ctx.metrics.observe_processing(
                    topic.as_str(),
                    "batch_processing",
                    started.elapsed().as_secs_f64(),
                );
            }
            if attempt > 0 {
                tracing::info!(
                    worker_id,
                    batch = %batch.id(),
                    attempts = attempt + 1,
                    "batch succeeded after retries"
                );
            }
            commit(ctx, &batch).await;
            for (partition, count) in batch.partition_counts() {
                ctx.metrics.incr_processed(
                    partition.topic.as_str(),
                    partition.partition,
                    ProcessStatus::Success,
                    count,
                );
            }
        }
        Err(err) => {
            let err = EngineError::from(err);
            tracing::error!(
                worker_id,
                batch = %batch.id(),
                size = batch.len(),
                error = %err,
                "batch failed after all retries, dead-lettering"
            );
            for message in batch.messages() {
                (ctx.error_handler)(&err, message);
                if let Some(sink) = &ctx.dead_letter {
                    if let Err(dlq_err) =
                        dlq::publish(sink.as_ref(), &ctx.config, message, &err).await
                    {
                        tracing::warn!(
                            partition = %message.topic_partition(),
                            offset = message.offset,
                            error = %dlq_err,
                            "dead-letter publish failed"
                        );
                    }
                }
            }
            for (partition, count) in batch.partition_counts() {
                ctx.metrics.incr_processed(
                    partition.topic.as_str(),
                    partition.partition,
                    ProcessStatus::Error,
                    count,
                );
            }
            // No commit: these offsets stay uncommitted so the source
            // redelivers them after a restart.
        }
    }
}

/// Run the handler until it succeeds or retries are exhausted. Returns the
/// attempt index that succeeded (0 = first try).
async fn run_with_retries(ctx: &WorkerContext, batch: &Batch) -> Result<u32, HandlerError> {
    let max_retries = ctx.config.retry.max_retries;
    let mut attempt = 0u32;
    loop {
        let delay = ctx.config.retry.delay_for_attempt(attempt);
        if !delay.is_zero() {
            tracing::debug!(batch = %batch.id(), attempt, delay = ?delay, "retry backoff");
            tokio::time::sleep(delay).await;
        }
        match ctx.handler.handle(batch.messages()).await {
            Ok(()) => return Ok(attempt),
            Err(err) if attempt < max_retries => {
                tracing::warn!(
                    batch = %batch.id(),
                    attempt = attempt + 1,
                    max_attempts = max_retries + 1,
                    error = %err,
                    "batch attempt failed, retrying"
                );
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Commit the batch's next-offsets, filtered through the cursor so a batch
/// that completed out of order cannot regress a partition.
async fn commit(ctx: &WorkerContext, batch: &Batch) {
    let next_offsets = batch.next_offsets();
    if next_offsets.is_empty() {
        return;
    }
    let _gate = ctx.commit_gate.lock().await;
    let to_commit: HashMap<TopicPartition, i64> = next_offsets
        .into_iter()
        .filter(|(partition, next)| ctx.cursor.would_advance(partition, *next))
        .collect();
    if to_commit.is_empty() {
        tracing::debug!(batch = %batch.id(), "offsets already superseded, nothing to commit");
        return;
    }
    match ctx.source.commit(&to_commit).await {
        Ok(()) => {
            for (partition, next) in &to_commit {
                ctx.cursor.advance(*partition, *next);
            }
            tracing::debug!(
                batch = %batch.id(),
                partitions = to_commit.len(),
                "offsets committed"
            );
        }
        Err(err) => {
            // Absorbed: the broker keeps the previous offsets and
            // redelivery covers the gap.
            tracing::warn!(batch = %batch.id(), error = %err, "offset commit failed");
        }
    }
}
