//! Batched stream consumer - poll, batch, process, commit, dead-letter
//!
//! ```text
//!   MessageSource ──poll──► poll loop ──bounded channel──► worker pool
//!                           (batching)                    │
//!                                              ┌──────────┼──────────┐
//!                                              ▼          ▼          ▼
//!                                           handler    commit     DLQ sink
//!                                          (retries)  (on success) (on defeat)
//! ```
//!
//! Delivery is at-least-once by construction: offsets are committed only
//! after the handler has succeeded on the whole batch, so a crash between
//! processing and commit replays records, never skips them. Batches span
//! partitions and accumulate across polls until `batch_size` or
//! `batch_timeout` seals them; the bounded channel between the poll loop
//! and the workers is the backpressure that keeps a slow handler from
//! buffering the world.
//!
//! A consumer runs once: [`BatchConsumer::start`] spawns the poll loop,
//! worker pool and lag monitor, and [`BatchConsumer::stop`] tears them
//! down in order. Create a new consumer to run again.

mod batch;
mod cursor;
mod dlq;
mod lag;
mod retry;
mod runner;
mod worker;

pub use batch::{Batch, BatchId};
pub use cursor::CommitCursor;
pub use dlq::{dlq_topic_for, DlqEnvelope, DlqOriginalMessage};
pub use retry::RetryPolicy;

use crate::error::{EngineError, Result};
use crate::metrics::NullMetrics;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use sulake_core::{
    DeadLetterSink, Message, MessageHandler, MessageSource, MetricsSink, TopicPartition,
};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Callback invoked once per message of a batch that exhausted its
/// retries, before the message is dead-lettered.
pub type ErrorHandler = Arc<dyn Fn(&EngineError, &Message) + Send + Sync>;

/// Consumer tuning knobs
///
/// The poll fields (`fetch_min_bytes`, `fetch_max_wait`,
/// `max_poll_interval`, `session_timeout`) are carried for the
/// [`MessageSource`] implementation to apply when it builds its client;
/// the engine itself reads the batching, worker, retry, dead-letter and
/// lag fields.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Broker bootstrap list, passed through to the source.
    pub bootstrap_servers: String,
    /// Consumer group id; also labels lag metrics and DLQ envelopes.
    pub group_id: String,
    /// Topics to subscribe to.
    pub topics: Vec<String>,
    /// Minimum bytes per fetch, traded against `fetch_max_wait`.
    pub fetch_min_bytes: usize,
    /// How long the broker may hold a fetch waiting for `fetch_min_bytes`.
    pub fetch_max_wait: Duration,
    /// Upper bound on records returned by one poll.
    pub max_poll_records: usize,
    /// Processing time allowed between polls before the group evicts us.
    pub max_poll_interval: Duration,
    /// Group session timeout.
    pub session_timeout: Duration,
    /// Records per sealed batch.
    pub batch_size: usize,
    /// Longest a partial batch stays open; doubles as the poll timeout.
    pub batch_timeout: Duration,
    /// Parallel batch workers.
    pub worker_count: usize,
    /// Retry policy for failed batches.
    pub retry: RetryPolicy,
    /// Whether defeated records go to a dead-letter topic.
    pub enable_dlq: bool,
    /// Dead-letter topic override; `None` derives `{topic}-dlq`.
    pub dlq_topic: Option<String>,
    /// Upper bound on one dead-letter publish.
    pub dlq_send_timeout: Duration,
    /// How often the lag monitor samples.
    pub lag_interval: Duration,
    /// How long stop() waits for the poll loop, and then the workers,
    /// before aborting them.
    pub shutdown_timeout: Duration,
}

impl ConsumerConfig {
    /// Config with production defaults for the given connection identity.
    pub fn new(
        bootstrap_servers: impl Into<String>,
        group_id: impl Into<String>,
        topics: Vec<String>,
    ) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            group_id: group_id.into(),
            topics,
            fetch_min_bytes: 65536,
            fetch_max_wait: Duration::from_millis(500),
            max_poll_records: 500,
            max_poll_interval: Duration::from_secs(300),
            session_timeout: Duration::from_secs(30),
            batch_size: 1000,
            batch_timeout: Duration::from_secs(5),
            worker_count: 4,
            retry: RetryPolicy::default(),
            enable_dlq: true,
            dlq_topic: None,
            dlq_send_timeout: Duration::from_secs(10),
            lag_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Builder for [`BatchConsumer`]
///
/// Source and handler are mandatory; a dead-letter sink is mandatory
/// while `enable_dlq` is set. Metrics default to a no-op sink and the
/// error callback defaults to structured logging.
pub struct BatchConsumerBuilder {
    config: ConsumerConfig,
    source: Option<Arc<dyn MessageSource>>,
    handler: Option<Arc<dyn MessageHandler>>,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    error_handler: Option<ErrorHandler>,
}

impl BatchConsumerBuilder {
    /// The stream to consume.
    pub fn source(mut self, source: Arc<dyn MessageSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// The batch processing step.
    pub fn handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Destination for records that exhaust their retries.
    pub fn dead_letter(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letter = Some(sink);
        self
    }

    /// Metrics backend; defaults to [`NullMetrics`].
    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Per-message failure callback; defaults to an error log line.
    pub fn error_handler<F>(mut self, callback: F) -> Self
    where
        F: Fn(&EngineError, &Message) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(callback));
        self
    }

    /// Validate the wiring and produce a consumer, not yet started.
    pub fn build(self) -> Result<BatchConsumer> {
        if self.config.worker_count == 0 {
            return Err(EngineError::Config(
                "worker_count must be at least 1".to_string(),
            ));
        }
        if self.config.batch_size == 0 {
            return Err(EngineError::Config(
                "batch_size must be at least 1".to_string(),
            ));
        }
        let source = self
            .source
            .ok_or_else(|| EngineError::Config("a message source is required".to_string()))?;
        let handler = self
            .handler
            .ok_or_else(|| EngineError::Config("a message handler is required".to_string()))?;
        let dead_letter = if self.config.enable_dlq {
            match self.dead_letter {
                Some(sink) => Some(sink),
                None => {
                    return Err(EngineError::Config(
                        "dead-letter routing is enabled but no sink was provided".to_string(),
                    ))
                }
            }
        } else {
            // A sink supplied while routing is disabled is simply unused.
            None
        };
        let (shutdown_tx, _) = watch::channel(false);
        Ok(BatchConsumer {
            config: Arc::new(self.config),
            source,
            handler,
            dead_letter,
            metrics: self.metrics.unwrap_or_else(|| Arc::new(NullMetrics)),
            error_handler: self.error_handler.unwrap_or_else(default_error_handler),
            cursor: Arc::new(CommitCursor::new()),
            shutdown_tx,
            tasks: Mutex::new(None),
        })
    }
}

fn default_error_handler() -> ErrorHandler {
    Arc::new(|err, message| {
        tracing::error!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            error = %err,
            "message in failed batch"
        );
    })
}

/// Handles of the spawned pipeline, held while running.
struct RunningTasks {
    poll: JoinHandle<Result<()>>,
    workers: Vec<JoinHandle<()>>,
    lag: JoinHandle<()>,
}

/// High-throughput batching consumer over a [`MessageSource`]
///
/// See the [module docs](self) for the pipeline shape. The consumer is
/// shared behind an `Arc`; both `start` and `stop` take `&self`, so a
/// signal task can stop a consumer the main task started.
pub struct BatchConsumer {
    config: Arc<ConsumerConfig>,
    source: Arc<dyn MessageSource>,
    handler: Arc<dyn MessageHandler>,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    metrics: Arc<dyn MetricsSink>,
    error_handler: ErrorHandler,
    cursor: Arc<CommitCursor>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Option<RunningTasks>>,
}

impl BatchConsumer {
    /// Start building a consumer around `config`.
    pub fn builder(config: ConsumerConfig) -> BatchConsumerBuilder {
        BatchConsumerBuilder {
            config,
            source: None,
            handler: None,
            dead_letter: None,
            metrics: None,
            error_handler: None,
        }
    }

    /// The configuration this consumer runs with.
    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Committed next-offsets per partition, as this consumer knows them.
    pub fn committed_offsets(&self) -> HashMap<TopicPartition, i64> {
        self.cursor.snapshot()
    }

    /// Spawn the poll loop, worker pool and lag monitor.
    ///
    /// Errors with [`EngineError::AlreadyRunning`] while running, and with
    /// [`EngineError::Shutdown`] once the consumer has been stopped; a
    /// consumer's lifecycle runs once.
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_some() {
            return Err(EngineError::AlreadyRunning);
        }
        if *self.shutdown_tx.borrow() {
            return Err(EngineError::Shutdown(
                "consumer already stopped".to_string(),
            ));
        }

        // Capacity of two batches per worker: enough to keep the pool fed,
        // small enough that backpressure reaches the poll loop quickly.
        let (batch_tx, batch_rx) = mpsc::channel(self.config.worker_count * 2);
        let queue = Arc::new(Mutex::new(batch_rx));
        let ctx = Arc::new(worker::WorkerContext {
            config: self.config.clone(),
            source: self.source.clone(),
            handler: self.handler.clone(),
            dead_letter: self.dead_letter.clone(),
            metrics: self.metrics.clone(),
            error_handler: self.error_handler.clone(),
            cursor: self.cursor.clone(),
            commit_gate: Mutex::new(()),
        });

        let workers = (0..self.config.worker_count)
            .map(|id| tokio::spawn(worker::run(id, ctx.clone(), queue.clone())))
            .collect();
        let poll = tokio::spawn(
            runner::PollRunner::new(
                self.config.clone(),
                self.source.clone(),
                batch_tx,
                self.shutdown_tx.subscribe(),
            )
            .run(),
        );
        let lag = tokio::spawn(
            lag::LagMonitor::new(
                self.source.clone(),
                self.cursor.clone(),
                self.metrics.clone(),
                self.config.group_id.clone(),
                self.config.lag_interval,
                self.shutdown_tx.subscribe(),
            )
            .run(),
        );
        *tasks = Some(RunningTasks { poll, workers, lag });

        tracing::info!(
            source = self.source.name(),
            group = %self.config.group_id,
            topics = ?self.config.topics,
            workers = self.config.worker_count,
            batch_size = self.config.batch_size,
            "consumer started"
        );
        Ok(())
    }

    /// Stop the pipeline: flush the open batch, drain in-flight batches,
    /// then close the source and sink.
    ///
    /// Bounded by `shutdown_timeout` per stage; tasks still busy past the
    /// bound are aborted and logged, and their uncommitted batches will be
    /// redelivered. Idempotent: stopping a stopped (or never started)
    /// consumer is a no-op. Returns the poll loop's terminal error if it
    /// died of a lost source connection before stop was called.
    pub async fn stop(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        let taken = self.tasks.lock().await.take();
        let Some(RunningTasks {
            mut poll,
            workers,
            lag,
        }) = taken
        else {
            tracing::debug!("stop called while not running");
            return Ok(());
        };
        tracing::info!("stopping consumer");

        // The poll loop notices the watch at its next check, flushes the
        // open batch and drops the batch channel.
        let poll_result = match timeout(self.config.shutdown_timeout, &mut poll).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                tracing::error!(error = %join_err, "poll task panicked");
                Err(EngineError::Shutdown(format!(
                    "poll task panicked: {join_err}"
                )))
            }
            Err(_) => {
                tracing::warn!(
                    timeout = ?self.config.shutdown_timeout,
                    "poll task did not exit in time, aborting"
                );
                poll.abort();
                Ok(())
            }
        };

        // Workers drain whatever the poll loop flushed, then exit on the
        // closed channel.
        let worker_count = workers.len();
        let aborts: Vec<_> = workers.iter().map(|w| w.abort_handle()).collect();
        match timeout(self.config.shutdown_timeout, join_all(workers)).await {
            Ok(results) => {
                for result in results {
                    if let Err(join_err) = result {
                        if !join_err.is_cancelled() {
                            tracing::error!(error = %join_err, "worker panicked");
                        }
                    }
                }
            }
            Err(_) => {
                tracing::warn!(
                    workers = worker_count,
                    timeout = ?self.config.shutdown_timeout,
                    "workers still busy after shutdown timeout, aborting; \
                     their uncommitted batches will be redelivered"
                );
                for abort in aborts {
                    abort.abort();
                }
            }
        }

        // The lag monitor races every await against the watch.
        if let Err(join_err) = lag.await {
            if !join_err.is_cancelled() {
                tracing::error!(error = %join_err, "lag monitor panicked");
            }
        }

        if let Err(e) = self.source.close().await {
            tracing::warn!(source = self.source.name(), error = %e, "source close failed");
        }
        if let Some(sink) = &self.dead_letter {
            if let Err(e) = sink.close().await {
                tracing::warn!(sink = sink.name(), error = %e, "dead-letter sink close failed");
            }
        }

        match &poll_result {
            Ok(()) => tracing::info!("consumer stopped"),
            Err(e) => tracing::warn!(error = %e, "consumer stopped after poll failure"),
        }
        poll_result
    }
}

impl std::fmt::Debug for BatchConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchConsumer")
            .field("group", &self.config.group_id)
            .field("topics", &self.config.topics)
            .field("source", &self.source.name())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::mem::{MemoryDeadLetterSink, MemorySource};
    use async_trait::async_trait;
    use sulake_core::HandlerError;

    struct NoopHandler;

    #[async_trait]
    impl MessageHandler for NoopHandler {
        async fn handle(&self, _batch: &[Message]) -> std::result::Result<(), HandlerError> {
            Ok(())
        }
    }

    fn test_config() -> ConsumerConfig {
        ConsumerConfig::new("localhost:9092", "sulake-test", vec!["events".to_string()])
    }

    fn wired_builder() -> BatchConsumerBuilder {
        BatchConsumer::builder(test_config())
            .source(Arc::new(MemorySource::new()))
            .handler(Arc::new(NoopHandler))
            .dead_letter(Arc::new(MemoryDeadLetterSink::new()))
    }

    #[test]
    fn test_config_defaults() {
        let config = test_config();
        assert_eq!(config.fetch_min_bytes, 65536);
        assert_eq!(config.max_poll_records, 500);
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.batch_timeout, Duration::from_secs(5));
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.retry.max_retries, 3);
        assert!(config.enable_dlq);
        assert!(config.dlq_topic.is_none());
        assert_eq!(config.lag_interval, Duration::from_secs(30));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_build_requires_source_and_handler() {
        let missing_source = BatchConsumer::builder(test_config())
            .handler(Arc::new(NoopHandler))
            .dead_letter(Arc::new(MemoryDeadLetterSink::new()))
            .build();
        assert!(matches!(missing_source, Err(EngineError::Config(_))));

        let missing_handler = BatchConsumer::builder(test_config())
            .source(Arc::new(MemorySource::new()))
            .dead_letter(Arc::new(MemoryDeadLetterSink::new()))
            .build();
        assert!(matches!(missing_handler, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_build_requires_sink_when_dlq_enabled() {
        let missing_sink = BatchConsumer::builder(test_config())
            .source(Arc::new(MemorySource::new()))
            .handler(Arc::new(NoopHandler))
            .build();
        assert!(matches!(missing_sink, Err(EngineError::Config(_))));

        let mut config = test_config();
        config.enable_dlq = false;
        let without_dlq = BatchConsumer::builder(config)
            .source(Arc::new(MemorySource::new()))
            .handler(Arc::new(NoopHandler))
            .build();
        assert!(without_dlq.is_ok());
    }

    #[test]
    fn test_build_rejects_degenerate_sizes() {
        let mut config = test_config();
        config.worker_count = 0;
        let no_workers = BatchConsumer::builder(config)
            .source(Arc::new(MemorySource::new()))
            .handler(Arc::new(NoopHandler))
            .dead_letter(Arc::new(MemoryDeadLetterSink::new()))
            .build();
        assert!(matches!(no_workers, Err(EngineError::Config(_))));

        let mut config = test_config();
        config.batch_size = 0;
        let no_batches = BatchConsumer::builder(config)
            .source(Arc::new(MemorySource::new()))
            .handler(Arc::new(NoopHandler))
            .dead_letter(Arc::new(MemoryDeadLetterSink::new()))
            .build();
        assert!(matches!(no_batches, Err(EngineError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_is_already_running() {
        let consumer = wired_builder().build().unwrap();
        consumer.start().await.unwrap();
        assert!(matches!(
            consumer.start().await,
            Err(EngineError::AlreadyRunning)
        ));
        consumer.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let consumer = wired_builder().build().unwrap();
        consumer.start().await.unwrap();
        consumer.stop().await.unwrap();
        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let consumer = wired_builder().build().unwrap();
        consumer.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_runs_once() {
        let consumer = wired_builder().build().unwrap();
        consumer.start().await.unwrap();
        consumer.stop().await.unwrap();
        assert!(matches!(
            consumer.start().await,
            Err(EngineError::Shutdown(_))
        ));
    }
}
