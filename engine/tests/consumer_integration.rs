//! End-to-end consumer flows over the in-memory source
//!
//! Exercises the pipeline the way an application runs it: poll, batch,
//! process, commit, dead-letter, lag. Everything runs on the paused test
//! clock, so timeout and recovery flows are deterministic.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sulake_engine::{
    BatchConsumer, CircuitBreaker, CircuitBreakerConfig, CircuitState, ConsumerConfig,
    DlqEnvelope, HandlerError, MemoryDeadLetterSink, MemorySource, Message, MessageHandler,
    MetricsSink, PrometheusMetrics, ProcessStatus, RetryPolicy, TopicPartition,
};

// ============================================================================
// Shared test doubles and helpers
// ============================================================================

fn config() -> ConsumerConfig {
    ConsumerConfig::new("localhost:9092", "sulake-it", vec!["events".to_string()])
}

fn record(partition: i32, offset: i64) -> Message {
    Message::new(
        "events",
        partition,
        offset,
        Bytes::from(format!(r#"{{"n":{offset}}}"#)),
    )
}

fn seed_range(source: &MemorySource, partition: i32, offsets: std::ops::Range<i64>) {
    for offset in offsets {
        source.seed(record(partition, offset));
    }
}

fn offsets(entries: &[(i32, i64)]) -> HashMap<TopicPartition, i64> {
    entries
        .iter()
        .map(|&(partition, next)| (TopicPartition::new("events", partition), next))
        .collect()
}

/// Poll `cond` while letting the paused clock tick forward.
async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Handler that records every batch it sees as (partition, offset) pairs.
#[derive(Default)]
struct CaptureHandler {
    batches: Mutex<Vec<Vec<(i32, i64)>>>,
}

impl CaptureHandler {
    fn batches(&self) -> Vec<Vec<(i32, i64)>> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageHandler for CaptureHandler {
    async fn handle(&self, batch: &[Message]) -> Result<(), HandlerError> {
        let seen = batch.iter().map(|m| (m.partition, m.offset)).collect();
        self.batches.lock().unwrap().push(seen);
        Ok(())
    }
}

/// Handler that fails the first `failures` calls, then succeeds.
struct FlakyHandler {
    failures: u32,
    calls: AtomicU32,
}

impl FlakyHandler {
    fn failing(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
        }
    }

    fn failing_forever() -> Self {
        Self::failing(u32::MAX)
    }
}

#[async_trait]
impl MessageHandler for FlakyHandler {
    async fn handle(&self, _batch: &[Message]) -> Result<(), HandlerError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            Err(HandlerError::new("downstream write refused"))
        } else {
            Ok(())
        }
    }
}

// ============================================================================
// Batching, ordering and commit flow
// ============================================================================

#[tokio::test(start_paused = true)]
async fn three_batches_commit_in_partition_order() {
    let source = Arc::new(MemorySource::new());
    seed_range(&source, 0, 0..750);
    seed_range(&source, 1, 0..750);
    let sink = Arc::new(MemoryDeadLetterSink::new());
    let handler = Arc::new(CaptureHandler::default());

    let mut config = config();
    config.batch_size = 500;
    config.worker_count = 1;
    let consumer = BatchConsumer::builder(config)
        .source(source.clone())
        .handler(handler.clone())
        .dead_letter(sink.clone())
        .build()
        .unwrap();

    consumer.start().await.unwrap();
    wait_until("three commits", || source.commit_calls() >= 3).await;
    consumer.stop().await.unwrap();

    // One poll is bounded by max_poll_records = 500, so the batches land
    // as p0 x500, then p0 x250 + p1 x250, then p1 x500.
    let history = source.commit_history();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0], offsets(&[(0, 500)]));
    assert_eq!(history[1], offsets(&[(0, 750), (1, 250)]));
    assert_eq!(history[2], offsets(&[(1, 750)]));
    assert_eq!(
        source.committed(&TopicPartition::new("events", 0)),
        Some(750)
    );
    assert_eq!(
        source.committed(&TopicPartition::new("events", 1)),
        Some(750)
    );

    // Every record was delivered exactly once, in offset order per
    // partition.
    let batches = handler.batches();
    assert_eq!(batches.len(), 3);
    assert!(batches.iter().all(|batch| batch.len() == 500));
    let mut per_partition: HashMap<i32, Vec<i64>> = HashMap::new();
    for (partition, offset) in batches.into_iter().flatten() {
        per_partition.entry(partition).or_default().push(offset);
    }
    assert_eq!(per_partition[&0], (0..750).collect::<Vec<_>>());
    assert_eq!(per_partition[&1], (0..750).collect::<Vec<_>>());

    assert_eq!(source.remaining(), 0);
    assert!(sink.is_empty());
}

#[tokio::test(start_paused = true)]
async fn trickle_flushes_on_batch_timeout() {
    let source = Arc::new(MemorySource::new());
    seed_range(&source, 0, 0..5);
    let sink = Arc::new(MemoryDeadLetterSink::new());
    let handler = Arc::new(CaptureHandler::default());

    let mut config = config();
    config.batch_size = 1000;
    config.batch_timeout = Duration::from_secs(1);
    let consumer = BatchConsumer::builder(config)
        .source(source.clone())
        .handler(handler.clone())
        .dead_letter(sink)
        .build()
        .unwrap();

    consumer.start().await.unwrap();
    // Five records never reach batch_size; only the elapsed batch timeout
    // can seal them.
    wait_until("timeout flush commit", || source.commit_calls() >= 1).await;
    consumer.stop().await.unwrap();

    assert_eq!(source.commit_calls(), 1);
    assert_eq!(source.committed(&TopicPartition::new("events", 0)), Some(5));
    assert_eq!(handler.batches(), vec![vec![(0, 0), (0, 1), (0, 2), (0, 3), (0, 4)]]);
}

// ============================================================================
// Retries and the dead-letter path
// ============================================================================

#[tokio::test(start_paused = true)]
async fn defeated_batch_fans_out_to_dlq() {
    let source = Arc::new(MemorySource::new());
    seed_range(&source, 0, 0..3);
    let sink = Arc::new(MemoryDeadLetterSink::new());
    let metrics = Arc::new(PrometheusMetrics::new().unwrap());

    let mut config = config();
    config.batch_size = 3;
    config.worker_count = 1;
    config.retry = RetryPolicy {
        max_retries: 2,
        initial_backoff: Duration::from_millis(10),
        ..Default::default()
    };
    let consumer = BatchConsumer::builder(config)
        .source(source.clone())
        .handler(Arc::new(FlakyHandler::failing_forever()))
        .dead_letter(sink.clone())
        .metrics(metrics.clone())
        .build()
        .unwrap();

    consumer.start().await.unwrap();
    wait_until("three dead letters", || sink.len() == 3).await;
    consumer.stop().await.unwrap();

    // Nothing commits; the records stay claimable by the next consumer.
    assert_eq!(source.commit_calls(), 0);
    assert!(source
        .committed(&TopicPartition::new("events", 0))
        .is_none());

    // One envelope per record, in batch order, on the derived topic.
    let records = sink.records();
    assert!(records.iter().all(|r| r.topic == "events-dlq"));
    let envelopes: Vec<DlqEnvelope> = records
        .iter()
        .map(|r| serde_json::from_slice(&r.value).unwrap())
        .collect();
    let dead_offsets: Vec<i64> = envelopes.iter().map(|e| e.original_message.offset).collect();
    assert_eq!(dead_offsets, vec![0, 1, 2]);
    for envelope in &envelopes {
        assert_eq!(envelope.original_message.topic, "events");
        assert_eq!(envelope.error_type, "handler");
        assert_eq!(envelope.consumer_group, "sulake-it");
        assert_eq!(envelope.retry_count, 1);
    }

    // The error counter saw all three records on partition 0.
    let families = metrics.registry().gather();
    let processed = families
        .iter()
        .find(|f| f.get_name() == "sulake_messages_processed_total")
        .unwrap();
    assert_eq!(processed.get_metric().len(), 1);
    let metric = &processed.get_metric()[0];
    assert_eq!(metric.get_counter().get_value(), 3.0);
    let labels: HashMap<&str, &str> = metric
        .get_label()
        .iter()
        .map(|l| (l.get_name(), l.get_value()))
        .collect();
    assert_eq!(labels["status"], "error");
    assert_eq!(labels["partition"], "0");
    assert_eq!(labels["topic"], "events");
}

#[tokio::test(start_paused = true)]
async fn transient_failures_retry_then_commit() {
    let source = Arc::new(MemorySource::new());
    seed_range(&source, 0, 0..3);
    let sink = Arc::new(MemoryDeadLetterSink::new());
    let handler = Arc::new(FlakyHandler::failing(2));

    let mut config = config();
    config.batch_size = 3;
    config.retry = RetryPolicy {
        max_retries: 3,
        initial_backoff: Duration::from_millis(10),
        ..Default::default()
    };
    let consumer = BatchConsumer::builder(config)
        .source(source.clone())
        .handler(handler.clone())
        .dead_letter(sink.clone())
        .build()
        .unwrap();

    consumer.start().await.unwrap();
    wait_until("commit after retries", || source.commit_calls() >= 1).await;
    consumer.stop().await.unwrap();

    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    assert_eq!(source.committed(&TopicPartition::new("events", 0)), Some(3));
    assert!(sink.is_empty());
}

// ============================================================================
// Circuit breaker in the processing path
// ============================================================================

struct Dependency {
    healthy: AtomicBool,
    calls: AtomicU32,
}

impl Dependency {
    async fn reserve(&self) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(HandlerError::new("dependency down"))
        }
    }
}

struct GuardedHandler {
    breaker: Arc<CircuitBreaker>,
    dependency: Arc<Dependency>,
}

#[async_trait]
impl MessageHandler for GuardedHandler {
    async fn handle(&self, batch: &[Message]) -> Result<(), HandlerError> {
        for _message in batch {
            self.breaker
                .call(|| self.dependency.reserve())
                .await
                .map_err(|e| HandlerError::new(e.to_string()))?;
        }
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn breaker_trips_and_recovers_through_pipeline() {
    let source = Arc::new(MemorySource::new());
    let sink = Arc::new(MemoryDeadLetterSink::new());
    let partition = TopicPartition::new("events", 0);

    let breaker = Arc::new(CircuitBreaker::new(
        "deps",
        CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(10),
            success_threshold: 2,
            failure_rate_threshold: 1.0,
            window_size: 100,
        },
    ));
    let dependency = Arc::new(Dependency {
        healthy: AtomicBool::new(true),
        calls: AtomicU32::new(0),
    });

    let mut config = config();
    config.batch_size = 1;
    config.batch_timeout = Duration::from_millis(100);
    config.worker_count = 1;
    config.retry = RetryPolicy::none();
    let consumer = BatchConsumer::builder(config)
        .source(source.clone())
        .handler(Arc::new(GuardedHandler {
            breaker: breaker.clone(),
            dependency: dependency.clone(),
        }))
        .dead_letter(sink.clone())
        .build()
        .unwrap();
    consumer.start().await.unwrap();

    // Warmup: one healthy record commits and seeds the breaker window.
    source.seed(record(0, 0));
    wait_until("warmup commit", || source.committed(&partition) == Some(1)).await;
    assert_eq!(breaker.state(), CircuitState::Closed);

    // Dependency goes down: three straight failures trip the breaker and
    // dead-letter their batches.
    dependency.healthy.store(false, Ordering::SeqCst);
    for offset in 1..=3 {
        source.seed(record(0, offset));
    }
    wait_until("failures dead-lettered", || sink.len() == 3).await;
    assert_eq!(breaker.state(), CircuitState::Open);
    let calls_when_open = dependency.calls.load(Ordering::SeqCst);
    assert_eq!(calls_when_open, 4);

    // While open, records fail fast without touching the dependency.
    source.seed(record(0, 4));
    wait_until("fast-failed record dead-lettered", || sink.len() == 4).await;
    assert_eq!(dependency.calls.load(Ordering::SeqCst), calls_when_open);
    let envelope: DlqEnvelope = serde_json::from_slice(&sink.records()[3].value).unwrap();
    assert!(envelope.error.contains("circuit breaker 'deps' is open"));

    // Dependency recovers, the cooldown passes, and two half-open probes
    // close the circuit again.
    dependency.healthy.store(true, Ordering::SeqCst);
    tokio::time::advance(Duration::from_secs(11)).await;
    for offset in 5..=6 {
        source.seed(record(0, offset));
    }
    wait_until("recovered commits", || {
        source.committed(&partition) == Some(7)
    })
    .await;
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(dependency.calls.load(Ordering::SeqCst), 6);
    assert_eq!(sink.len(), 4);

    consumer.stop().await.unwrap();
}

// ============================================================================
// Lag visibility and shutdown flushing
// ============================================================================

#[derive(Default)]
struct LagCapture {
    lags: Mutex<HashMap<(String, i32, String), i64>>,
}

impl MetricsSink for LagCapture {
    fn incr_processed(&self, _: &str, _: i32, _: ProcessStatus, _: u64) {}
    fn set_lag(&self, topic: &str, partition: i32, group: &str, lag: i64) {
        self.lags
            .lock()
            .unwrap()
            .insert((topic.to_string(), partition, group.to_string()), lag);
    }
    fn observe_processing(&self, _: &str, _: &str, _: f64) {}
}

#[tokio::test(start_paused = true)]
async fn stop_flushes_open_batch_and_lag_sees_backlog() {
    let source = Arc::new(MemorySource::new());
    seed_range(&source, 0, 0..10);
    let sink = Arc::new(MemoryDeadLetterSink::new());
    let handler = Arc::new(CaptureHandler::default());
    let metrics = Arc::new(LagCapture::default());

    // Batch thresholds the run can never hit, so the only way these
    // records commit is the flush at shutdown.
    let mut config = config();
    config.batch_size = 1000;
    config.batch_timeout = Duration::from_secs(60);
    config.shutdown_timeout = Duration::from_secs(120);
    config.lag_interval = Duration::from_secs(1);
    let consumer = BatchConsumer::builder(config)
        .source(source.clone())
        .handler(handler.clone())
        .dead_letter(sink)
        .metrics(metrics.clone())
        .build()
        .unwrap();

    consumer.start().await.unwrap();
    let key = ("events".to_string(), 0, "sulake-it".to_string());
    wait_until("lag sample", || {
        metrics.lags.lock().unwrap().get(&key) == Some(&10)
    })
    .await;
    // Polled but unsealed: nothing committed yet, and the lag monitor
    // reports the full backlog because lag is end minus committed.
    assert_eq!(source.commit_calls(), 0);

    // A second wave lands right as stop() is called; the shutdown flush
    // must carry both waves out in one batch.
    seed_range(&source, 0, 10..20);
    consumer.stop().await.unwrap();

    assert_eq!(source.commit_calls(), 1);
    assert_eq!(
        source.committed(&TopicPartition::new("events", 0)),
        Some(20)
    );
    assert_eq!(handler.batches().len(), 1);
    assert_eq!(consumer.committed_offsets(), offsets(&[(0, 20)]));
}
