//! sulake-engine - Circuit breaker and batched stream consumer
//!
//! Two resilience primitives that compose into one pipeline:
//!
//! ```text
//!   MessageSource ──► BatchConsumer ──► MessageHandler ──► downstream
//!                     │    (batches, retries,   │
//!                     │     commit-after-process)│ CircuitBreaker
//!                     │                          ▼
//!                     └──► DeadLetterSink    (protects the dependency)
//! ```
//!
//! - [`CircuitBreaker`] wraps calls to an unreliable dependency and fails
//!   fast while it is down, with a half-open probe phase for recovery.
//!   Breakers are shared through a [`CircuitBreakerRegistry`].
//! - [`BatchConsumer`] drives a [`MessageSource`]: one poll loop batches
//!   records across partitions, a worker pool processes and commits them,
//!   defeated records are published to a [`DeadLetterSink`] as JSON
//!   envelopes, and a monitor exports per-partition lag.
//!
//! Offsets are committed only after a batch has been processed, so the
//! pipeline is at-least-once end to end. Wrap the flaky part of your
//! handler in a breaker and the two primitives compose: the breaker turns
//! a down dependency into fast batch failures, retries back off, and the
//! dead-letter queue catches what remains.
//!
//! # Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use sulake_engine::{BatchConsumer, ConsumerConfig};
//!
//! let config = ConsumerConfig::new("broker:9092", "my-group", vec!["events".into()]);
//! let consumer = BatchConsumer::builder(config)
//!     .source(Arc::new(my_source))
//!     .handler(Arc::new(my_handler))
//!     .dead_letter(Arc::new(my_dlq_producer))
//!     .build()?;
//! consumer.start().await?;
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod breaker;
pub mod consumer;
pub mod error;
pub mod mem;
pub mod metrics;

pub use breaker::{
    BreakerError, CallOutcome, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry,
    CircuitBreakerStats, CircuitState, RollingMetrics,
};
pub use consumer::{
    Batch, BatchConsumer, BatchConsumerBuilder, BatchId, CommitCursor, ConsumerConfig,
    DlqEnvelope, DlqOriginalMessage, ErrorHandler, RetryPolicy,
};
pub use error::{EngineError, Result};
pub use mem::{DlqRecord, MemoryDeadLetterSink, MemorySource};
pub use metrics::{NullMetrics, PrometheusMetrics};

// Boundary types implementations are written against.
pub use sulake_core::{
    ClientError, DeadLetterSink, HandlerError, Headers, InternedStr, Message, MessageHandler,
    MessageSource, MetricsSink, ProcessStatus, TopicPartition,
};
