//! Source and sink traits for the batched consumer
//!
//! [`MessageSource`] is the read side: a partitioned stream the consumer
//! polls, with per-partition offsets it can commit back. [`DeadLetterSink`]
//! is the side channel failed records are re-published to. Both are
//! implemented by applications (or test doubles) against whatever broker
//! client they use; the engine only sees these traits.

use crate::error::ClientError;
use crate::message::{Message, TopicPartition};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;

/// A partitioned message stream the consumer reads from
///
/// # Implementation Requirements
///
/// - Implementations must be `Send + Sync`: the engine polls from one task
///   but commits from worker tasks and reads offsets from the lag monitor.
///   A wrapped client that is not itself thread-safe must serialize
///   internally.
/// - `poll` blocks up to `timeout` when no records are available and
///   returns early once records arrive. Records within each partition's
///   `Vec` must be in offset order.
/// - `commit` stores "next offset to read" markers, i.e. last processed
///   offset + 1, per the usual broker convention.
///
/// # Example
///
/// ```ignore
/// use sulake_core::{ClientError, Message, MessageSource, TopicPartition};
/// use async_trait::async_trait;
/// use std::collections::HashMap;
/// use std::time::Duration;
///
/// struct KafkaSource { /* rdkafka consumer behind a mutex */ }
///
/// #[async_trait]
/// impl MessageSource for KafkaSource {
///     fn name(&self) -> &'static str {
///         "kafka"
///     }
///
///     async fn poll(
///         &self,
///         timeout: Duration,
///         max_records: usize,
///     ) -> Result<HashMap<TopicPartition, Vec<Message>>, ClientError> {
///         // fetch up to max_records, blocking up to timeout
///         # unimplemented!()
///     }
///
///     // commit / assigned_partitions / end_offsets elided
///     # async fn commit(&self, _: &HashMap<TopicPartition, i64>) -> Result<(), ClientError> { unimplemented!() }
///     # async fn assigned_partitions(&self) -> Result<Vec<TopicPartition>, ClientError> { unimplemented!() }
///     # async fn end_offsets(&self, _: &[TopicPartition]) -> Result<HashMap<TopicPartition, i64>, ClientError> { unimplemented!() }
/// }
/// ```
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Short name for logs and metrics. Examples: "kafka", "memory".
    fn name(&self) -> &'static str;

    /// Fetch up to `max_records` records, blocking up to `timeout`.
    ///
    /// Returns a mapping of partition to its records in offset order.
    /// An empty map means the timeout elapsed with nothing to read.
    async fn poll(
        &self,
        timeout: Duration,
        max_records: usize,
    ) -> Result<HashMap<TopicPartition, Vec<Message>>, ClientError>;

    /// Commit next-offset markers for the given partitions.
    ///
    /// Durability is the implementation's concern; when this returns `Ok`
    /// the offsets must survive a restart of this consumer group.
    async fn commit(&self, offsets: &HashMap<TopicPartition, i64>) -> Result<(), ClientError>;

    /// Partitions currently assigned to this consumer.
    async fn assigned_partitions(&self) -> Result<Vec<TopicPartition>, ClientError>;

    /// Highest available offset + 1 per requested partition.
    ///
    /// Partitions the implementation cannot answer for may be omitted from
    /// the result.
    async fn end_offsets(
        &self,
        partitions: &[TopicPartition],
    ) -> Result<HashMap<TopicPartition, i64>, ClientError>;

    /// Release the underlying client.
    ///
    /// Called once during consumer shutdown. The default implementation
    /// does nothing.
    async fn close(&self) -> Result<(), ClientError> {
        Ok(())
    }
}

/// Destination for records that failed processing
///
/// `send` resolves when the destination has acknowledged the record; the
/// engine bounds the wait with its own timeout. Implementations must be
/// safe for concurrent sends from multiple worker tasks.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Short name for logs. Examples: "kafka-producer", "memory".
    fn name(&self) -> &'static str;

    /// Publish one record to `topic`.
    async fn send(&self, topic: &str, key: Option<Bytes>, value: Bytes)
        -> Result<(), ClientError>;

    /// Flush and release the underlying producer.
    ///
    /// The default implementation does nothing.
    async fn close(&self) -> Result<(), ClientError> {
        Ok(())
    }
}
