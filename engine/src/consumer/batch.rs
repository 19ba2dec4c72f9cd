//! Closed batch of polled messages, ready for a worker
//!
//! A batch is immutable once dispatched: the poll loop accumulates
//! messages in partition-sorted order, seals them under a fresh [`BatchId`]
//! and hands the whole thing to the worker pool. Batches deliberately span
//! partitions; slicing per partition would shrink them below the size that
//! makes bulk handlers worthwhile.

use std::collections::HashMap;
use std::fmt;
use sulake_core::{InternedStr, Message, TopicPartition};
use ulid::Ulid;

/// Unique identifier for a dispatched batch, used to correlate log lines
/// across the poll loop and the worker that processed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchId(Ulid);

impl BatchId {
    /// Generate a fresh id. ULIDs sort by creation time, which keeps log
    /// output chronologically greppable.
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An ordered run of messages handed to one worker as a unit
#[derive(Debug, Clone)]
pub struct Batch {
    id: BatchId,
    messages: Vec<Message>,
}

impl Batch {
    /// Seal `messages` into a batch. The caller is responsible for the
    /// per-partition ordering of the slice; the batch preserves it.
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            id: BatchId::new(),
            messages,
        }
    }

    /// Batch id.
    pub fn id(&self) -> BatchId {
        self.id
    }

    /// The messages, in dispatch order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the batch holds no messages.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Topic of the first message, used to label batch-level metrics.
    pub fn first_topic(&self) -> Option<InternedStr> {
        self.messages.first().map(|m| m.topic)
    }

    /// Offsets to commit once the batch is fully processed: for each
    /// partition present, max observed offset plus one (the next offset
    /// the group should read).
    pub fn next_offsets(&self) -> HashMap<TopicPartition, i64> {
        let mut offsets: HashMap<TopicPartition, i64> = HashMap::new();
        for message in &self.messages {
            let next = message.offset + 1;
            offsets
                .entry(message.topic_partition())
                .and_modify(|current| *current = (*current).max(next))
                .or_insert(next);
        }
        offsets
    }

    /// Message count per partition, for per-partition counters.
    pub fn partition_counts(&self) -> HashMap<TopicPartition, u64> {
        let mut counts: HashMap<TopicPartition, u64> = HashMap::new();
        for message in &self.messages {
            *counts.entry(message.topic_partition()).or_insert(0) += 1;
        }
        counts
    }
}
