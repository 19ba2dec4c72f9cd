//! The record envelope pulled from a partitioned message source
//!
//! A [`Message`] is one record as the consumer sees it: where it came from
//! (topic, partition, offset), its key/payload bytes, the broker timestamp,
//! and any headers. Payload and key use `Bytes`, so cloning a message while
//! it fans out to a batch, a handler, and possibly the dead-letter path
//! never copies the data.
//!
//! # Zero-Copy Design
//!
//! ```text
//! Source polls a 10KB record as Bytes
//!                  │
//!                  ▼
//! Message appended to the open batch   ← refcount bump only
//!                  │
//!        ┌─────────┴─────────┐
//!        ▼                   ▼
//!    handler slice      DLQ envelope
//! (same underlying bytes, no copies)
//! ```
//!
//! # String Interning
//!
//! `topic` uses [`InternedStr`]: the same topic name appears on every
//! record of a stream, so it is stored once per process and cloned as a
//! 4-byte key.

use crate::headers;
use crate::intern::InternedStr;
use bytes::Bytes;
use smallvec::SmallVec;
use std::fmt;

/// Header list storage - inline up to 2 entries, the common case.
///
/// Headers are ordered and may repeat keys, matching broker semantics.
pub type Headers = SmallVec<[(String, Bytes); 2]>;

/// A topic/partition pair, the unit of offset tracking.
///
/// Cheap to copy (interned topic + i32) and usable as a map key for
/// commit and lag bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    /// Topic name (interned).
    pub topic: InternedStr,
    /// Partition number within the topic.
    pub partition: i32,
}

impl TopicPartition {
    /// Create a topic/partition pair.
    pub fn new(topic: impl Into<InternedStr>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// One record from the message source
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use sulake_core::Message;
///
/// let msg = Message::new("platform-events", 0, 42, Bytes::from(r#"{"id": 1}"#));
/// assert_eq!(msg.topic, "platform-events");
/// assert_eq!(msg.offset, 42);
/// ```
#[derive(Debug, Clone)]
pub struct Message {
    /// Topic this record was read from (interned).
    pub topic: InternedStr,

    /// Partition this record was read from.
    pub partition: i32,

    /// Offset of this record within its partition.
    pub offset: i64,

    /// Optional record key - zero-copy via Bytes.
    pub key: Option<Bytes>,

    /// Opaque record payload - zero-copy via Bytes.
    ///
    /// The consumer never interprets this; handlers deserialize it for
    /// their own domain.
    pub payload: Bytes,

    /// Broker timestamp, epoch milliseconds.
    pub timestamp: i64,

    /// Record headers in broker order.
    pub headers: Headers,
}

impl Message {
    /// Create a record with the current wall clock as its timestamp.
    pub fn new(topic: impl Into<InternedStr>, partition: i32, offset: i64, payload: Bytes) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
            headers: SmallVec::new(),
        }
    }

    /// Set the record key.
    pub fn with_key(mut self, key: Bytes) -> Self {
        self.key = Some(key);
        self
    }

    /// Set the broker timestamp (epoch milliseconds).
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Append a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Topic/partition pair for this record.
    #[inline]
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition {
            topic: self.topic,
            partition: self.partition,
        }
    }

    /// First header value for `key`, if present.
    pub fn header(&self, key: &str) -> Option<&Bytes> {
        self.headers.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// How many times this record has already been through the dead-letter
    /// path, read from the reserved retry-count header. Absent or
    /// unparsable means 0.
    pub fn retry_count(&self) -> u32 {
        self.header(headers::RETRY_COUNT)
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }

    /// Get payload as a string slice (if valid UTF-8).
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Get payload length in bytes.
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}
