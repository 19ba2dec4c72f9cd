//! In-memory source and sink for tests, examples and local development
//!
//! [`MemorySource`] behaves like a real partitioned stream: seeded records
//! come back partition-ordered, `poll` parks until records arrive or the
//! timeout elapses, commits are remembered per partition, and end offsets
//! track the seeded high-water mark. [`MemoryDeadLetterSink`] captures
//! published records for inspection. Neither survives a process restart;
//! that is the point.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use sulake_core::{ClientError, DeadLetterSink, Message, MessageSource, TopicPartition};
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Default)]
struct SourceInner {
    /// Undelivered records per partition, offset order. BTreeMap so a
    /// drain walks partitions deterministically.
    queues: BTreeMap<TopicPartition, VecDeque<Message>>,
    /// Seeded high-water mark (highest offset + 1) per partition.
    end_offsets: HashMap<TopicPartition, i64>,
    /// Last committed next-offset per partition.
    committed: HashMap<TopicPartition, i64>,
    /// Every commit call, in order, for assertions on commit batching.
    commits: Vec<HashMap<TopicPartition, i64>>,
    closed: bool,
}

impl SourceInner {
    fn drain(&mut self, max_records: usize) -> HashMap<TopicPartition, Vec<Message>> {
        let mut out: HashMap<TopicPartition, Vec<Message>> = HashMap::new();
        let mut taken = 0;
        for (partition, queue) in self.queues.iter_mut() {
            while taken < max_records {
                let Some(message) = queue.pop_front() else {
                    break;
                };
                out.entry(*partition).or_default().push(message);
                taken += 1;
            }
            if taken >= max_records {
                break;
            }
        }
        out
    }
}

/// In-memory [`MessageSource`], seeded by the test.
#[derive(Default)]
pub struct MemorySource {
    inner: Mutex<SourceInner>,
    notify: Notify,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one record for delivery and raise the partition's end offset.
    pub fn seed(&self, message: Message) {
        {
            let mut inner = self.inner.lock();
            let partition = message.topic_partition();
            let end = message.offset + 1;
            let entry = inner.end_offsets.entry(partition).or_insert(end);
            *entry = (*entry).max(end);
            inner.queues.entry(partition).or_default().push_back(message);
        }
        // notify_one stores a permit, so a poller that checks the queue
        // just before this lands still wakes up.
        self.notify.notify_one();
    }

    /// Queue a whole batch of records.
    pub fn seed_all(&self, messages: impl IntoIterator<Item = Message>) {
        for message in messages {
            self.seed(message);
        }
    }

    /// Last committed next-offset for a partition.
    pub fn committed(&self, partition: &TopicPartition) -> Option<i64> {
        self.inner.lock().committed.get(partition).copied()
    }

    /// Number of commit calls made so far.
    pub fn commit_calls(&self) -> usize {
        self.inner.lock().commits.len()
    }

    /// Every commit call in order, for assertions on what got batched
    /// together.
    pub fn commit_history(&self) -> Vec<HashMap<TopicPartition, i64>> {
        self.inner.lock().commits.clone()
    }

    /// Records still queued for delivery.
    pub fn remaining(&self) -> usize {
        self.inner.lock().queues.values().map(VecDeque::len).sum()
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn poll(
        &self,
        timeout: Duration,
        max_records: usize,
    ) -> Result<HashMap<TopicPartition, Vec<Message>>, ClientError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return Err(ClientError::Closed);
                }
                let records = inner.drain(max_records);
                if !records.is_empty() {
                    return Ok(records);
                }
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return Ok(HashMap::new());
            }
        }
    }

    async fn commit(&self, offsets: &HashMap<TopicPartition, i64>) -> Result<(), ClientError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(ClientError::Closed);
        }
        for (partition, next) in offsets {
            inner.committed.insert(*partition, *next);
        }
        inner.commits.push(offsets.clone());
        Ok(())
    }

    async fn assigned_partitions(&self) -> Result<Vec<TopicPartition>, ClientError> {
        let inner = self.inner.lock();
        if inner.closed {
            return Err(ClientError::Closed);
        }
        Ok(inner.queues.keys().copied().collect())
    }

    async fn end_offsets(
        &self,
        partitions: &[TopicPartition],
    ) -> Result<HashMap<TopicPartition, i64>, ClientError> {
        let inner = self.inner.lock();
        if inner.closed {
            return Err(ClientError::Closed);
        }
        Ok(partitions
            .iter()
            .filter_map(|partition| {
                inner
                    .end_offsets
                    .get(partition)
                    .map(|end| (*partition, *end))
            })
            .collect())
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.inner.lock().closed = true;
        self.notify.notify_one();
        Ok(())
    }
}

/// One record captured by [`MemoryDeadLetterSink`].
#[derive(Debug, Clone)]
pub struct DlqRecord {
    pub topic: String,
    pub key: Option<Bytes>,
    pub value: Bytes,
}

#[derive(Default)]
struct SinkInner {
    records: Vec<DlqRecord>,
    closed: bool,
}

/// In-memory [`DeadLetterSink`] that captures everything sent to it.
#[derive(Default)]
pub struct MemoryDeadLetterSink {
    inner: Mutex<SinkInner>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far, in publish order.
    pub fn records(&self) -> Vec<DlqRecord> {
        self.inner.lock().records.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().records.is_empty()
    }

    /// Close synchronously so a test can break the sink mid-run.
    pub fn close_now(&self) {
        self.inner.lock().closed = true;
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn send(
        &self,
        topic: &str,
        key: Option<Bytes>,
        value: Bytes,
    ) -> Result<(), ClientError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(ClientError::Closed);
        }
        inner.records.push(DlqRecord {
            topic: topic.to_string(),
            key,
            value,
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.inner.lock().closed = true;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::task::yield_now;

    fn record(partition: i32, offset: i64) -> Message {
        Message::new("events", partition, offset, Bytes::from_static(b"{}"))
    }

    #[tokio::test]
    async fn test_poll_drains_partitions_in_order_up_to_max() {
        let source = MemorySource::new();
        for offset in 0..3 {
            source.seed(record(1, offset));
        }
        for offset in 0..3 {
            source.seed(record(0, offset));
        }

        let records = source.poll(Duration::from_millis(10), 4).await.unwrap();
        assert_eq!(records[&TopicPartition::new("events", 0)].len(), 3);
        assert_eq!(records[&TopicPartition::new("events", 1)].len(), 1);
        assert_eq!(source.remaining(), 2);

        let rest = source.poll(Duration::from_millis(10), 10).await.unwrap();
        let leftover = &rest[&TopicPartition::new("events", 1)];
        assert_eq!(leftover.len(), 2);
        assert_eq!(leftover[0].offset, 1);
        assert_eq!(source.remaining(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out_empty() {
        let source = MemorySource::new();
        let records = source.poll(Duration::from_millis(50), 10).await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_wakes_on_seed() {
        let source = std::sync::Arc::new(MemorySource::new());
        let poller = {
            let source = source.clone();
            tokio::spawn(async move { source.poll(Duration::from_secs(30), 10).await })
        };
        // Let the poller park on the empty queue first.
        for _ in 0..10 {
            yield_now().await;
        }
        source.seed(record(0, 7));

        let records = poller.await.unwrap().unwrap();
        assert_eq!(records[&TopicPartition::new("events", 0)][0].offset, 7);
    }

    #[tokio::test]
    async fn test_commit_records_offsets_and_history() {
        let source = MemorySource::new();
        let mut first = HashMap::new();
        first.insert(TopicPartition::new("events", 0), 5);
        source.commit(&first).await.unwrap();

        let mut second = HashMap::new();
        second.insert(TopicPartition::new("events", 0), 9);
        second.insert(TopicPartition::new("events", 1), 2);
        source.commit(&second).await.unwrap();

        assert_eq!(source.committed(&TopicPartition::new("events", 0)), Some(9));
        assert_eq!(source.committed(&TopicPartition::new("events", 1)), Some(2));
        assert_eq!(source.commit_calls(), 2);
        assert_eq!(
            source.commit_history()[0][&TopicPartition::new("events", 0)],
            5
        );
    }

    #[tokio::test]
    async fn test_end_offsets_track_seeded_high_water() {
        let source = MemorySource::new();
        for offset in 0..5 {
            source.seed(record(0, offset));
        }
        source.seed(record(1, 41));

        let assigned = source.assigned_partitions().await.unwrap();
        assert_eq!(
            assigned,
            vec![
                TopicPartition::new("events", 0),
                TopicPartition::new("events", 1)
            ]
        );

        let ends = source
            .end_offsets(&[
                TopicPartition::new("events", 0),
                TopicPartition::new("events", 1),
                TopicPartition::new("events", 9),
            ])
            .await
            .unwrap();
        assert_eq!(ends.len(), 2);
        assert_eq!(ends[&TopicPartition::new("events", 0)], 5);
        assert_eq!(ends[&TopicPartition::new("events", 1)], 42);
    }

    #[tokio::test]
    async fn test_closed_source_refuses_everything() {
        let source = MemorySource::new();
        source.seed(record(0, 0));
        source.close().await.unwrap();

        assert!(matches!(
            source.poll(Duration::from_millis(10), 10).await,
            Err(ClientError::Closed)
        ));
        assert!(matches!(
            source.commit(&HashMap::new()).await,
            Err(ClientError::Closed)
        ));
        assert!(matches!(
            source.assigned_partitions().await,
            Err(ClientError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_sink_captures_sends() {
        let sink = MemoryDeadLetterSink::new();
        sink.send(
            "events-dlq",
            Some(Bytes::from_static(b"k")),
            Bytes::from_static(b"v"),
        )
        .await
        .unwrap();
        sink.send("other-dlq", None, Bytes::from_static(b"w"))
            .await
            .unwrap();

        assert_eq!(sink.len(), 2);
        let records = sink.records();
        assert_eq!(records[0].topic, "events-dlq");
        assert_eq!(records[0].key.as_deref(), Some(b"k".as_slice()));
        assert!(records[1].key.is_none());
        assert_eq!(records[1].value, Bytes::from_static(b"w"));
    }

    #[tokio::test]
    async fn test_closed_sink_refuses_sends() {
        let sink = MemoryDeadLetterSink::new();
        sink.close_now();
        assert!(matches!(
            sink.send("events-dlq", None, Bytes::new()).await,
            Err(ClientError::Closed)
        ));
        assert!(sink.is_empty());
    }
}
