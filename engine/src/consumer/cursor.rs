//! Monotonic record of committed offsets
//!
//! Workers complete batches in whatever order the pool schedules them, but
//! a partition's committed offset must never move backwards: committing 500
//! after 1000 would re-deliver half the partition on the next rebalance.
//! The cursor is the shared guard - an offset only advances, and the lag
//! monitor reads the same numbers the commit path wrote.

use parking_lot::RwLock;
use std::collections::HashMap;
use sulake_core::TopicPartition;

/// Highest committed next-offset per partition, advance-only
#[derive(Debug, Default)]
pub struct CommitCursor {
    committed: RwLock<HashMap<TopicPartition, i64>>,
}

impl CommitCursor {
    /// Create an empty cursor; partitions appear on first commit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed next-offset for `partition`, if anything has been
    /// committed yet.
    pub fn position(&self, partition: &TopicPartition) -> Option<i64> {
        self.committed.read().get(partition).copied()
    }

    /// Whether committing `next_offset` would move this partition forward.
    pub fn would_advance(&self, partition: &TopicPartition, next_offset: i64) -> bool {
        match self.position(partition) {
            Some(current) => next_offset > current,
            None => true,
        }
    }

    /// Record `next_offset` as committed. Refuses to regress: returns
    /// false and leaves the cursor untouched when an equal or newer offset
    /// is already recorded.
    pub fn advance(&self, partition: TopicPartition, next_offset: i64) -> bool {
        let mut committed = self.committed.write();
        match committed.get(&partition) {
            Some(&current) if next_offset <= current => false,
            _ => {
                committed.insert(partition, next_offset);
                true
            }
        }
    }

    /// Copy of the full committed map, for lag sampling and shutdown logs.
    pub fn snapshot(&self) -> HashMap<TopicPartition, i64> {
        self.committed.read().clone()
    }

    /// Number of partitions with a committed offset.
    pub fn len(&self) -> usize {
        self.committed.read().len()
    }

    /// Whether nothing has been committed yet.
    pub fn is_empty(&self) -> bool {
        self.committed.read().is_empty()
    }
}
