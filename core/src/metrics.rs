//! Metrics sink trait - the engine's observability boundary
//!
//! The engine records three things: how many records were processed (and
//! whether they succeeded), how far behind each partition is, and how long
//! processing takes. This trait is that contract and nothing more; the
//! engine crate ships a Prometheus-backed implementation and a no-op
//! default.

/// Outcome label for the processed-records counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Batch handler returned success and offsets were committed.
    Success,
    /// Batch exhausted its retries and went to the dead-letter path.
    Error,
}

impl ProcessStatus {
    /// Label value for metric backends.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Success => "success",
            ProcessStatus::Error => "error",
        }
    }
}

/// Counter/gauge/histogram operations the engine emits
///
/// Implementations must be cheap and non-blocking; these are called on the
/// worker hot path. They must also be `Send + Sync` - workers and the lag
/// monitor record concurrently.
pub trait MetricsSink: Send + Sync {
    /// Add `count` processed records for a topic/partition with the given
    /// outcome.
    fn incr_processed(&self, topic: &str, partition: i32, status: ProcessStatus, count: u64);

    /// Set the current lag for a topic/partition/consumer-group.
    fn set_lag(&self, topic: &str, partition: i32, group: &str, lag: i64);

    /// Observe one processing duration, in seconds, for a topic and
    /// operation label.
    fn observe_processing(&self, topic: &str, operation: &str, seconds: f64);
}
