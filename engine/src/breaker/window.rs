//! Rolling call-outcome history for failure-rate tracking
//!
//! Keeps the last N call outcomes in a bounded deque plus cumulative
//! counters. The failure rate is computed over whatever portion of the
//! window is populated, so a breaker that has seen 10 calls with a window
//! of 100 divides by 10, not 100.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// One recorded call outcome.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    /// Whether the call succeeded.
    pub success: bool,
    /// Wall-clock time the outcome was recorded.
    pub recorded_at: DateTime<Utc>,
    /// How long the call took.
    pub duration: Duration,
    /// Display string of the error, for failures.
    pub error: Option<String>,
}

/// Bounded rolling history plus cumulative counters
///
/// Has its own lock, separate from the breaker's state lock: history
/// mutation and failure-rate reads never contend with state transitions.
pub struct RollingMetrics {
    window_size: usize,
    inner: Mutex<WindowInner>,
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    rejected_calls: AtomicU64,
}

struct WindowInner {
    calls: VecDeque<CallOutcome>,
    last_success_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
}

impl RollingMetrics {
    /// Create a window holding up to `window_size` outcomes.
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size,
            inner: Mutex::new(WindowInner {
                calls: VecDeque::with_capacity(window_size),
                last_success_at: None,
                last_failure_at: None,
            }),
            total_calls: AtomicU64::new(0),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
        }
    }

    /// Record a successful call.
    pub fn record_success(&self, duration: Duration) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.successful_calls.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();
        let mut inner = self.inner.lock();
        inner.last_success_at = Some(now);
        Self::push(&mut inner.calls, self.window_size, CallOutcome {
            success: true,
            recorded_at: now,
            duration,
            error: None,
        });
    }

    /// Record a failed call with its error text.
    pub fn record_failure(&self, duration: Duration, error: &str) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.failed_calls.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();
        let mut inner = self.inner.lock();
        inner.last_failure_at = Some(now);
        Self::push(&mut inner.calls, self.window_size, CallOutcome {
            success: false,
            recorded_at: now,
            duration,
            error: Some(error.to_string()),
        });
    }

    /// Record a call rejected by an open circuit. Rejections never enter
    /// the window - the protected operation did not run.
    pub fn record_rejection(&self) {
        self.rejected_calls.fetch_add(1, Ordering::Relaxed);
    }

    fn push(calls: &mut VecDeque<CallOutcome>, window_size: usize, outcome: CallOutcome) {
        if calls.len() >= window_size {
            calls.pop_front();
        }
        calls.push_back(outcome);
    }

    /// Fraction of failures among the populated window entries.
    /// Returns 0.0 for an empty window.
    pub fn failure_rate(&self) -> f64 {
        let inner = self.inner.lock();
        if inner.calls.is_empty() {
            return 0.0;
        }
        let failures = inner.calls.iter().filter(|c| !c.success).count();
        failures as f64 / inner.calls.len() as f64
    }

    /// How many outcomes the window currently holds.
    pub fn window_len(&self) -> usize {
        self.inner.lock().calls.len()
    }

    /// Calls that executed (successes + failures).
    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::Relaxed)
    }

    /// Calls that succeeded.
    pub fn successful_calls(&self) -> u64 {
        self.successful_calls.load(Ordering::Relaxed)
    }

    /// Calls that failed.
    pub fn failed_calls(&self) -> u64 {
        self.failed_calls.load(Ordering::Relaxed)
    }

    /// Calls rejected without executing.
    pub fn rejected_calls(&self) -> u64 {
        self.rejected_calls.load(Ordering::Relaxed)
    }

    /// Wall-clock time of the most recent success.
    pub fn last_success_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().last_success_at
    }

    /// Wall-clock time of the most recent failure.
    pub fn last_failure_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().last_failure_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_window_rate_is_zero() {
        let metrics = RollingMetrics::new(10);
        assert_eq!(metrics.failure_rate(), 0.0);
        assert_eq!(metrics.window_len(), 0);
    }

    #[test]
    fn test_rate_over_populated_entries_only() {
        // Window of 100 but only 4 calls: divide by 4, not 100
        let metrics = RollingMetrics::new(100);
        metrics.record_failure(Duration::ZERO, "boom");
        metrics.record_success(Duration::ZERO);
        metrics.record_failure(Duration::ZERO, "boom");
        metrics.record_failure(Duration::ZERO, "boom");

        assert_eq!(metrics.failure_rate(), 0.75);
        assert_eq!(metrics.window_len(), 4);
    }

    #[test]
    fn test_window_evicts_oldest() {
        let metrics = RollingMetrics::new(3);
        // Oldest entry is a failure
        metrics.record_failure(Duration::ZERO, "old");
        metrics.record_success(Duration::ZERO);
        metrics.record_success(Duration::ZERO);
        assert!((metrics.failure_rate() - 1.0 / 3.0).abs() < 1e-9);

        // Fourth call evicts the failure; window is now all successes
        metrics.record_success(Duration::ZERO);
        assert_eq!(metrics.window_len(), 3);
        assert_eq!(metrics.failure_rate(), 0.0);

        // Cumulative counters are unaffected by eviction
        assert_eq!(metrics.total_calls(), 4);
        assert_eq!(metrics.failed_calls(), 1);
        assert_eq!(metrics.successful_calls(), 3);
    }

    #[test]
    fn test_rejections_do_not_enter_window() {
        let metrics = RollingMetrics::new(5);
        metrics.record_rejection();
        metrics.record_rejection();

        assert_eq!(metrics.window_len(), 0);
        assert_eq!(metrics.failure_rate(), 0.0);
        assert_eq!(metrics.rejected_calls(), 2);
        assert_eq!(metrics.total_calls(), 0);
    }

    #[test]
    fn test_last_outcome_timestamps() {
        let metrics = RollingMetrics::new(5);
        assert!(metrics.last_success_at().is_none());
        assert!(metrics.last_failure_at().is_none());

        metrics.record_success(Duration::from_millis(5));
        assert!(metrics.last_success_at().is_some());
        assert!(metrics.last_failure_at().is_none());

        metrics.record_failure(Duration::from_millis(7), "late");
        assert!(metrics.last_failure_at().is_some());
    }

    #[test]
    fn test_failure_keeps_error_text() {
        let metrics = RollingMetrics::new(2);
        metrics.record_failure(Duration::ZERO, "connection refused");

        let inner = metrics.inner.lock();
        assert_eq!(
            inner.calls[0].error.as_deref(),
            Some("connection refused")
        );
        assert!(!inner.calls[0].success);
    }
}
