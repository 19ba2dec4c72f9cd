//! Circuit breaker - sheds load from a failing dependency
//!
//! Wraps any fallible async operation in a CLOSED/OPEN/HALF_OPEN state
//! machine. While CLOSED, calls pass through and outcomes feed a rolling
//! window. Too many consecutive failures, or a window failure rate over the
//! configured threshold, opens the circuit; calls are then rejected without
//! touching the dependency until `recovery_timeout` has passed since the
//! last failure. The first state query after that probes HALF_OPEN, where a
//! handful of successes close the circuit again and a single failure
//! reopens it.
//!
//! ```text
//!          failures ≥ threshold
//!          or rate ≥ threshold           recovery_timeout elapsed
//! CLOSED ───────────────────────► OPEN ─────────────────────► HALF_OPEN
//!    ▲                             ▲                              │
//!    │      successes ≥ threshold  │        any failure           │
//!    └─────────────────────────────┼──────────────────────────────┤
//!                                  └──────────────────────────────┘
//! ```
//!
//! The breaker is composed explicitly at the call site - a component holds
//! a breaker instance and runs `breaker.call(|| op()).await`. There is no
//! global registry and no attribute magic; see [`CircuitBreakerRegistry`]
//! for an injectable per-application collection.
//!
//! # Concurrency
//!
//! State lives behind one mutex per breaker, held only for bookkeeping.
//! The protected operation runs outside the lock, so a slow call on one
//! task never blocks rejections or state queries on another. The rolling
//! window has its own finer lock (see [`RollingMetrics`]).

mod registry;
mod window;

pub use registry::CircuitBreakerRegistry;
pub use window::{CallOutcome, RollingMetrics};

use crate::error::EngineError;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Circuit breaker state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - calls pass through.
    Closed,
    /// Dependency considered down - calls fail fast.
    Open,
    /// Probing recovery - live traffic allowed, watched closely.
    HalfOpen,
}

impl CircuitState {
    /// Convert to a metric gauge value (0=closed, 1=open, 2=half-open).
    pub fn as_metric_value(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Error returned by a protected call
#[derive(Error, Debug)]
pub enum BreakerError<E> {
    /// The breaker is open; the operation was not invoked.
    #[error("circuit breaker '{name}' is open")]
    Open {
        /// Name of the rejecting breaker.
        name: String,
    },
    /// The operation ran and failed; its error passes through unchanged.
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// Whether this is an open-circuit rejection.
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    /// The wrapped operation's error, if the operation actually ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Inner(e) => Some(e),
            BreakerError::Open { .. } => None,
        }
    }
}

impl From<BreakerError<EngineError>> for EngineError {
    fn from(err: BreakerError<EngineError>) -> Self {
        match err {
            BreakerError::Open { name } => EngineError::CircuitOpen { name },
            BreakerError::Inner(e) => e,
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures to open the circuit from CLOSED.
    pub failure_threshold: u32,
    /// Time after the last failure before an open circuit probes recovery.
    pub recovery_timeout: Duration,
    /// Successes in HALF_OPEN needed to close the circuit.
    pub success_threshold: u32,
    /// Rolling-window failure rate (0..1) that opens the circuit from
    /// CLOSED, independent of the consecutive count.
    pub failure_rate_threshold: f64,
    /// Number of recent call outcomes kept for the rate calculation.
    pub window_size: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
            failure_rate_threshold: 0.5,
            window_size: 100,
        }
    }
}

/// Serializable snapshot of a breaker's state and counters
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    /// Breaker name.
    pub name: String,
    /// Current state, after the lazy recovery check.
    pub state: CircuitState,
    /// Consecutive failures seen in the current CLOSED phase.
    pub failure_count: u32,
    /// Successes seen in the current HALF_OPEN phase.
    pub success_count: u32,
    /// Calls that executed (successes + failures), process lifetime.
    pub total_calls: u64,
    /// Calls that succeeded.
    pub successful_calls: u64,
    /// Calls that failed.
    pub failed_calls: u64,
    /// Calls rejected by an open circuit without executing.
    pub rejected_calls: u64,
    /// Failure fraction over the populated window entries.
    pub failure_rate: f64,
    /// Outcomes currently held in the rolling window.
    pub window_len: usize,
    /// Wall-clock time of the most recent failure.
    pub last_failure_time: Option<DateTime<Utc>>,
    /// Wall-clock time of the most recent success.
    pub last_success_time: Option<DateTime<Utc>>,
    /// Seconds since the circuit last opened, while it remains open.
    pub seconds_since_opened: Option<f64>,
}

/// Callback invoked on every state transition.
type StateListener = Arc<dyn Fn(&str, CircuitState) + Send + Sync>;

/// Internal state, guarded by the breaker's mutex.
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    circuit_opened_at: Option<Instant>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            circuit_opened_at: None,
        }
    }
}

/// A named circuit breaker guarding one dependency
///
/// Create one per protected dependency and keep it for the process
/// lifetime; it is `Send + Sync` and cheap to share behind an `Arc`.
///
/// # Example
///
/// ```
/// use sulake_engine::breaker::{BreakerError, CircuitBreaker};
///
/// # #[tokio::main(flavor = "current_thread")] async fn main() {
/// let breaker = CircuitBreaker::with_defaults("event-store");
///
/// let result: Result<u64, BreakerError<&str>> =
///     breaker.call(|| async { Ok(42) }).await;
/// assert_eq!(result.unwrap(), 42);
/// # }
/// ```
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    window: RollingMetrics,
    listeners: RwLock<Vec<StateListener>>,
}

impl CircuitBreaker {
    /// Create a breaker with the given configuration.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        tracing::info!(breaker = %name, "circuit breaker created");
        Self {
            window: RollingMetrics::new(config.window_size),
            name,
            config,
            state: Mutex::new(BreakerState::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Create a breaker with default configuration.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    /// Breaker name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    ///
    /// Querying the state is what moves an expired OPEN circuit to
    /// HALF_OPEN; there is no background timer.
    pub fn state(&self) -> CircuitState {
        let (state, transition) = {
            let mut inner = self.state.lock();
            let transition = self.check_recovery(&mut inner);
            (inner.state, transition)
        };
        if let Some(new_state) = transition {
            self.notify(new_state);
        }
        state
    }

    /// Rolling-window call history and lifetime counters.
    pub fn window(&self) -> &RollingMetrics {
        &self.window
    }

    /// Run `op` through the breaker. Every `Err` the operation returns is
    /// recorded as a failure.
    ///
    /// Returns [`BreakerError::Open`] without invoking `op` when the
    /// circuit is open, or [`BreakerError::Inner`] carrying the
    /// operation's own error.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.call_when(|_| true, op).await
    }

    /// Run `op` through the breaker, counting only errors `is_failure`
    /// accepts.
    ///
    /// Errors the predicate rejects propagate untouched: no window entry,
    /// no failure streak change, no transition. Use this when the wrapped
    /// operation can fail for reasons that say nothing about the
    /// dependency's health (validation errors, not-found, and so on).
    pub async fn call_when<T, E, P, F, Fut>(
        &self,
        is_failure: P,
        op: F,
    ) -> Result<T, BreakerError<E>>
    where
        P: Fn(&E) -> bool,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        if !self.try_acquire() {
            return Err(BreakerError::Open {
                name: self.name.clone(),
            });
        }

        // The lock is NOT held here; slow operations must not serialize.
        let start = Instant::now();
        let result = op().await;
        let duration = start.elapsed();

        match result {
            Ok(value) => {
                self.on_success(duration);
                Ok(value)
            }
            Err(err) => {
                if is_failure(&err) {
                    self.on_failure(duration, &err.to_string());
                }
                Err(BreakerError::Inner(err))
            }
        }
    }

    /// Run `op` through the breaker, substituting `fallback`'s value when
    /// the circuit is open or the operation fails.
    ///
    /// The failure is still recorded and transitions still fire; only the
    /// caller-visible outcome changes.
    pub async fn call_with_fallback<T, E, F, Fut, Fb>(&self, op: F, fallback: Fb) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        Fb: FnOnce() -> T,
        E: fmt::Display,
    {
        match self.call(op).await {
            Ok(value) => value,
            Err(BreakerError::Open { .. }) => {
                tracing::debug!(breaker = %self.name, "circuit open, serving fallback");
                fallback()
            }
            Err(BreakerError::Inner(err)) => {
                tracing::debug!(
                    breaker = %self.name,
                    error = %err,
                    "call failed, serving fallback"
                );
                fallback()
            }
        }
    }

    /// Register a state-change listener.
    ///
    /// Listeners are best-effort: they run outside the state lock, and a
    /// panicking listener is logged and swallowed, never propagated.
    pub fn on_state_change<L>(&self, listener: L)
    where
        L: Fn(&str, CircuitState) + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Force the breaker CLOSED from any state. Administrative; clears
    /// counters and failure timestamps, and notifies listeners.
    pub fn reset(&self) {
        {
            let mut inner = self.state.lock();
            inner.state = CircuitState::Closed;
            inner.failure_count = 0;
            inner.success_count = 0;
            inner.last_failure_time = None;
            inner.circuit_opened_at = None;
        }
        tracing::info!(breaker = %self.name, "circuit breaker manually reset");
        self.notify(CircuitState::Closed);
    }

    /// Snapshot of state and counters, for admin endpoints and debugging.
    ///
    /// Taken under one state-lock acquisition, so the reported state and
    /// counters always belong together; the lazy recovery check runs
    /// first, so an expired OPEN shows as HALF_OPEN.
    pub fn stats(&self) -> CircuitBreakerStats {
        let (stats, transition) = {
            let mut inner = self.state.lock();
            let transition = self.check_recovery(&mut inner);
            let stats = CircuitBreakerStats {
                name: self.name.clone(),
                state: inner.state,
                failure_count: inner.failure_count,
                success_count: inner.success_count,
                total_calls: self.window.total_calls(),
                successful_calls: self.window.successful_calls(),
                failed_calls: self.window.failed_calls(),
                rejected_calls: self.window.rejected_calls(),
                failure_rate: self.window.failure_rate(),
                window_len: self.window.window_len(),
                last_failure_time: self.window.last_failure_at(),
                last_success_time: self.window.last_success_at(),
                seconds_since_opened: inner.circuit_opened_at.map(|at| at.elapsed().as_secs_f64()),
            };
            (stats, transition)
        };
        if let Some(new_state) = transition {
            self.notify(new_state);
        }
        stats
    }

    /// Admission check. Applies the lazy OPEN to HALF_OPEN transition,
    /// records a rejection when the circuit stays open.
    fn try_acquire(&self) -> bool {
        let (allowed, transition) = {
            let mut inner = self.state.lock();
            let transition = self.check_recovery(&mut inner);
            (inner.state != CircuitState::Open, transition)
        };
        if let Some(new_state) = transition {
            self.notify(new_state);
        }
        if !allowed {
            self.window.record_rejection();
        }
        allowed
    }

    /// OPEN to HALF_OPEN once `recovery_timeout` has passed since the last
    /// failure. Must be called with the state lock held; returns the new
    /// state for notification after the lock is released.
    fn check_recovery(&self, inner: &mut BreakerState) -> Option<CircuitState> {
        if inner.state != CircuitState::Open {
            return None;
        }
        let last_failure = inner.last_failure_time?;
        if last_failure.elapsed() < self.config.recovery_timeout {
            return None;
        }
        inner.state = CircuitState::HalfOpen;
        inner.failure_count = 0;
        inner.success_count = 0;
        tracing::info!(breaker = %self.name, "circuit breaker probing half-open");
        Some(CircuitState::HalfOpen)
    }

    fn on_success(&self, duration: Duration) {
        let transition = {
            let mut inner = self.state.lock();
            self.window.record_success(duration);
            match inner.state {
                CircuitState::HalfOpen => {
                    inner.success_count += 1;
                    tracing::debug!(
                        breaker = %self.name,
                        successes = inner.success_count,
                        needed = self.config.success_threshold,
                        "half-open probe succeeded"
                    );
                    if inner.success_count >= self.config.success_threshold {
                        Self::to_closed(&mut inner);
                        Some(CircuitState::Closed)
                    } else {
                        None
                    }
                }
                _ => {
                    // A success in CLOSED ends the consecutive-failure streak.
                    inner.failure_count = 0;
                    None
                }
            }
        };
        if let Some(new_state) = transition {
            tracing::info!(breaker = %self.name, "circuit breaker closed, dependency recovered");
            self.notify(new_state);
        }
    }

    fn on_failure(&self, duration: Duration, error: &str) {
        let transition = {
            let mut inner = self.state.lock();
            self.window.record_failure(duration, error);
            inner.last_failure_time = Some(Instant::now());
            match inner.state {
                CircuitState::Closed => {
                    inner.failure_count += 1;
                    tracing::warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        threshold = self.config.failure_threshold,
                        error = %error,
                        "protected call failed"
                    );
                    let rate = self.window.failure_rate();
                    if inner.failure_count >= self.config.failure_threshold
                        || rate >= self.config.failure_rate_threshold
                    {
                        Self::to_open(&mut inner);
                        Some((CircuitState::Open, rate))
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    // No tolerance while probing: one failure reopens.
                    let rate = self.window.failure_rate();
                    Self::to_open(&mut inner);
                    Some((CircuitState::Open, rate))
                }
                // Already open (a call admitted earlier finished late);
                // the fresh failure timestamp extends the cooldown.
                CircuitState::Open => None,
            }
        };
        if let Some((new_state, rate)) = transition {
            tracing::warn!(
                breaker = %self.name,
                failure_rate = rate,
                "circuit breaker opened"
            );
            self.notify(new_state);
        }
    }

    fn to_open(inner: &mut BreakerState) {
        inner.state = CircuitState::Open;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.circuit_opened_at = Some(Instant::now());
    }

    fn to_closed(inner: &mut BreakerState) {
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.circuit_opened_at = None;
    }

    /// Fire listeners outside the state lock. Panics are contained.
    fn notify(&self, new_state: CircuitState) {
        let listeners: Vec<StateListener> = self.listeners.read().clone();
        for listener in listeners {
            let result = catch_unwind(AssertUnwindSafe(|| listener(&self.name, new_state)));
            if result.is_err() {
                tracing::warn!(
                    breaker = %self.name,
                    state = %new_state,
                    "state-change listener panicked"
                );
            }
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state.lock().state)
            .finish()
    }
}
