//! Retry policy with exponential backoff and jitter
//!
//! Governs how many times a worker re-runs a failed batch handler and how
//! long it waits between attempts. Attempt 0 is the initial try and is
//! never delayed; attempt N waits `initial_backoff * multiplier^(N-1)`,
//! capped at `max_backoff`, with a symmetric random jitter so a burst of
//! failing workers does not retry in lockstep.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// When and how often to retry a failed batch
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the initial attempt (0 disables retrying).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Ceiling for any single delay, before jitter.
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Jitter fraction in [0, 1]; 0.25 means each delay lands within
    /// +/-25% of its nominal value.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries; the initial attempt is the only one.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Total number of attempts, counting the initial one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay to wait before the given attempt (0 = initial attempt,
    /// never delayed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.delay_for_attempt_with_jitter(attempt, JITTER_RNG.next_f64())
    }

    /// Deterministic core of the delay calculation; `jitter_sample` is a
    /// uniform draw from [0, 1).
    fn delay_for_attempt_with_jitter(&self, attempt: u32, jitter_sample: f64) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base_us = self.initial_backoff.as_micros() as f64
            * self.multiplier.powi(attempt as i32 - 1);
        let capped_us = base_us.min(self.max_backoff.as_micros() as f64);
        // Map [0,1) onto [-1,1) and scale by the jitter fraction.
        let offset_us = (jitter_sample * 2.0 - 1.0) * capped_us * self.jitter;
        let delay_us = (capped_us + offset_us).max(1.0);
        Duration::from_micros(delay_us as u64)
    }
}

/// Xorshift64 PRNG for jitter. Statistically plenty for spreading retry
/// storms, with no extra dependency.
struct Xorshift64 {
    state: AtomicU64,
}

impl Xorshift64 {
    fn new(seed: u64) -> Self {
        Self {
            // Xorshift has a fixed point at zero.
            state: AtomicU64::new(seed.max(1)),
        }
    }

    /// Uniform draw from [0, 1).
    fn next_f64(&self) -> f64 {
        let mut current = self.state.load(Ordering::Relaxed);
        loop {
            let mut x = current;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            match self
                .state
                .compare_exchange_weak(current, x, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return (x >> 11) as f64 / (1u64 << 53) as f64,
                Err(actual) => current = actual,
            }
        }
    }
}

static JITTER_RNG: LazyLock<Xorshift64> = LazyLock::new(|| {
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x9E37_79B9_7F4A_7C15);
    Xorshift64::new(seed)
});
