//! Per-application collection of named circuit breakers
//!
//! An injectable alternative to a process-global table: the application
//! owns one registry, hands it to the components that need breakers, and
//! admin surfaces iterate it for stats and resets.

use super::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Named circuit breakers, created on first use
///
/// `get_or_create` is the only way in; two callers racing on the same
/// name always end up sharing one breaker instance.
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the breaker registered under `name`, creating it with
    /// `config` if absent. The config only applies on first creation;
    /// later callers get the existing instance unchanged.
    pub fn get_or_create(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(name) {
            return breaker.clone();
        }
        let mut breakers = self.breakers.write();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    /// The breaker registered under `name`, if any.
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    /// Registered breaker names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered breakers.
    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.breakers.read().is_empty()
    }

    /// Stats snapshots for every registered breaker, sorted by name.
    pub fn all_stats(&self) -> Vec<CircuitBreakerStats> {
        // Clone the handles first: stats() can fire the lazy half-open
        // transition, and listeners must not run under the registry lock.
        let mut stats: Vec<CircuitBreakerStats> = self
            .handles()
            .iter()
            .map(|breaker| breaker.stats())
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Force every registered breaker closed.
    pub fn reset_all(&self) {
        let handles = self.handles();
        tracing::info!(count = handles.len(), "resetting all circuit breakers");
        for breaker in handles {
            breaker.reset();
        }
    }

    fn handles(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers.read().values().cloned().collect()
    }
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::breaker::CircuitState;

    #[test]
    fn test_get_or_create_reuses_instance() {
        let registry = CircuitBreakerRegistry::new();
        let first = registry.get_or_create("store", CircuitBreakerConfig::default());
        let second = registry.get_or_create(
            "store",
            CircuitBreakerConfig {
                failure_threshold: 99,
                ..Default::default()
            },
        );
        // Same instance; the second config was ignored.
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_get_missing_returns_none() {
        let registry = CircuitBreakerRegistry::new();
        assert!(registry.get("nope").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_names_sorted() {
        let registry = CircuitBreakerRegistry::new();
        registry.get_or_create("zulu", CircuitBreakerConfig::default());
        registry.get_or_create("alpha", CircuitBreakerConfig::default());
        assert_eq!(registry.names(), vec!["alpha", "zulu"]);
    }

    #[tokio::test]
    async fn test_all_stats_and_reset_all() {
        let registry = CircuitBreakerRegistry::new();
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        };
        registry.get_or_create("a", config.clone());
        let b = registry.get_or_create("b", config);

        let _ = b.call(|| async { Err::<(), _>("down") }).await;
        let stats = registry.all_stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].name, "a");
        assert_eq!(stats[0].state, CircuitState::Closed);
        assert_eq!(stats[1].name, "b");
        assert_eq!(stats[1].state, CircuitState::Open);

        registry.reset_all();
        assert!(registry
            .all_stats()
            .iter()
            .all(|s| s.state == CircuitState::Closed));
    }

    #[test]
    fn test_concurrent_get_or_create_single_instance() {
        let registry = Arc::new(CircuitBreakerRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                registry.get_or_create("shared", CircuitBreakerConfig::default())
            }));
        }
        let breakers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(registry.len(), 1);
        assert!(breakers.iter().all(|b| Arc::ptr_eq(b, &breakers[0])));
    }
}
