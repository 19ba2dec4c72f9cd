//! Prometheus metrics for the engine
//!
//! [`PrometheusMetrics`] owns its [`Registry`] instead of registering into
//! the process-global default, so two consumers in one process (or one test
//! binary) never collide on family names. Serve [`PrometheusMetrics::gather`]
//! from an HTTP handler to expose it.

use crate::breaker::CircuitState;
use crate::error::{EngineError, Result};
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use sulake_core::{MetricsSink, ProcessStatus};

/// Prometheus-backed [`MetricsSink`], plus the circuit breaker state gauge.
pub struct PrometheusMetrics {
    registry: Registry,

    /// Records processed (by topic, partition, status)
    messages_processed: IntCounterVec,

    /// Partition lag (by topic, partition, group)
    consumer_lag: IntGaugeVec,

    /// Batch processing duration in seconds (by topic, operation)
    processing_duration: HistogramVec,

    /// Circuit breaker state (0 = closed, 1 = open, 2 = half-open)
    breaker_state: GaugeVec,
}

impl PrometheusMetrics {
    /// Create the metric families and register them on a fresh registry.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let messages_processed = IntCounterVec::new(
            Opts::new(
                "sulake_messages_processed_total",
                "Total records processed by outcome",
            ),
            &["topic", "partition", "status"],
        )
        .map_err(|e| EngineError::Config(format!("messages_processed: {e}")))?;
        registry
            .register(Box::new(messages_processed.clone()))
            .map_err(|e| EngineError::Config(format!("messages_processed: {e}")))?;

        let consumer_lag = IntGaugeVec::new(
            Opts::new(
                "sulake_consumer_lag",
                "Records between the partition end offset and the committed position",
            ),
            &["topic", "partition", "group"],
        )
        .map_err(|e| EngineError::Config(format!("consumer_lag: {e}")))?;
        registry
            .register(Box::new(consumer_lag.clone()))
            .map_err(|e| EngineError::Config(format!("consumer_lag: {e}")))?;

        let processing_duration = HistogramVec::new(
            HistogramOpts::new(
                "sulake_processing_duration_seconds",
                "Time spent processing one batch",
            )
            // Buckets: 1ms to 30s
            .buckets(vec![
                0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0,
            ]),
            &["topic", "operation"],
        )
        .map_err(|e| EngineError::Config(format!("processing_duration: {e}")))?;
        registry
            .register(Box::new(processing_duration.clone()))
            .map_err(|e| EngineError::Config(format!("processing_duration: {e}")))?;

        let breaker_state = GaugeVec::new(
            Opts::new(
                "sulake_circuit_breaker_state",
                "Circuit breaker state (0 = closed, 1 = open, 2 = half-open)",
            ),
            &["breaker"],
        )
        .map_err(|e| EngineError::Config(format!("breaker_state: {e}")))?;
        registry
            .register(Box::new(breaker_state.clone()))
            .map_err(|e| EngineError::Config(format!("breaker_state: {e}")))?;

        Ok(Self {
            registry,
            messages_processed,
            consumer_lag,
            processing_duration,
            breaker_state,
        })
    }

    /// The registry backing this instance, for embedding into a larger
    /// exporter.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a breaker transition; wire this into
    /// [`CircuitBreaker::on_state_change`](crate::breaker::CircuitBreaker::on_state_change).
    pub fn set_breaker_state(&self, breaker: &str, state: CircuitState) {
        self.breaker_state
            .with_label_values(&[breaker])
            .set(state.as_metric_value());
    }

    /// Encode every family in Prometheus text format.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&families, &mut buffer) {
            tracing::warn!(error = %e, "metrics encoding failed");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl MetricsSink for PrometheusMetrics {
    fn incr_processed(&self, topic: &str, partition: i32, status: ProcessStatus, count: u64) {
        self.messages_processed
            .with_label_values(&[topic, &partition.to_string(), status.as_str()])
            .inc_by(count);
    }

    fn set_lag(&self, topic: &str, partition: i32, group: &str, lag: i64) {
        self.consumer_lag
            .with_label_values(&[topic, &partition.to_string(), group])
            .set(lag);
    }

    fn observe_processing(&self, topic: &str, operation: &str, seconds: f64) {
        self.processing_duration
            .with_label_values(&[topic, operation])
            .observe(seconds);
    }
}

/// Discards every observation; the default sink when none is wired.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn incr_processed(&self, _topic: &str, _partition: i32, _status: ProcessStatus, _count: u64) {}

    fn set_lag(&self, _topic: &str, _partition: i32, _group: &str, _lag: i64) {}

    fn observe_processing(&self, _topic: &str, _operation: &str, _seconds: f64) {}
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use prometheus::proto::MetricFamily;

    fn family<'a>(families: &'a [MetricFamily], name: &str) -> &'a MetricFamily {
        families
            .iter()
            .find(|f| f.get_name() == name)
            .unwrap_or_else(|| panic!("family {name} not registered"))
    }

    #[test]
    fn test_processed_counter_accumulates() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.incr_processed("events", 0, ProcessStatus::Success, 2);
        metrics.incr_processed("events", 0, ProcessStatus::Success, 3);
        metrics.incr_processed("events", 0, ProcessStatus::Error, 1);

        let families = metrics.registry().gather();
        let counter = family(&families, "sulake_messages_processed_total");
        let mut by_status = std::collections::HashMap::new();
        for metric in counter.get_metric() {
            let status = metric
                .get_label()
                .iter()
                .find(|l| l.get_name() == "status")
                .unwrap()
                .get_value()
                .to_string();
            by_status.insert(status, metric.get_counter().get_value());
        }
        assert_eq!(by_status["success"], 5.0);
        assert_eq!(by_status["error"], 1.0);
    }

    #[test]
    fn test_lag_gauge_overwrites() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.set_lag("events", 3, "sulake-test", 900);
        metrics.set_lag("events", 3, "sulake-test", 12);

        let families = metrics.registry().gather();
        let gauge = family(&families, "sulake_consumer_lag");
        assert_eq!(gauge.get_metric().len(), 1);
        assert_eq!(gauge.get_metric()[0].get_gauge().get_value(), 12.0);
    }

    #[test]
    fn test_breaker_state_gauge() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.set_breaker_state("db", CircuitState::Open);

        let families = metrics.registry().gather();
        let gauge = family(&families, "sulake_circuit_breaker_state");
        assert_eq!(gauge.get_metric()[0].get_gauge().get_value(), 1.0);

        metrics.set_breaker_state("db", CircuitState::Closed);
        let families = metrics.registry().gather();
        let gauge = family(&families, "sulake_circuit_breaker_state");
        assert_eq!(gauge.get_metric()[0].get_gauge().get_value(), 0.0);
    }

    #[test]
    fn test_gather_renders_text_format() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.incr_processed("events", 0, ProcessStatus::Success, 42);
        metrics.observe_processing("events", "batch_processing", 0.025);

        let text = metrics.gather();
        assert!(text.contains("sulake_messages_processed_total"));
        assert!(text.contains("sulake_processing_duration_seconds"));
        assert!(text.contains(r#"topic="events""#));
        assert!(text.contains(r#"status="success""#));
    }

    #[test]
    fn test_instances_do_not_collide() {
        // Owned registries: a second consumer in the same process is fine.
        let first = PrometheusMetrics::new().unwrap();
        let second = PrometheusMetrics::new().unwrap();
        first.incr_processed("a", 0, ProcessStatus::Success, 1);
        second.incr_processed("b", 0, ProcessStatus::Success, 1);
        assert!(!first.gather().contains(r#"topic="b""#));
    }

    #[test]
    fn test_null_metrics_accepts_everything() {
        let metrics = NullMetrics;
        metrics.incr_processed("events", 0, ProcessStatus::Success, 10);
        metrics.set_lag("events", 0, "group", 5);
        metrics.observe_processing("events", "batch_processing", 0.1);
    }
}
