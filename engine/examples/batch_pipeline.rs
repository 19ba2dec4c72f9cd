//! End-to-end pipeline over the in-memory source: the consumer, a
//! breaker-guarded handler, dead-lettering and metrics.
//!
//! ```bash
//! cargo run -p sulake-engine --example batch_pipeline
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use sulake_engine::{
    BatchConsumer, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, ConsumerConfig,
    HandlerError, MemoryDeadLetterSink, MemorySource, Message, MessageHandler, PrometheusMetrics,
    RetryPolicy,
};

/// Pretend warehouse API: rejects orders for the "poison" SKU.
struct Warehouse;

impl Warehouse {
    async fn reserve(&self, message: &Message) -> Result<(), HandlerError> {
        if message.payload_str().is_some_and(|p| p.contains("poison")) {
            return Err(HandlerError::new(format!(
                "warehouse rejected order at offset {}",
                message.offset
            )));
        }
        Ok(())
    }
}

/// Processes each order through the breaker-guarded warehouse call.
struct OrderHandler {
    warehouse: Warehouse,
    breaker: Arc<CircuitBreaker>,
}

#[async_trait]
impl MessageHandler for OrderHandler {
    async fn handle(&self, batch: &[Message]) -> Result<(), HandlerError> {
        for message in batch {
            self.breaker
                .call(|| self.warehouse.reserve(message))
                .await
                .map_err(|e| HandlerError::new(e.to_string()))?;
        }
        Ok(())
    }
}

fn seed_orders(source: &MemorySource) {
    for partition in 0..2i32 {
        for offset in 0..60i64 {
            // A poisoned order every 25 records per partition.
            let sku = if offset % 25 == 7 { "poison" } else { "widget" };
            let payload = format!(r#"{{"order_id":{offset},"sku":"{sku}"}}"#);
            source.seed(
                Message::new("orders", partition, offset, Bytes::from(payload))
                    .with_key(Bytes::from(format!("customer-{}", offset % 10))),
            );
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let metrics = Arc::new(PrometheusMetrics::new()?);

    // Breakers live in a registry so other components could share them.
    let breakers = Arc::new(CircuitBreakerRegistry::new());
    let breaker = breakers.get_or_create(
        "warehouse",
        CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(2),
            ..Default::default()
        },
    );
    let breaker_gauge = metrics.clone();
    breaker.on_state_change(move |name, state| {
        breaker_gauge.set_breaker_state(name, state);
    });
    // Listeners only fire on transitions; publish the starting state.
    metrics.set_breaker_state(breaker.name(), breaker.state());

    let source = Arc::new(MemorySource::new());
    seed_orders(&source);
    let dead_letter = Arc::new(MemoryDeadLetterSink::new());

    let mut config = ConsumerConfig::new("localhost:9092", "order-pipeline", vec!["orders".into()]);
    config.batch_size = 10;
    config.batch_timeout = Duration::from_millis(200);
    config.worker_count = 2;
    config.lag_interval = Duration::from_secs(1);
    config.retry = RetryPolicy {
        max_retries: 1,
        initial_backoff: Duration::from_millis(50),
        ..Default::default()
    };

    let consumer = BatchConsumer::builder(config)
        .source(source.clone())
        .handler(Arc::new(OrderHandler {
            warehouse: Warehouse,
            breaker,
        }))
        .dead_letter(dead_letter.clone())
        .metrics(metrics.clone())
        .build()?;

    consumer.start().await?;

    // Run until the seeded records are through, or Ctrl+C.
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = tokio::time::sleep(Duration::from_secs(3)) => {}
    }
    consumer.stop().await?;

    println!("\ncommitted offsets:");
    let mut committed: Vec<_> = consumer.committed_offsets().into_iter().collect();
    committed.sort_by_key(|(partition, _)| *partition);
    for (partition, next) in committed {
        println!("  {partition} -> {next}");
    }

    println!("\ndead-lettered {} records:", dead_letter.len());
    for record in dead_letter.records().iter().take(3) {
        println!("  [{}] {}", record.topic, String::from_utf8_lossy(&record.value));
    }

    println!("\nbreaker stats:");
    for stats in breakers.all_stats() {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    }

    println!("\n{}", metrics.gather());
    Ok(())
}
