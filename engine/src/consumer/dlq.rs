//! Dead-letter envelope and publish path
//!
//! A message that still fails after every retry is wrapped in a JSON
//! envelope carrying the original record (bytes base64-encoded), the error
//! that killed it, and a retry count one higher than the count the record
//! arrived with. Replay tooling reads that count to decide when a record
//! has been around the loop too often.
//!
//! Publishing is bounded by `dlq_send_timeout` and never fatal: a broken
//! dead-letter sink costs the failed records their envelope, not the
//! consumer its liveness.

use super::ConsumerConfig;
use crate::error::EngineError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sulake_core::{DeadLetterSink, Message};

/// The original record as carried inside a dead-letter envelope.
///
/// Key and payload are base64 so the envelope stays valid JSON whatever
/// bytes the record held; header values get the same treatment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqOriginalMessage {
    /// Topic the record was read from.
    pub topic: String,
    /// Partition the record was read from.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
    /// Record key, base64.
    pub key: Option<String>,
    /// Record payload, base64.
    pub payload: String,
    /// Broker timestamp, epoch milliseconds.
    pub timestamp: i64,
    /// Record headers, values base64.
    pub headers: Vec<(String, String)>,
}

/// JSON envelope published to the dead-letter topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEnvelope {
    /// The record that failed.
    pub original_message: DlqOriginalMessage,
    /// Display form of the terminal error.
    pub error: String,
    /// Stable short name of the error kind.
    pub error_type: String,
    /// When the record was dead-lettered.
    pub timestamp: DateTime<Utc>,
    /// Consumer group that gave up on the record.
    pub consumer_group: String,
    /// Times this record has now been dead-lettered: the count it arrived
    /// with, plus one for this pass.
    pub retry_count: u32,
}

impl DlqEnvelope {
    /// Wrap a failed record.
    pub fn new(message: &Message, error: &EngineError, consumer_group: &str) -> Self {
        Self {
            original_message: DlqOriginalMessage {
                topic: message.topic.to_string(),
                partition: message.partition,
                offset: message.offset,
                key: message.key.as_ref().map(|k| BASE64.encode(k)),
                payload: BASE64.encode(&message.payload),
                timestamp: message.timestamp,
                headers: message
                    .headers
                    .iter()
                    .map(|(k, v)| (k.clone(), BASE64.encode(v)))
                    .collect(),
            },
            error: error.to_string(),
            error_type: error.kind().to_string(),
            timestamp: Utc::now(),
            consumer_group: consumer_group.to_string(),
            retry_count: message.retry_count() + 1,
        }
    }
}

/// Dead-letter topic for a source topic: the configured override, or
/// `{topic}-dlq`.
pub fn dlq_topic_for(source_topic: &str, configured: Option<&str>) -> String {
    match configured {
        Some(topic) => topic.to_string(),
        None => format!("{source_topic}-dlq"),
    }
}

/// Publish one failed record to the dead-letter topic, bounded by the
/// configured send timeout.
pub(crate) async fn publish(
    sink: &dyn DeadLetterSink,
    config: &ConsumerConfig,
    message: &Message,
    error: &EngineError,
) -> Result<(), EngineError> {
    let envelope = DlqEnvelope::new(message, error, &config.group_id);
    let value = serde_json::to_vec(&envelope)
        .map_err(|e| EngineError::DlqPublish(format!("envelope serialization: {e}")))?;
    let topic = dlq_topic_for(&message.topic, config.dlq_topic.as_deref());

    let send = sink.send(&topic, message.key.clone(), Bytes::from(value));
    match tokio::time::timeout(config.dlq_send_timeout, send).await {
        Ok(Ok(())) => {
            tracing::debug!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                dlq_topic = %topic,
                retry_count = envelope.retry_count,
                "message dead-lettered"
            );
            Ok(())
        }
        Ok(Err(e)) => Err(EngineError::DlqPublish(e.to_string())),
        Err(_) => Err(EngineError::DlqPublish(format!(
            "send to '{}' timed out after {:?}",
            topic, config.dlq_send_timeout
        ))),
    }
}
