//! Error types for the sulake engine

use thiserror::Error;

// Re-export the collaborator error types from sulake-core
pub use sulake_core::{ClientError, HandlerError};

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Main error type for the sulake engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Circuit breaker rejected the call
    ///
    /// The named breaker is open; try again after its recovery timeout.
    #[error("circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    /// Batch processing failed after retries
    ///
    /// Triggers the dead-letter path; never fatal to the consumer.
    #[error("handler failed: {0}")]
    Handler(String),

    /// Offset commit failed
    ///
    /// Logged and absorbed; redelivery from the last successful commit
    /// covers the gap.
    #[error("offset commit failed: {0}")]
    Commit(String),

    /// Source connection lost
    ///
    /// Fatal: per-partition ordering cannot be continued blind, so the
    /// poll loop terminates and the supervisor restarts the process.
    #[error("source connection lost: {0}")]
    SourceConnection(String),

    /// Dead-letter publish failed
    ///
    /// Logged only; the batch still counts as handled once the attempt
    /// was made, so a broken DLQ cannot wedge the consumer.
    #[error("dead-letter publish failed: {0}")]
    DlqPublish(String),

    /// start() called while already running
    #[error("consumer already running")]
    AlreadyRunning,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Shutdown error
    #[error("shutdown error: {0}")]
    Shutdown(String),
}

impl EngineError {
    /// Short stable name for the variant, used as the `error_type` field
    /// of dead-letter envelopes and as a log label.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::CircuitOpen { .. } => "circuit_open",
            EngineError::Handler(_) => "handler",
            EngineError::Commit(_) => "commit",
            EngineError::SourceConnection(_) => "source_connection",
            EngineError::DlqPublish(_) => "dlq_publish",
            EngineError::AlreadyRunning => "already_running",
            EngineError::Config(_) => "config",
            EngineError::Shutdown(_) => "shutdown",
        }
    }
}

impl From<ClientError> for EngineError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Connection(msg) => EngineError::SourceConnection(msg),
            ClientError::Poll(msg) => EngineError::SourceConnection(format!("poll: {msg}")),
            ClientError::Commit(msg) => EngineError::Commit(msg),
            ClientError::Send(msg) => EngineError::DlqPublish(msg),
            ClientError::Closed => EngineError::SourceConnection("client closed".to_string()),
        }
    }
}

impl From<HandlerError> for EngineError {
    fn from(err: HandlerError) -> Self {
        EngineError::Handler(err.0)
    }
}
