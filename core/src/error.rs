//! Error types returned by collaborator implementations

use thiserror::Error;

/// Error type for message source and dead-letter sink operations
///
/// This is the standard error type implementations of
/// [`MessageSource`](crate::MessageSource) and
/// [`DeadLetterSink`](crate::DeadLetterSink) return. The engine maps each
/// variant to a containment policy: `Connection` terminates the poll loop,
/// everything else is logged and survived.
///
/// # Example
///
/// ```
/// use sulake_core::ClientError;
///
/// fn fetch() -> Result<(), ClientError> {
///     Err(ClientError::Connection("broker unreachable".to_string()))
/// }
///
/// match fetch() {
///     Ok(_) => println!("ok"),
///     Err(ClientError::Connection(msg)) => println!("fatal: {}", msg),
///     Err(e) => println!("transient: {}", e),
/// }
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Connection-level failure
    ///
    /// The client lost its broker and cannot continue safely.
    /// Examples: DNS lookup failed, connection refused, session expired.
    #[error("connection error: {0}")]
    Connection(String),

    /// Poll failed
    ///
    /// A fetch attempt failed but the connection survives.
    /// Examples: fetch timeout, transient broker error, rebalance in flight.
    #[error("poll failed: {0}")]
    Poll(String),

    /// Offset commit failed
    ///
    /// Examples: rebalance raced the commit, coordinator unavailable.
    #[error("commit failed: {0}")]
    Commit(String),

    /// Send failed
    ///
    /// Returned by sinks when a publish is not acknowledged.
    /// Examples: broker rejected the record, ack timeout, queue full.
    #[error("send failed: {0}")]
    Send(String),

    /// Client handle already closed
    ///
    /// Any operation after `close()` returns this.
    #[error("client closed")]
    Closed,
}

/// Batch processing failure reported by a message handler
///
/// Carries a human-readable description of why the batch could not be
/// processed; the engine wraps it with retry and dead-letter handling.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    /// Create a handler error from a message string.
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<&str> for HandlerError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(s: String) -> Self {
        Self(s)
    }
}
