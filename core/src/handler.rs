//! Handler trait - the processing step batches are dispatched to

use crate::error::HandlerError;
use crate::message::Message;
use async_trait::async_trait;

/// Processes one closed batch of records
///
/// The engine hands each worker an immutable, offset-ordered slice. A
/// handler either returns `Ok(())`, which makes the batch's offsets
/// eligible for commit, or an error, which sends the batch through retry
/// and then the dead-letter path.
///
/// # Implementation Requirements
///
/// - Handlers must be `Send + Sync`; distinct batches run concurrently
///   across workers.
/// - Handlers must not assume a batch holds a single partition - records
///   from several partitions arrive interleaved, each partition's records
///   in offset order.
/// - Processing must be idempotent where possible: delivery is
///   at-least-once, and a crash between processing and commit replays the
///   batch.
///
/// # Example
///
/// ```
/// use sulake_core::{HandlerError, Message, MessageHandler};
/// use async_trait::async_trait;
///
/// struct CountingHandler;
///
/// #[async_trait]
/// impl MessageHandler for CountingHandler {
///     async fn handle(&self, batch: &[Message]) -> Result<(), HandlerError> {
///         println!("processing {} records", batch.len());
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process a batch. `Ok(())` commits it; `Err` routes it to retry and
    /// then the dead-letter path.
    async fn handle(&self, batch: &[Message]) -> Result<(), HandlerError>;
}
