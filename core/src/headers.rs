//! Reserved header key constants
//!
//! These keys carry consumer bookkeeping through the opaque header list
//! without coupling the envelope to any broker's conventions.

/// Times a record has been re-published to a dead-letter topic
/// (decimal string). The dead-letter path reads this from the failing
/// record and writes `value + 1` into the envelope it publishes; replay
/// tooling that moves an envelope back onto its source topic is expected
/// to set this header from the envelope's `retry_count` field.
pub const RETRY_COUNT: &str = "sulake.retry_count";
