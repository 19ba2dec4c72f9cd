//! sulake-core - Core types for the sulake resilience/throughput engine
//!
//! This crate provides the foundational types shared between the sulake
//! engine and the application code that feeds it:
//!
//! - [`Message`] / [`TopicPartition`] - the record envelope and offset key
//! - [`MessageSource`] / [`DeadLetterSink`] traits - the broker boundary
//! - [`MessageHandler`] trait - the processing step batches go to
//! - [`MetricsSink`] trait - the observability boundary
//! - [`ClientError`] / [`HandlerError`] - errors those implementations return
//! - [`InternedStr`] - zero-cost string interning for topic names
//! - [`headers`] - reserved header key constants
//!
//! # Why this crate exists
//!
//! Applications implement `MessageSource`, `DeadLetterSink`, and
//! `MessageHandler` against their own broker clients, and tests implement
//! them as in-memory doubles. Without `sulake-core` those implementations
//! would depend on `sulake-engine` and drag in the whole consumer/breaker
//! machinery (and its dependency tree) just to see the trait definitions.
//!
//! By extracting the boundary types here, the dependency arrows all point
//! one way:
//!
//! ```text
//! sulake-core ◄── sulake-engine
//!     ▲
//!     └────────── your source/sink/handler implementations
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(missing_docs)]

mod error;
mod handler;
pub mod headers;
pub mod intern;
pub mod message;
mod metrics;
mod source;

pub use error::{ClientError, HandlerError};
pub use handler::MessageHandler;
pub use intern::InternedStr;
pub use message::{Headers, Message, TopicPartition};
pub use metrics::{MetricsSink, ProcessStatus};
pub use source::{DeadLetterSink, MessageSource};
