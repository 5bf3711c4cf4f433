//! # Fulfillment Runtime
//!
//! Machinery shared by the pipeline's background workers:
//!
//! - [`consumer`]: the [`QueueConsumer`] loop that settles every delivery with ack, nack
//!   or dead-letter according to its [`MessageHandler`]'s result
//! - [`lifecycle`]: [`Workers`], one shutdown broadcast for all background tasks
//! - [`retry`]: exponential backoff for transient failures
//! - [`metrics`]: Prometheus recorders

#![forbid(unsafe_code)]

pub mod consumer;
pub mod lifecycle;
pub mod metrics;
pub mod retry;

pub use consumer::{HandlerError, MessageHandler, QueueConsumer};
pub use lifecycle::{Workers, shutdown_signal};
pub use retry::{Backoff, RetryPolicy, retry_with_backoff, retry_with_predicate};
