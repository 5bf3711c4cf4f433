//! # Fulfillment Core
//!
//! Domain types and seam traits for the bookstore order-fulfillment pipeline.
//!
//! An order request is durably recorded, its inventory reserved, and it is tracked
//! through a status lifecycle while downstream side effects (shipping, notifications)
//! run in background workers connected by two queues.
//!
//! ## Seams
//!
//! - [`queue::MessageQueue`]: at-least-once publish/subscribe with explicit ack/nack
//! - [`store::OrderStore`]: order records with compare-and-set status transitions
//! - [`catalog::Catalog`]: per-book atomic stock adjustments with an idempotent ledger
//! - [`notify::Notifier`]: fire-and-forget user and global notifications
//! - [`dead_letter::DeadLetterSink`]: parking for messages that exhausted their budget
//! - [`environment::Clock`]: time source
//!
//! Each seam has an in-memory implementation in `fulfillment-testing` and a production
//! implementation in `fulfillment-postgres` / `fulfillment-redpanda`.

#![forbid(unsafe_code)]

pub mod catalog;
pub mod dead_letter;
pub mod error;
pub mod message;
pub mod notify;
pub mod queue;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use error::FulfillmentError;
pub use types::{BookId, LineItem, Order, OrderId, OrderStatus, Requester, UserId};

/// Environment traits injected into the pipeline stages.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
