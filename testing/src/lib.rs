//! # Fulfillment Testing
//!
//! Testing utilities for the order-fulfillment pipeline.
//!
//! This crate provides:
//! - In-memory implementations of every seam ([`InMemoryQueue`], [`InMemoryOrderStore`],
//!   [`InMemoryCatalog`], [`RecordingNotifier`], [`InMemoryDeadLetters`])
//! - A deterministic clock ([`FixedClock`], [`test_clock`])
//! - Helpers for waiting on background workers ([`eventually`]) and capturing logs
//!
//! ## Example
//!
//! ```ignore
//! use fulfillment_testing::{InMemoryCatalog, eventually};
//!
//! let catalog = InMemoryCatalog::new().with_book(BookId::new(1), 3);
//! // ... start the pipeline, create an order ...
//! eventually(|| catalog.stock_of(BookId::new(1)) == Some(2)).await;
//! ```

use chrono::{DateTime, Utc};
use fulfillment_core::environment::Clock;

pub mod queue;
pub mod recorders;
pub mod store;

/// Deterministic time sources.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// 2025-01-01T00:00:00Z as a unix timestamp.
    const NEW_YEAR_2025: i64 = 1_735_689_600;

    /// A clock that never moves, so envelope and dead-letter timestamps are comparable.
    ///
    /// ```
    /// use fulfillment_testing::mocks::FixedClock;
    /// use fulfillment_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone, Copy)]
    pub struct FixedClock {
        at: DateTime<Utc>,
    }

    impl FixedClock {
        /// Freeze time at `at`.
        #[must_use]
        pub const fn new(at: DateTime<Utc>) -> Self {
            Self { at }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.at
        }
    }

    /// The clock every pipeline test uses, frozen at 2025-01-01 00:00:00 UTC.
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::from_timestamp(NEW_YEAR_2025, 0).unwrap_or_default())
    }
}

/// Helpers for tests that drive background workers.
pub mod helpers {
    use std::time::Duration;

    /// How long [`eventually`] waits before failing the test.
    pub const EVENTUALLY_TIMEOUT: Duration = Duration::from_secs(5);

    /// Poll `condition` every 5ms until it holds.
    ///
    /// # Panics
    ///
    /// Panics if the condition is still false after [`EVENTUALLY_TIMEOUT`].
    #[allow(clippy::panic)] // Intentional panic for test assertions
    pub async fn eventually<F>(mut condition: F)
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + EVENTUALLY_TIMEOUT;
        while !condition() {
            if tokio::time::Instant::now() >= deadline {
                panic!("condition not met within {EVENTUALLY_TIMEOUT:?}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Route `tracing` output to the test harness; safe to call from every test.
    pub fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing utilities.
pub mod properties {
    use fulfillment_core::types::{BookId, LineItem};
    use proptest::prelude::*;

    /// Line items over a small book range, so generated orders collide on books.
    pub fn line_items(max_len: usize) -> impl Strategy<Value = Vec<LineItem>> {
        prop::collection::vec(
            (1_i64..=5, 1_u32..=3).prop_map(|(book, qty)| LineItem::new(BookId::new(book), qty)),
            1..=max_len,
        )
    }
}

pub use helpers::{eventually, init_test_tracing};
pub use mocks::{FixedClock, test_clock};
pub use queue::InMemoryQueue;
pub use recorders::{InMemoryDeadLetters, RecordingNotifier};
pub use store::{InMemoryCatalog, InMemoryOrderStore};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_new_year_2025() {
        let clock = test_clock();
        assert_eq!(clock.now().to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }

    #[tokio::test]
    async fn eventually_returns_once_condition_holds() {
        let mut polls = 0;
        eventually(|| {
            polls += 1;
            polls >= 3
        })
        .await;
        assert_eq!(polls, 3);
    }
}
