//! Dead-letter sink for messages that cannot be processed.
//!
//! A message lands here when its handler keeps failing past the delivery budget, when it
//! cannot be decoded at all, or when a stage flags it for manual reconciliation. Nothing
//! that reaches the sink is retried automatically.

use crate::message::Envelope;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors from dead-letter operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterError {
    /// Backend failure
    #[error("Dead letter storage failed: {0}")]
    StorageFailed(String),

    /// No entry with this id
    #[error("Dead letter entry not found: {0}")]
    NotFound(i64),
}

/// Why a message was dead-lettered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// Handler failed on every allowed attempt
    RetriesExhausted,
    /// Envelope or payload could not be decoded
    Undecodable,
    /// Publishing kept failing after bounded retries
    PublishFailed,
    /// Processed, but left state a human must reconcile
    NeedsReconciliation,
}

impl DeadLetterReason {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RetriesExhausted => "retries_exhausted",
            Self::Undecodable => "undecodable",
            Self::PublishFailed => "publish_failed",
            Self::NeedsReconciliation => "needs_reconciliation",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "retries_exhausted" => Some(Self::RetriesExhausted),
            "undecodable" => Some(Self::Undecodable),
            "publish_failed" => Some(Self::PublishFailed),
            "needs_reconciliation" => Some(Self::NeedsReconciliation),
            _ => None,
        }
    }
}

/// A message parked for manual inspection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadLetter {
    /// Queue the message belongs to
    pub queue: String,
    /// The message itself
    pub envelope: Envelope,
    /// Category of failure
    pub reason: DeadLetterReason,
    /// Last error observed
    pub error: String,
    /// When it was parked
    pub failed_at: DateTime<Utc>,
}

/// Destination for dead letters.
pub trait DeadLetterSink: Send + Sync {
    /// Park a message.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::StorageFailed`] if the entry cannot be recorded.
    fn dead_letter(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>>;
}
