//! Dead Letter Queue (DLQ) for messages that could not be processed.
//!
//! Consumers park messages here once their delivery budget is spent, when they cannot
//! be decoded, or when they need manual reconciliation. Operators then list pending
//! entries, investigate, and mark them resolved or discarded.

use chrono::{DateTime, Utc};
use fulfillment_core::dead_letter::{DeadLetter, DeadLetterError, DeadLetterReason, DeadLetterSink};
use fulfillment_core::message::Envelope;
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;

/// Status of a failed message in the Dead Letter Queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DLQStatus {
    /// Waiting for investigation
    Pending,
    /// Someone is working on it
    Processing,
    /// Fixed and replayed or reconciled
    Resolved,
    /// Permanently dropped
    Discarded,
}

impl DLQStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::StorageFailed`] if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, DeadLetterError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(DeadLetterError::StorageFailed(format!("Invalid DLQ status: {s}"))),
        }
    }
}

/// An entry in the Dead Letter Queue.
#[derive(Debug, Clone)]
pub struct FailedMessage {
    /// Unique identifier for this DLQ entry
    pub id: i64,

    /// Queue the message was consumed from
    pub queue: String,

    /// The message, as last delivered
    pub envelope: Envelope,

    /// Why it was parked
    pub reason: DeadLetterReason,

    /// Last error observed
    pub error_message: String,

    /// When this message was parked
    pub first_failed_at: DateTime<Utc>,

    /// Last status change
    pub last_failed_at: DateTime<Utc>,

    /// Current processing status
    pub status: DLQStatus,

    /// When the failure was resolved (if applicable)
    pub resolved_at: Option<DateTime<Utc>>,

    /// Who/what resolved the failure
    pub resolved_by: Option<String>,

    /// Notes about the resolution
    pub resolution_notes: Option<String>,
}

/// `PostgreSQL`-based Dead Letter Queue.
///
/// # Example
///
/// ```no_run
/// use fulfillment_postgres::{DeadLetterQueue, DLQStatus};
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let dlq = DeadLetterQueue::new(pool);
///
/// let pending = dlq.list_pending(100).await?;
/// if let Some(first) = pending.first() {
///     dlq.update_status(first.id, DLQStatus::Processing).await?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DeadLetterQueue {
    pool: PgPool,
}

const SELECT_COLUMNS: &str = r"
    SELECT
        id, queue, message_kind, correlation_id, attempt, payload, published_at,
        reason, error_message, first_failed_at, last_failed_at, status,
        resolved_at, resolved_by, resolution_notes
    FROM failed_messages
";

fn storage_error(error: sqlx::Error) -> DeadLetterError {
    DeadLetterError::StorageFailed(error.to_string())
}

impl DeadLetterQueue {
    /// Create a new Dead Letter Queue with the given connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Park a message and return its DLQ id.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::StorageFailed`] if the insert fails.
    pub async fn add_entry(&self, letter: &DeadLetter) -> Result<i64, DeadLetterError> {
        let envelope = &letter.envelope;
        let id: (i64,) = sqlx::query_as(
            r"
            INSERT INTO failed_messages (
                queue, message_kind, correlation_id, attempt, payload, published_at,
                reason, error_message, first_failed_at, last_failed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
            RETURNING id
            ",
        )
        .bind(&letter.queue)
        .bind(&envelope.kind)
        .bind(&envelope.correlation_id)
        .bind(i32::try_from(envelope.attempt).unwrap_or(i32::MAX))
        .bind(&envelope.payload)
        .bind(envelope.published_at)
        .bind(letter.reason.as_str())
        .bind(&letter.error)
        .bind(letter.failed_at)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_error)?;

        tracing::warn!(
            dlq_id = id.0,
            queue = %letter.queue,
            correlation_id = %envelope.correlation_id,
            reason = letter.reason.as_str(),
            error = %letter.error,
            "Message added to Dead Letter Queue"
        );

        Ok(id.0)
    }

    /// List pending entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::StorageFailed`] if the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<FailedMessage>, DeadLetterError> {
        self.list_by_status(DLQStatus::Pending, limit).await
    }

    /// List entries by status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::StorageFailed`] if the query fails.
    pub async fn list_by_status(
        &self,
        status: DLQStatus,
        limit: usize,
    ) -> Result<Vec<FailedMessage>, DeadLetterError> {
        let sql = format!("{SELECT_COLUMNS} WHERE status = $1 ORDER BY first_failed_at ASC LIMIT $2");
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;

        rows.iter().map(Self::row_to_failed_message).collect()
    }

    /// Get a specific entry.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::NotFound`] if there is no such entry.
    pub async fn get_by_id(&self, id: i64) -> Result<FailedMessage, DeadLetterError> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?
            .ok_or(DeadLetterError::NotFound(id))?;

        Self::row_to_failed_message(&row)
    }

    /// Update the status of an entry.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::NotFound`] if there is no such entry.
    pub async fn update_status(&self, id: i64, status: DLQStatus) -> Result<(), DeadLetterError> {
        let result = sqlx::query(
            r"
            UPDATE failed_messages
            SET status = $1, last_failed_at = NOW()
            WHERE id = $2
            ",
        )
        .bind(status.as_str())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        if result.rows_affected() == 0 {
            return Err(DeadLetterError::NotFound(id));
        }

        tracing::info!(dlq_id = id, status = status.as_str(), "DLQ entry status updated");
        Ok(())
    }

    /// Mark an entry as resolved.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::NotFound`] if there is no such entry.
    pub async fn mark_resolved(
        &self,
        id: i64,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), DeadLetterError> {
        let result = sqlx::query(
            r"
            UPDATE failed_messages
            SET status = 'resolved',
                resolved_at = NOW(),
                resolved_by = $1,
                resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        if result.rows_affected() == 0 {
            return Err(DeadLetterError::NotFound(id));
        }

        tracing::info!(dlq_id = id, resolved_by = resolved_by, "DLQ entry marked as resolved");
        metrics::counter!("dead_letters_resolved_total").increment(1);
        Ok(())
    }

    /// Mark an entry as permanently discarded.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::NotFound`] if there is no such entry.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), DeadLetterError> {
        let result = sqlx::query(
            r"
            UPDATE failed_messages
            SET status = 'discarded',
                resolved_at = NOW(),
                resolution_notes = $1
            WHERE id = $2
            ",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        if result.rows_affected() == 0 {
            return Err(DeadLetterError::NotFound(id));
        }

        tracing::warn!(dlq_id = id, reason = reason, "DLQ entry marked as discarded");
        metrics::counter!("dead_letters_discarded_total").increment(1);
        Ok(())
    }

    /// Number of pending entries.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::StorageFailed`] if the query fails.
    pub async fn count_pending(&self) -> Result<i64, DeadLetterError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM failed_messages WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(storage_error)?;

        Ok(count)
    }

    fn row_to_failed_message(row: &sqlx::postgres::PgRow) -> Result<FailedMessage, DeadLetterError> {
        let get_err = |e: sqlx::Error| DeadLetterError::StorageFailed(e.to_string());

        let status: String = row.try_get("status").map_err(get_err)?;
        let reason: String = row.try_get("reason").map_err(get_err)?;
        let attempt: i32 = row.try_get("attempt").map_err(get_err)?;

        Ok(FailedMessage {
            id: row.try_get("id").map_err(get_err)?,
            queue: row.try_get("queue").map_err(get_err)?,
            envelope: Envelope {
                kind: row.try_get("message_kind").map_err(get_err)?,
                correlation_id: row.try_get("correlation_id").map_err(get_err)?,
                attempt: u32::try_from(attempt).unwrap_or(0),
                published_at: row.try_get("published_at").map_err(get_err)?,
                payload: row.try_get("payload").map_err(get_err)?,
            },
            reason: DeadLetterReason::parse(&reason).ok_or_else(|| {
                DeadLetterError::StorageFailed(format!("Invalid dead-letter reason: {reason}"))
            })?,
            error_message: row.try_get("error_message").map_err(get_err)?,
            first_failed_at: row.try_get("first_failed_at").map_err(get_err)?,
            last_failed_at: row.try_get("last_failed_at").map_err(get_err)?,
            status: DLQStatus::parse(&status)?,
            resolved_at: row.try_get("resolved_at").map_err(get_err)?,
            resolved_by: row.try_get("resolved_by").map_err(get_err)?,
            resolution_notes: row.try_get("resolution_notes").map_err(get_err)?,
        })
    }
}

impl DeadLetterSink for DeadLetterQueue {
    fn dead_letter(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            self.add_entry(&letter).await?;
            Ok(())
        })
    }
}
