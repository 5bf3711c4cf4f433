//! Publishing with bounded retries.
//!
//! Every publish in the pipeline goes through [`publish_with_retry`]. [`InventoryPublisher`]
//! builds the per-item reservation and restock messages of an order and reports the ones
//! that could not be published. [`InventoryPublisher::park`] dead-letters them, so a
//! stock adjustment that never reached the queue is still visible to an operator.

use fulfillment_core::dead_letter::{DeadLetter, DeadLetterReason, DeadLetterSink};
use fulfillment_core::environment::Clock;
use fulfillment_core::message::{Envelope, InventoryUpdateMessage, QueueMessage};
use fulfillment_core::queue::{MessageQueue, QueueError};
use fulfillment_core::types::Order;
use fulfillment_runtime::metrics::DeadLetterMetrics;
use fulfillment_runtime::retry::{RetryPolicy, retry_with_backoff};
use std::sync::Arc;

/// Publish one envelope, retrying transport failures with backoff.
///
/// # Errors
///
/// Returns the last [`QueueError`] once the policy's retries are spent.
pub async fn publish_with_retry(
    transport: &dyn MessageQueue,
    queue: &str,
    envelope: &Envelope,
    policy: &RetryPolicy,
) -> Result<(), QueueError> {
    retry_with_backoff(policy, || transport.publish(queue, envelope)).await
}

/// Pack a message for publishing.
///
/// # Errors
///
/// Returns [`QueueError::PublishFailed`] if the message cannot be encoded.
pub fn envelope_for<M: QueueMessage>(message: &M, queue: &str, clock: &dyn Clock) -> Result<Envelope, QueueError> {
    Envelope::wrap(message, clock.now()).map_err(|e| QueueError::PublishFailed {
        queue: queue.to_string(),
        reason: e.to_string(),
    })
}

/// Dead-letter a message that could not be published.
///
/// # Errors
///
/// Returns `error` back if the dead letter sink rejects the entry too; the message is
/// then lost and the caller must say so.
pub async fn dead_letter_unpublished(
    sink: &dyn DeadLetterSink,
    queue: &str,
    envelope: Envelope,
    error: &QueueError,
    clock: &dyn Clock,
) -> Result<(), QueueError> {
    tracing::error!(
        queue = %queue,
        correlation_id = %envelope.correlation_id,
        error = %error,
        "Publish failed after retries, dead-lettering"
    );
    let reason = DeadLetterReason::PublishFailed;
    let letter = DeadLetter {
        queue: queue.to_string(),
        envelope,
        reason,
        error: error.to_string(),
        failed_at: clock.now(),
    };

    match sink.dead_letter(letter).await {
        Ok(()) => {
            DeadLetterMetrics::record(queue, reason.as_str());
            Ok(())
        }
        Err(e) => {
            tracing::error!(queue = %queue, error = %e, "Dead letter sink unavailable");
            Err(error.clone())
        }
    }
}

/// A message that exhausted its publish retries.
#[derive(Debug, Clone)]
pub struct FailedPublish {
    /// The message that was not published
    pub envelope: Envelope,
    /// Last error from the transport
    pub error: QueueError,
}

impl FailedPublish {
    /// A message that could not even be encoded.
    ///
    /// The envelope carries the message's debug rendering instead of a payload, under
    /// the message's own correlation id.
    fn unencodable(message: &InventoryUpdateMessage, error: QueueError, clock: &dyn Clock) -> Self {
        Self {
            envelope: Envelope::undecodable(
                format!("{message:?}").into_bytes(),
                message.correlation_id(),
                clock.now(),
            ),
            error,
        }
    }
}

/// Publishes an order's stock adjustments to the inventory queue.
#[derive(Clone)]
pub struct InventoryPublisher {
    transport: Arc<dyn MessageQueue>,
    queue: String,
    dead_letters: Arc<dyn DeadLetterSink>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl InventoryPublisher {
    /// Create a publisher for `queue`.
    #[must_use]
    pub fn new(
        transport: Arc<dyn MessageQueue>,
        queue: impl Into<String>,
        dead_letters: Arc<dyn DeadLetterSink>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            queue: queue.into(),
            dead_letters,
            clock,
            retry,
        }
    }

    /// Name of the inventory queue.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// One reservation (negative delta) per line item.
    ///
    /// Returns the messages that could not be published.
    pub async fn reserve(&self, order: &Order) -> Vec<FailedPublish> {
        let messages = order
            .items
            .iter()
            .map(|item| InventoryUpdateMessage::reservation(order.id, item));
        self.publish_all(messages).await
    }

    /// One compensating restock (positive delta) per line item.
    ///
    /// Returns the messages that could not be published.
    pub async fn restock(&self, order: &Order) -> Vec<FailedPublish> {
        let messages = order
            .items
            .iter()
            .map(|item| InventoryUpdateMessage::restock(order.id, item));
        self.publish_all(messages).await
    }

    /// Dead-letter messages that [`reserve`](Self::reserve) or
    /// [`restock`](Self::restock) could not publish.
    ///
    /// Returns how many were lost because the dead letter sink failed as well.
    pub async fn park(&self, failed: Vec<FailedPublish>) -> usize {
        let mut lost = 0;
        for FailedPublish { envelope, error } in failed {
            let correlation_id = envelope.correlation_id.clone();
            if dead_letter_unpublished(
                self.dead_letters.as_ref(),
                &self.queue,
                envelope,
                &error,
                self.clock.as_ref(),
            )
            .await
            .is_err()
            {
                tracing::error!(correlation_id = %correlation_id, "Inventory update lost");
                lost += 1;
            }
        }
        lost
    }

    async fn publish_all(&self, messages: impl Iterator<Item = InventoryUpdateMessage>) -> Vec<FailedPublish> {
        let mut failed = Vec::new();
        for message in messages {
            let envelope = match envelope_for(&message, &self.queue, self.clock.as_ref()) {
                Ok(envelope) => envelope,
                Err(error) => {
                    tracing::error!(
                        order_id = %message.order_id,
                        book_id = %message.book_id,
                        error = %error,
                        "Failed to encode inventory update"
                    );
                    failed.push(FailedPublish::unencodable(&message, error, self.clock.as_ref()));
                    continue;
                }
            };

            match publish_with_retry(self.transport.as_ref(), &self.queue, &envelope, &self.retry).await {
                Ok(()) => tracing::debug!(
                    order_id = %message.order_id,
                    book_id = %message.book_id,
                    delta = message.quantity_delta,
                    "Inventory update published"
                ),
                Err(error) => failed.push(FailedPublish { envelope, error }),
            }
        }
        failed
    }
}
