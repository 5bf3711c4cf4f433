//! Queue transport abstraction shared by every pipeline stage.
//!
//! This module provides the [`MessageQueue`] trait: durable publish/subscribe over named
//! queues with **at-least-once** delivery and **explicit acknowledgment**.
//!
//! # Delivery Contract
//!
//! ```text
//!  publish(queue, envelope)
//!          │
//!          ▼
//!  ┌───────────────┐   Delivery { envelope, acker }   ┌──────────────┐
//!  │    broker     │ ───────────────────────────────► │   consumer   │
//!  └───────────────┘                                  └──────┬───────┘
//!          ▲                                                 │
//!          │        ack()  ─► delivery done                  │
//!          └──────  nack() ─► redelivered with attempt + 1 ◄─┘
//! ```
//!
//! - A delivery that is neither acked nor nacked (consumer crash) is redelivered.
//! - Consumers MUST be idempotent: use [`Envelope::correlation_id`] or the state the
//!   message refers to for deduplication.
//! - The consumer acks only after its side effects are committed.
//!
//! # Implementations
//!
//! - `InMemoryQueue` (fulfillment-testing) - For tests
//! - `RedpandaQueue` (fulfillment-redpanda) - For production (Kafka-compatible)

use crate::message::{Envelope, QueueMessage};
use chrono::{DateTime, Utc};
use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during queue operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Broker unreachable or credentials rejected
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a message to a queue
    #[error("Publish failed for queue '{queue}': {reason}")]
    PublishFailed {
        /// The queue that failed
        queue: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to a queue
    #[error("Subscription failed for queue '{queue}': {reason}")]
    SubscriptionFailed {
        /// The queue that failed to subscribe
        queue: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to decode a delivered message
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Failed to ack or nack a delivery
    #[error("Acknowledgement failed: {0}")]
    AcknowledgementFailed(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Settles a single delivery.
///
/// Exactly one of [`ack`](Acknowledger::ack) or [`nack`](Acknowledger::nack) is called
/// per delivery. Dropping the acknowledger without calling either leaves the message
/// unacknowledged, and the broker redelivers it.
pub trait Acknowledger: Send {
    /// Mark the delivery as done.
    fn ack(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send>>;

    /// Reject the delivery; the transport redelivers it with `attempt + 1`.
    fn nack(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send>>;
}

/// A message handed to a consumer, together with the means to settle it.
pub struct Delivery {
    queue: String,
    envelope: Envelope,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    /// Create a new delivery.
    #[must_use]
    pub fn new(queue: impl Into<String>, envelope: Envelope, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            queue: queue.into(),
            envelope,
            acker,
        }
    }

    /// Queue the message came from.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// The delivered envelope.
    #[must_use]
    pub const fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Acknowledge the delivery.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::AcknowledgementFailed`] if the broker rejects the ack.
    pub async fn ack(self) -> Result<(), QueueError> {
        self.acker.ack().await
    }

    /// Reject the delivery for redelivery.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::AcknowledgementFailed`] if the redelivery cannot be scheduled.
    pub async fn nack(self) -> Result<(), QueueError> {
        self.acker.nack().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("envelope", &self.envelope)
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries from a subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, QueueError>> + Send>>;

/// Trait for queue transport implementations.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// so it can be shared as `Arc<dyn MessageQueue>` between workers.
pub trait MessageQueue: Send + Sync {
    /// Publish an envelope to a queue.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::PublishFailed`] if the channel is unavailable and the message
    /// could not be buffered for a later retry.
    fn publish(
        &self,
        queue: &str,
        envelope: &Envelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>>;

    /// Subscribe to a queue and receive a stream of deliveries.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::SubscriptionFailed`] if the subscription cannot be opened.
    fn subscribe(
        &self,
        queue: &str,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, QueueError>> + Send + '_>>;
}

/// Wrap and publish a typed message.
///
/// # Errors
///
/// Returns [`QueueError::PublishFailed`] if the message cannot be encoded or published.
pub async fn publish_message<M: QueueMessage>(
    transport: &dyn MessageQueue,
    queue: &str,
    message: &M,
    published_at: DateTime<Utc>,
) -> Result<(), QueueError> {
    let envelope = Envelope::wrap(message, published_at).map_err(|e| QueueError::PublishFailed {
        queue: queue.to_string(),
        reason: e.to_string(),
    })?;
    transport.publish(queue, &envelope).await
}
