//! Generic queue consumer with ack/nack settlement and automatic reconnection.
//!
//! A [`QueueConsumer`] owns the subscribe-process-reconnect loop for one queue. Stage
//! logic lives in a [`MessageHandler`]; the consumer decides how each delivery is
//! settled from the handler's result:
//!
//! ```text
//! handle(envelope)
//!   Ok                                   ─► ack
//!   Err(Retry)  and attempt + 1 < max    ─► nack (redelivered with attempt + 1)
//!   Err(Retry)  and budget spent         ─► dead-letter(RetriesExhausted), ack
//!   Err(Poison)                          ─► dead-letter(Undecodable), ack
//!   Err(Reconcile)                       ─► dead-letter(NeedsReconciliation), ack
//! ```
//!
//! Messages on one queue are handled one at a time, and the shutdown signal is only
//! observed between messages, so a handler is never interrupted halfway through its
//! side effects.
//!
//! # Example
//!
//! ```rust,ignore
//! let consumer = QueueConsumer::builder()
//!     .name("order-processor")
//!     .queue("orders")
//!     .transport(queue)
//!     .handler(processor)
//!     .dead_letters(dlq)
//!     .shutdown(workers.subscribe())
//!     .max_attempts(5)
//!     .build()?;
//!
//! workers.add("order-processor", consumer.spawn());
//! ```

use crate::metrics::{DeadLetterMetrics, DeliveryOutcome, QueueMetrics};
use crate::retry::{Backoff, RetryPolicy};
use async_trait::async_trait;
use fulfillment_core::dead_letter::{DeadLetter, DeadLetterReason, DeadLetterSink};
use fulfillment_core::environment::{Clock, SystemClock};
use fulfillment_core::message::{Envelope, MessageError};
use fulfillment_core::queue::{Delivery, DeliveryStream, MessageQueue};
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Default number of deliveries a message gets before it is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Why a handler could not finish a message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Transient failure; the message should be delivered again.
    #[error("{0}")]
    Retry(String),

    /// The message can never be processed (malformed, wrong kind).
    #[error("poison message: {0}")]
    Poison(String),

    /// The message was processed but left state that needs a human.
    #[error("needs reconciliation: {0}")]
    Reconcile(String),
}

impl HandlerError {
    /// Wrap any error as a transient failure.
    pub fn retry(error: impl std::fmt::Display) -> Self {
        Self::Retry(error.to_string())
    }
}

impl From<MessageError> for HandlerError {
    fn from(error: MessageError) -> Self {
        Self::Poison(error.to_string())
    }
}

/// Stage logic plugged into a [`QueueConsumer`].
///
/// Handlers receive the raw [`Envelope`] and open it into their message type. They must
/// be idempotent: the same envelope can arrive more than once.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one message.
    ///
    /// # Errors
    ///
    /// Returns a [`HandlerError`] describing how the delivery should be settled.
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError>;
}

/// Errors from assembling a consumer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    /// A required builder field was not set
    #[error("Consumer is missing required field: {0}")]
    MissingField(&'static str),
}

/// Worker loop for a single queue.
pub struct QueueConsumer {
    name: String,
    queue: String,
    transport: Arc<dyn MessageQueue>,
    handler: Arc<dyn MessageHandler>,
    dead_letters: Arc<dyn DeadLetterSink>,
    clock: Arc<dyn Clock>,
    shutdown: broadcast::Receiver<()>,
    max_attempts: u32,
    reconnect: RetryPolicy,
}

impl QueueConsumer {
    /// Create a builder for configuring a consumer.
    #[must_use]
    pub fn builder() -> QueueConsumerBuilder {
        QueueConsumerBuilder::default()
    }

    /// Consumer name used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the consumer as a background task.
    ///
    /// The task runs until the shutdown signal fires (or its sender is dropped).
    #[must_use]
    pub fn spawn(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Run the subscribe-process-reconnect loop until shutdown.
    pub async fn run(&mut self) {
        info!(consumer = %self.name, queue = %self.queue, "Queue consumer started");
        let mut backoff = Backoff::new(self.reconnect.clone());

        loop {
            let subscribed = tokio::select! {
                _ = self.shutdown.recv() => break,
                result = self.transport.subscribe(&self.queue) => result,
            };

            match subscribed {
                Ok(mut stream) => {
                    info!(consumer = %self.name, queue = %self.queue, "Subscribed to queue");
                    if self.process_stream(&mut stream).await.is_shutdown() {
                        break;
                    }
                    backoff.reset();
                }
                Err(e) => {
                    error!(consumer = %self.name, queue = %self.queue, error = %e, "Failed to subscribe to queue");
                }
            }

            let delay = backoff.next_delay();
            warn!(consumer = %self.name, delay_ms = delay.as_millis(), "Reconnecting to queue");
            tokio::select! {
                _ = self.shutdown.recv() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        info!(consumer = %self.name, queue = %self.queue, "Queue consumer stopped");
    }

    async fn process_stream(&mut self, stream: &mut DeliveryStream) -> StreamEnd {
        loop {
            let next = tokio::select! {
                _ = self.shutdown.recv() => return StreamEnd::Shutdown,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delivery)) => self.settle(delivery).await,
                Some(Err(e)) => {
                    error!(consumer = %self.name, error = %e, "Error receiving from queue");
                }
                None => {
                    warn!(consumer = %self.name, "Delivery stream ended");
                    return StreamEnd::Disconnected;
                }
            }
        }
    }

    /// Run the handler on one delivery and settle it.
    async fn settle(&self, delivery: Delivery) {
        let started = Instant::now();
        let envelope = delivery.envelope().clone();
        debug!(
            consumer = %self.name,
            correlation_id = %envelope.correlation_id,
            attempt = envelope.attempt,
            "Handling message"
        );

        let outcome = match self.handler.handle(&envelope).await {
            Ok(()) => self.ack(delivery).await,
            Err(HandlerError::Retry(reason)) if envelope.attempt.saturating_add(1) < self.max_attempts => {
                warn!(
                    consumer = %self.name,
                    correlation_id = %envelope.correlation_id,
                    attempt = envelope.attempt,
                    error = %reason,
                    "Handler failed, message will be redelivered"
                );
                self.nack(delivery).await
            }
            Err(HandlerError::Retry(reason)) => {
                self.dead_letter(delivery, DeadLetterReason::RetriesExhausted, reason).await
            }
            Err(HandlerError::Poison(reason)) => {
                self.dead_letter(delivery, DeadLetterReason::Undecodable, reason).await
            }
            Err(HandlerError::Reconcile(reason)) => {
                self.dead_letter(delivery, DeadLetterReason::NeedsReconciliation, reason).await
            }
        };

        QueueMetrics::record_delivery(&self.queue, outcome, started.elapsed());
    }

    async fn ack(&self, delivery: Delivery) -> DeliveryOutcome {
        if let Err(e) = delivery.ack().await {
            // The broker redelivers; handlers are idempotent.
            error!(consumer = %self.name, error = %e, "Failed to acknowledge delivery");
        }
        DeliveryOutcome::Acked
    }

    async fn nack(&self, delivery: Delivery) -> DeliveryOutcome {
        if let Err(e) = delivery.nack().await {
            error!(consumer = %self.name, error = %e, "Failed to reject delivery");
        }
        DeliveryOutcome::Nacked
    }

    async fn dead_letter(
        &self,
        delivery: Delivery,
        reason: DeadLetterReason,
        error_message: String,
    ) -> DeliveryOutcome {
        let envelope = delivery.envelope().clone();
        error!(
            consumer = %self.name,
            correlation_id = %envelope.correlation_id,
            attempt = envelope.attempt,
            reason = reason.as_str(),
            error = %error_message,
            "Dead-lettering message"
        );

        let letter = DeadLetter {
            queue: self.queue.clone(),
            envelope,
            reason,
            error: error_message,
            failed_at: self.clock.now(),
        };

        match self.dead_letters.dead_letter(letter).await {
            Ok(()) => {
                DeadLetterMetrics::record(&self.queue, reason.as_str());
                self.ack(delivery).await;
                DeliveryOutcome::DeadLettered
            }
            Err(e) => {
                // Never drop a message the sink did not take.
                error!(consumer = %self.name, error = %e, "Dead-letter sink unavailable, redelivering");
                self.nack(delivery).await
            }
        }
    }
}

enum StreamEnd {
    Shutdown,
    Disconnected,
}

impl StreamEnd {
    const fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}

/// Builder for [`QueueConsumer`].
#[derive(Default)]
pub struct QueueConsumerBuilder {
    name: Option<String>,
    queue: Option<String>,
    transport: Option<Arc<dyn MessageQueue>>,
    handler: Option<Arc<dyn MessageHandler>>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    clock: Option<Arc<dyn Clock>>,
    shutdown: Option<broadcast::Receiver<()>>,
    max_attempts: Option<u32>,
    reconnect: Option<RetryPolicy>,
}

impl QueueConsumerBuilder {
    /// Set consumer name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the queue to consume.
    #[must_use]
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Set the transport.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn MessageQueue>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the message handler.
    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Set the dead-letter sink.
    #[must_use]
    pub fn dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Set the clock used to timestamp dead letters (default: system clock).
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set shutdown signal receiver.
    #[must_use]
    pub fn shutdown(mut self, shutdown: broadcast::Receiver<()>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Deliveries per message before dead-lettering (default: 5, minimum 1).
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    /// Reconnect backoff (default: 500ms doubling up to 30s).
    #[must_use]
    pub fn reconnect(mut self, policy: RetryPolicy) -> Self {
        self.reconnect = Some(policy);
        self
    }

    /// Build the consumer.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::MissingField`] if name, queue, transport, handler,
    /// dead-letter sink or shutdown receiver is not set.
    pub fn build(self) -> Result<QueueConsumer, ConsumerError> {
        Ok(QueueConsumer {
            name: self.name.ok_or(ConsumerError::MissingField("name"))?,
            queue: self.queue.ok_or(ConsumerError::MissingField("queue"))?,
            transport: self.transport.ok_or(ConsumerError::MissingField("transport"))?,
            handler: self.handler.ok_or(ConsumerError::MissingField("handler"))?,
            dead_letters: self
                .dead_letters
                .ok_or(ConsumerError::MissingField("dead_letters"))?,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            shutdown: self.shutdown.ok_or(ConsumerError::MissingField("shutdown"))?,
            max_attempts: self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            reconnect: self.reconnect.unwrap_or_else(|| {
                RetryPolicy::builder()
                    .initial_delay(Duration::from_millis(500))
                    .max_delay(Duration::from_secs(30))
                    .build()
            }),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use fulfillment_core::message::{ORDERS_QUEUE, OrderMessage};
    use fulfillment_core::types::{BookId, LineItem, OrderId, UserId};
    use fulfillment_testing::{InMemoryDeadLetters, InMemoryQueue, eventually, test_clock};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` deliveries with the given error.
    struct FlakyHandler {
        failures: u32,
        error: HandlerError,
        calls: AtomicU32,
    }

    impl FlakyHandler {
        fn new(failures: u32, error: HandlerError) -> Arc<Self> {
            Arc::new(Self {
                failures,
                error,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl MessageHandler for FlakyHandler {
        async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
            let _message: OrderMessage = envelope.open()?;
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(self.error.clone())
            } else {
                Ok(())
            }
        }
    }

    struct Harness {
        queue: Arc<InMemoryQueue>,
        dead_letters: Arc<InMemoryDeadLetters>,
        shutdown: broadcast::Sender<()>,
        handle: tokio::task::JoinHandle<()>,
    }

    fn start(handler: Arc<dyn MessageHandler>, max_attempts: u32) -> Harness {
        let queue = Arc::new(InMemoryQueue::new());
        let dead_letters = Arc::new(InMemoryDeadLetters::new());
        let (shutdown, _) = broadcast::channel(1);

        let consumer = QueueConsumer::builder()
            .name("test")
            .queue(ORDERS_QUEUE)
            .transport(queue.clone())
            .handler(handler)
            .dead_letters(dead_letters.clone())
            .clock(Arc::new(test_clock()))
            .shutdown(shutdown.subscribe())
            .max_attempts(max_attempts)
            .reconnect(RetryPolicy::immediate(0))
            .build()
            .expect("consumer");

        Harness {
            queue,
            dead_letters,
            shutdown,
            handle: consumer.spawn(),
        }
    }

    fn order_envelope() -> Envelope {
        let message = OrderMessage::new(
            OrderId::generate(),
            UserId::new(1),
            vec![LineItem::new(BookId::new(1), 1)],
        );
        Envelope::wrap(&message, test_clock().now()).unwrap()
    }

    #[tokio::test]
    async fn successful_messages_are_acked() {
        let handler = FlakyHandler::new(0, HandlerError::Retry(String::new()));
        let harness = start(handler.clone(), 3);

        harness.queue.publish(ORDERS_QUEUE, &order_envelope()).await.unwrap();

        eventually(|| harness.queue.acked(ORDERS_QUEUE).len() == 1).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(harness.dead_letters.entries().is_empty());

        harness.shutdown.send(()).unwrap();
        harness.handle.await.unwrap();
    }

    #[tokio::test]
    async fn transient_failures_are_redelivered_with_bumped_attempt() {
        let handler = FlakyHandler::new(2, HandlerError::Retry("database busy".into()));
        let harness = start(handler.clone(), 5);

        harness.queue.publish(ORDERS_QUEUE, &order_envelope()).await.unwrap();

        eventually(|| harness.queue.acked(ORDERS_QUEUE).len() == 1).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(harness.queue.acked(ORDERS_QUEUE)[0].attempt, 2);
        assert!(harness.dead_letters.entries().is_empty());
    }

    #[tokio::test]
    async fn exhausted_budget_dead_letters_and_acks() {
        let handler = FlakyHandler::new(u32::MAX, HandlerError::Retry("always down".into()));
        let harness = start(handler.clone(), 3);

        harness.queue.publish(ORDERS_QUEUE, &order_envelope()).await.unwrap();

        eventually(|| harness.dead_letters.entries().len() == 1).await;
        let letter = &harness.dead_letters.entries()[0];
        assert_eq!(letter.reason, DeadLetterReason::RetriesExhausted);
        assert_eq!(letter.envelope.attempt, 2);
        assert_eq!(letter.error, "always down");
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

        eventually(|| harness.queue.acked(ORDERS_QUEUE).len() == 1).await;
        assert_eq!(harness.queue.pending(ORDERS_QUEUE), 0);
    }

    #[tokio::test]
    async fn poison_messages_are_dead_lettered_immediately() {
        let handler = FlakyHandler::new(0, HandlerError::Retry(String::new()));
        let harness = start(handler.clone(), 5);

        let poison = Envelope::undecodable(vec![0xde, 0xad], "orders:0:17", test_clock().now());
        harness.queue.publish(ORDERS_QUEUE, &poison).await.unwrap();

        eventually(|| harness.dead_letters.entries().len() == 1).await;
        assert_eq!(harness.dead_letters.entries()[0].reason, DeadLetterReason::Undecodable);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reconcile_errors_are_parked_without_retry() {
        let handler = FlakyHandler::new(1, HandlerError::Reconcile("stock short".into()));
        let harness = start(handler.clone(), 5);

        harness.queue.publish(ORDERS_QUEUE, &order_envelope()).await.unwrap();

        eventually(|| harness.dead_letters.entries().len() == 1).await;
        assert_eq!(
            harness.dead_letters.entries()[0].reason,
            DeadLetterReason::NeedsReconciliation
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let handler = FlakyHandler::new(0, HandlerError::Retry(String::new()));
        let harness = start(handler, 5);

        harness.shutdown.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), harness.handle)
            .await
            .expect("consumer stops promptly")
            .unwrap();
    }

    #[test]
    fn builder_reports_missing_fields() {
        let result = QueueConsumer::builder().name("incomplete").build();
        assert!(matches!(result, Err(ConsumerError::MissingField("queue"))));
    }
}
