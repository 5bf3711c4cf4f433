//! Redpanda queue transport for the order-fulfillment pipeline.
//!
//! This crate provides [`RedpandaQueue`], the production [`MessageQueue`] from
//! `fulfillment-core`. It uses rdkafka, so any Kafka-compatible broker works (Redpanda,
//! Apache Kafka, MSK).
//!
//! Each logical queue (`orders`, `inventory_updates`) is a topic of the same name.
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//!
//! ```text
//!   topic ──► forwarding task ──Delivery──► QueueConsumer ──► handler
//!                   ▲                            │
//!                   │   ack  ─► commit offset    │
//!                   └── nack ─► republish with attempt + 1, then commit
//!                       drop ─► stop without committing (broker redelivers)
//! ```
//!
//! - The forwarding task hands out one delivery at a time and waits for its settlement
//!   before reading the next message, so a partition is consumed in order.
//! - An offset is committed only after the consumer settled the delivery, which in turn
//!   happens only after the handler's side effects committed.
//! - Bytes that do not decode into an [`Envelope`] are delivered as
//!   [`Envelope::undecodable`] so the consumer can dead-letter them.
//! - Envelopes are keyed by correlation id. An order message is keyed by its order id,
//!   an inventory update by `order:book:kind`, so the updates of one order may spread
//!   over several partitions and are only ordered per book and kind.
//!
//! # Publish Buffer
//!
//! A publish the broker does not accept (broker down, queue full) is parked in a bounded
//! in-memory buffer and retried by a background task with exponential backoff. Once the
//! buffer is full, further publishes are dropped with an error log and
//! [`QueueError::PublishFailed`]. The queue is not the system of record, the order store is.
//!
//! # Example
//!
//! ```no_run
//! use fulfillment_core::queue::MessageQueue;
//! use fulfillment_redpanda::RedpandaQueue;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let queue = RedpandaQueue::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("order-fulfillment")
//!     .build()?;
//!
//! let deliveries = queue.subscribe("orders").await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod buffer;

use buffer::{PendingPublish, PublishBuffer};
use chrono::Utc;
use fulfillment_core::message::Envelope;
use fulfillment_core::queue::{Acknowledger, Delivery, DeliveryStream, MessageQueue, QueueError};
use fulfillment_runtime::metrics::QueueMetrics;
use fulfillment_runtime::retry::{Backoff, RetryPolicy};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Default capacity of the publish buffer.
pub const DEFAULT_PUBLISH_BUFFER_CAPACITY: usize = 1000;

/// Redpanda-backed [`MessageQueue`].
///
/// # Configuration
///
/// - **Broker addresses**: bootstrap servers (required)
/// - **Producer settings**: acks, compression, send timeout
/// - **Consumer group**: prefix of the per-queue group id (default `order-fulfillment`)
/// - **Publish buffer**: capacity (default 1000) and flush backoff
/// - **Offset reset**: where a new group starts reading (default `earliest`)
pub struct RedpandaQueue {
    producer: FutureProducer,
    brokers: String,
    timeout: Duration,
    consumer_group: String,
    auto_offset_reset: String,
    redelivery: RetryPolicy,
    buffer: Arc<PublishBuffer>,
    flusher: OnceLock<JoinHandle<()>>,
}

impl RedpandaQueue {
    /// Create a queue with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, QueueError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a builder for custom configuration.
    #[must_use]
    pub fn builder() -> RedpandaQueueBuilder {
        RedpandaQueueBuilder::default()
    }

    /// Consumer group id used for `queue`.
    ///
    /// Each queue gets its own group so a rebalance on one topic never pauses the other.
    #[must_use]
    pub fn group_id(&self, queue: &str) -> String {
        format!("{}.{queue}", self.consumer_group)
    }

    /// Number of publishes waiting in the buffer.
    pub async fn buffered(&self) -> usize {
        self.buffer.len().await
    }

    /// Wait up to `timeout` for the publish buffer and the producer queue to drain.
    ///
    /// Returns the number of records still buffered. Called on shutdown.
    pub async fn flush(&self, timeout: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.buffer.is_empty().await && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let producer = self.producer.clone();
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let flushed = tokio::task::spawn_blocking(move || producer.flush(Timeout::After(remaining))).await;
        if !matches!(flushed, Ok(Ok(()))) {
            tracing::warn!("Producer queue not fully flushed before shutdown");
        }

        let left = self.buffer.len().await;
        if left > 0 {
            tracing::error!(dropped = left, "Publish buffer not drained before shutdown");
        }
        left
    }

    fn ensure_flusher(&self) {
        self.flusher.get_or_init(|| {
            tokio::spawn(flush_buffer(
                self.producer.clone(),
                Arc::clone(&self.buffer),
                self.timeout,
                self.redelivery.clone(),
            ))
        });
    }

    async fn park(&self, queue: &str, entry: PendingPublish, reason: &str) -> Result<(), QueueError> {
        self.ensure_flusher();
        match self.buffer.push(entry).await {
            Ok(depth) => {
                QueueMetrics::record_buffer_depth(depth);
                tracing::warn!(
                    queue = %queue,
                    depth = depth,
                    reason = %reason,
                    "Publish buffered for retry"
                );
                Ok(())
            },
            Err(dropped) => {
                QueueMetrics::record_publish_error(queue);
                tracing::error!(
                    queue = %queue,
                    key = %dropped.key,
                    reason = %reason,
                    "Publish buffer full, message dropped"
                );
                Err(QueueError::PublishFailed {
                    queue: queue.to_string(),
                    reason: format!("publish buffer full: {reason}"),
                })
            },
        }
    }
}

impl Drop for RedpandaQueue {
    fn drop(&mut self) {
        if let Some(flusher) = self.flusher.get() {
            flusher.abort();
        }
    }
}

/// Builder for [`RedpandaQueue`].
#[derive(Default)]
pub struct RedpandaQueueBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    publish_buffer_capacity: Option<usize>,
    auto_offset_reset: Option<String>,
    redelivery: Option<RetryPolicy>,
}

impl RedpandaQueueBuilder {
    /// Set broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: &str) -> Self {
        self.brokers = Some(brokers.to_string());
        self
    }

    /// Set producer acknowledgment mode.
    ///
    /// - `"0"`: No acknowledgment (fastest, least durable)
    /// - `"1"`: Leader acknowledgment
    /// - `"all"`: All in-sync replicas acknowledge (default, most durable)
    #[must_use]
    pub fn producer_acks(mut self, acks: &str) -> Self {
        self.producer_acks = Some(acks.to_string());
        self
    }

    /// Set compression type (`none`, `gzip`, `snappy`, `lz4`, `zstd`).
    #[must_use]
    pub fn compression(mut self, compression: &str) -> Self {
        self.compression = Some(compression.to_string());
        self
    }

    /// Set the send timeout (default: 5 seconds).
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the consumer group prefix; each queue is consumed by `<group>.<queue>`.
    #[must_use]
    pub fn consumer_group(mut self, group: &str) -> Self {
        self.consumer_group = Some(group.to_string());
        self
    }

    /// Set how many failed publishes are held for retry (minimum 1).
    #[must_use]
    pub fn publish_buffer_capacity(mut self, capacity: usize) -> Self {
        self.publish_buffer_capacity = Some(capacity.max(1));
        self
    }

    /// Set where a new consumer group starts reading: `earliest` (default) or `latest`.
    #[must_use]
    pub fn auto_offset_reset(mut self, reset: &str) -> Self {
        self.auto_offset_reset = Some(reset.to_string());
        self
    }

    /// Set the backoff used when re-sending buffered publishes and nacked deliveries.
    #[must_use]
    pub fn redelivery(mut self, policy: RetryPolicy) -> Self {
        self.redelivery = Some(policy);
        self
    }

    /// Build the queue.
    ///
    /// Creating the producer does not contact the broker; an unreachable broker surfaces
    /// as buffered publishes and a subscription that yields transport errors.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ConnectionFailed`] if:
    /// - Brokers are not configured
    /// - The producer cannot be created (invalid configuration)
    pub fn build(self) -> Result<RedpandaQueue, QueueError> {
        let brokers = self
            .brokers
            .ok_or_else(|| QueueError::ConnectionFailed("Brokers not configured".to_string()))?;

        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", acks)
            .set("compression.type", compression)
            .create()
            .map_err(|e| QueueError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        let capacity = self
            .publish_buffer_capacity
            .unwrap_or(DEFAULT_PUBLISH_BUFFER_CAPACITY);
        let consumer_group = self
            .consumer_group
            .unwrap_or_else(|| "order-fulfillment".to_string());
        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| "earliest".to_string());

        tracing::info!(
            brokers = %brokers,
            acks = acks,
            compression = compression,
            consumer_group = %consumer_group,
            publish_buffer_capacity = capacity,
            auto_offset_reset = %auto_offset_reset,
            "RedpandaQueue created"
        );

        Ok(RedpandaQueue {
            producer,
            brokers,
            timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
            consumer_group,
            auto_offset_reset,
            redelivery: self.redelivery.unwrap_or_else(|| {
                RetryPolicy::builder()
                    .max_retries(5)
                    .initial_delay(Duration::from_millis(100))
                    .max_delay(Duration::from_secs(30))
                    .build()
            }),
            buffer: Arc::new(PublishBuffer::new(capacity)),
            flusher: OnceLock::new(),
        })
    }
}

async fn send_record(
    producer: &FutureProducer,
    topic: &str,
    key: &str,
    payload: &[u8],
    timeout: Duration,
) -> Result<(i32, i64), KafkaError> {
    let record = FutureRecord::to(topic).payload(payload).key(key);
    producer
        .send(record, Timeout::After(timeout))
        .await
        .map_err(|(error, _)| error)
}

/// Background task that drains the publish buffer.
///
/// Never gives up on a record: the buffer bound, not the retry budget, limits what is
/// held. The backoff restarts after every successful send.
async fn flush_buffer(producer: FutureProducer, buffer: Arc<PublishBuffer>, timeout: Duration, policy: RetryPolicy) {
    let mut backoff = Backoff::new(policy);
    loop {
        let Some(entry) = buffer.pop().await else {
            QueueMetrics::record_buffer_depth(0);
            buffer.wait().await;
            continue;
        };

        match send_record(&producer, &entry.topic, &entry.key, &entry.payload, timeout).await {
            Ok((partition, offset)) => {
                backoff.reset();
                QueueMetrics::record_publish(&entry.topic);
                QueueMetrics::record_buffer_depth(buffer.len().await);
                tracing::info!(
                    topic = %entry.topic,
                    key = %entry.key,
                    partition = partition,
                    offset = offset,
                    "Buffered publish delivered"
                );
            },
            Err(error) => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    topic = %entry.topic,
                    attempt = backoff.attempts(),
                    delay_ms = delay.as_millis(),
                    error = %error,
                    "Buffered publish failed, retrying"
                );
                buffer.requeue(entry).await;
                tokio::time::sleep(delay).await;
            },
        }
    }
}

impl MessageQueue for RedpandaQueue {
    fn publish(
        &self,
        queue: &str,
        envelope: &Envelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
        let queue = queue.to_string();
        let envelope = envelope.clone();

        Box::pin(async move {
            let payload = envelope.to_bytes().map_err(|e| QueueError::PublishFailed {
                queue: queue.clone(),
                reason: e.to_string(),
            })?;
            let entry = PendingPublish {
                topic: queue.clone(),
                key: envelope.correlation_id.clone(),
                payload,
            };

            // Older records are still waiting: queue behind them to keep per-key order.
            if !self.buffer.is_empty().await {
                return self.park(&queue, entry, "earlier publishes still buffered").await;
            }

            match send_record(&self.producer, &queue, &entry.key, &entry.payload, self.timeout).await {
                Ok((partition, offset)) => {
                    QueueMetrics::record_publish(&queue);
                    tracing::debug!(
                        queue = %queue,
                        partition = partition,
                        offset = offset,
                        kind = %envelope.kind,
                        correlation_id = %envelope.correlation_id,
                        attempt = envelope.attempt,
                        "Message published"
                    );
                    Ok(())
                },
                Err(error) => self.park(&queue, entry, &error.to_string()).await,
            }
        })
    }

    fn subscribe(
        &self,
        queue: &str,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, QueueError>> + Send + '_>> {
        let queue = queue.to_string();

        Box::pin(async move {
            let group_id = self.group_id(&queue);

            // Manual commit: an offset moves only when its delivery is settled.
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .set("group.id", &group_id)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &self.auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| QueueError::SubscriptionFailed {
                    queue: queue.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            consumer
                .subscribe(&[queue.as_str()])
                .map_err(|e| QueueError::SubscriptionFailed {
                    queue: queue.clone(),
                    reason: format!("Failed to subscribe: {e}"),
                })?;

            tracing::info!(
                queue = %queue,
                consumer_group = %group_id,
                auto_offset_reset = %self.auto_offset_reset,
                manual_commit = true,
                "Subscribed to queue"
            );

            let (tx, rx) = mpsc::channel(1);
            tokio::spawn(forward(
                consumer,
                queue,
                self.producer.clone(),
                self.timeout,
                self.redelivery.clone(),
                tx,
            ));

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

/// How the consumer settled a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Ack,
    Nack,
}

struct Settle {
    settlement: Settlement,
    reply: oneshot::Sender<Result<(), QueueError>>,
}

/// Hands the consumer's decision back to the forwarding task.
struct RedpandaAcker {
    settle: oneshot::Sender<Settle>,
}

impl RedpandaAcker {
    fn send(self, settlement: Settlement) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send>> {
        Box::pin(async move {
            let (reply, done) = oneshot::channel();
            self.settle
                .send(Settle { settlement, reply })
                .map_err(|_| QueueError::AcknowledgementFailed("subscription closed".to_string()))?;
            done.await
                .map_err(|_| QueueError::AcknowledgementFailed("subscription closed".to_string()))?
        })
    }
}

impl Acknowledger for RedpandaAcker {
    fn ack(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send>> {
        (*self).send(Settlement::Ack)
    }

    fn nack(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send>> {
        (*self).send(Settlement::Nack)
    }
}

/// Correlation id for a raw record that could not be decoded.
fn record_position(topic: &str, partition: i32, offset: i64) -> String {
    format!("{topic}:{partition}:{offset}")
}

/// Decode a record into an envelope, falling back to [`Envelope::undecodable`].
fn decode_record(payload: Option<&[u8]>, topic: &str, partition: i32, offset: i64) -> Envelope {
    let position = record_position(topic, partition, offset);
    let Some(bytes) = payload else {
        tracing::warn!(position = %position, "Record has no payload");
        return Envelope::undecodable(Vec::new(), position, Utc::now());
    };

    match Envelope::from_bytes(bytes) {
        Ok(envelope) => envelope,
        Err(error) => {
            tracing::warn!(position = %position, error = %error, "Record is not a valid envelope");
            Envelope::undecodable(bytes.to_vec(), position, Utc::now())
        },
    }
}

/// Owns the consumer: hands out one delivery at a time and commits after settlement.
async fn forward(
    consumer: StreamConsumer,
    queue: String,
    producer: FutureProducer,
    timeout: Duration,
    redelivery: RetryPolicy,
    tx: mpsc::Sender<Result<Delivery, QueueError>>,
) {
    use futures::StreamExt;

    let mut stream = consumer.stream();

    loop {
        let next = tokio::select! {
            () = tx.closed() => break,
            next = stream.next() => next,
        };
        let Some(result) = next else { break };

        let message = match result {
            Ok(message) => message,
            Err(e) => {
                let err = QueueError::TransportError(format!("Failed to receive message: {e}"));
                if tx.send(Err(err)).await.is_err() {
                    break;
                }
                continue;
            },
        };

        let envelope = decode_record(message.payload(), message.topic(), message.partition(), message.offset());
        tracing::trace!(
            topic = message.topic(),
            partition = message.partition(),
            offset = message.offset(),
            kind = %envelope.kind,
            attempt = envelope.attempt,
            "Received message"
        );

        let (settle_tx, settle_rx) = oneshot::channel();
        let acker = RedpandaAcker { settle: settle_tx };
        let delivery = Delivery::new(queue.clone(), envelope.clone(), Box::new(acker));
        if tx.send(Ok(delivery)).await.is_err() {
            tracing::debug!(queue = %queue, "Subscriber dropped, exiting forwarding task");
            break;
        }

        // A dropped acker leaves the offset uncommitted; the next subscription re-reads it.
        let Ok(Settle { settlement, reply }) = settle_rx.await else {
            tracing::warn!(
                queue = %queue,
                offset = message.offset(),
                "Delivery dropped unsettled, stopping without commit"
            );
            break;
        };

        let outcome = match settlement {
            Settlement::Ack => Ok(()),
            Settlement::Nack => republish(&producer, &queue, &envelope, timeout, &redelivery).await,
        };

        if outcome.is_ok() {
            commit(&consumer, &message);
        }
        let failed = outcome.is_err();
        let _ = reply.send(outcome);
        if failed {
            // Uncommitted offset: stop so the broker hands the message out again.
            break;
        }
    }

    tracing::debug!(queue = %queue, "Forwarding task exiting");
}

fn commit(consumer: &StreamConsumer, message: &BorrowedMessage<'_>) {
    if let Err(e) = consumer.commit_message(message, CommitMode::Async) {
        tracing::warn!(
            topic = message.topic(),
            partition = message.partition(),
            offset = message.offset(),
            error = %e,
            "Failed to commit offset (message may be redelivered)"
        );
    }
}

/// Send the redelivery of a nacked envelope to the tail of its topic.
async fn republish(
    producer: &FutureProducer,
    queue: &str,
    envelope: &Envelope,
    timeout: Duration,
    policy: &RetryPolicy,
) -> Result<(), QueueError> {
    let redelivery = envelope.redelivery();
    let payload = redelivery.to_bytes().map_err(|e| QueueError::PublishFailed {
        queue: queue.to_string(),
        reason: e.to_string(),
    })?;

    let mut backoff = Backoff::new(policy.clone());
    loop {
        match send_record(producer, queue, &redelivery.correlation_id, &payload, timeout).await {
            Ok(_) => {
                QueueMetrics::record_publish(queue);
                tracing::debug!(
                    queue = %queue,
                    correlation_id = %redelivery.correlation_id,
                    attempt = redelivery.attempt,
                    "Message scheduled for redelivery"
                );
                return Ok(());
            },
            Err(error) if backoff.attempts() < policy.max_retries => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    queue = %queue,
                    error = %error,
                    delay_ms = delay.as_millis(),
                    "Redelivery publish failed, retrying"
                );
                tokio::time::sleep(delay).await;
            },
            Err(error) => {
                QueueMetrics::record_publish_error(queue);
                tracing::error!(queue = %queue, error = %error, "Redelivery publish failed");
                return Err(QueueError::AcknowledgementFailed(format!(
                    "redelivery publish failed: {error}"
                )));
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fulfillment_core::message::{OrderMessage, UNDECODABLE_KIND};
    use fulfillment_core::types::{OrderId, UserId};

    #[test]
    fn redpanda_queue_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaQueue>();
        assert_sync::<RedpandaQueue>();
    }

    #[test]
    fn build_without_brokers_fails() {
        let result = RedpandaQueue::builder().build();
        assert!(matches!(result, Err(QueueError::ConnectionFailed(_))));
    }

    #[test]
    fn valid_records_decode_to_their_envelope() {
        let message = OrderMessage::new(OrderId::generate(), UserId::new(1), vec![]);
        let envelope = Envelope::wrap(&message, Utc::now()).ok();
        let bytes = envelope.as_ref().and_then(|e| e.to_bytes().ok());

        let decoded = decode_record(bytes.as_deref(), "orders", 0, 7);
        assert_eq!(Some(decoded), envelope);
    }

    #[test]
    fn garbage_records_become_undecodable_envelopes() {
        let decoded = decode_record(Some(&[0xff, 0x00, 0x13]), "orders", 2, 41);

        assert_eq!(decoded.kind, UNDECODABLE_KIND);
        assert_eq!(decoded.correlation_id, "orders:2:41");
        assert_eq!(decoded.payload, vec![0xff, 0x00, 0x13]);
        assert!(decoded.open::<OrderMessage>().is_err());
    }

    #[test]
    fn empty_records_become_undecodable_envelopes() {
        let decoded = decode_record(None, "inventory_updates", 0, 3);
        assert_eq!(decoded.kind, UNDECODABLE_KIND);
        assert!(decoded.payload.is_empty());
    }

    #[tokio::test]
    async fn settling_after_the_subscription_closed_fails() {
        let (settle, settle_rx) = oneshot::channel();
        drop(settle_rx);
        let acker: Box<dyn Acknowledger> = Box::new(RedpandaAcker { settle });

        let result = acker.ack().await;
        assert!(matches!(result, Err(QueueError::AcknowledgementFailed(_))));
    }

    #[tokio::test]
    async fn acker_waits_for_the_forwarding_task_reply() {
        let (settle, settle_rx) = oneshot::channel::<Settle>();
        let acker: Box<dyn Acknowledger> = Box::new(RedpandaAcker { settle });

        let forwarder = tokio::spawn(async move {
            let request = settle_rx.await.ok();
            let settlement = request.as_ref().map(|r| r.settlement);
            if let Some(request) = request {
                let _ = request.reply.send(Ok(()));
            }
            settlement
        });

        assert_eq!(acker.nack().await, Ok(()));
        assert!(matches!(forwarder.await, Ok(Some(Settlement::Nack))));
    }

    #[tokio::test]
    async fn group_ids_are_per_queue() {
        let queue = RedpandaQueue::builder()
            .brokers("localhost:9092")
            .consumer_group("bookstore")
            .build();
        assert!(queue.is_ok());
        if let Ok(queue) = queue {
            assert_eq!(queue.group_id("orders"), "bookstore.orders");
            assert_eq!(queue.group_id("inventory_updates"), "bookstore.inventory_updates");
        }
    }
}
