//! In-memory queue transport with real ack/nack semantics.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on a poisoned lock

use fulfillment_core::message::Envelope;
use fulfillment_core::queue::{Acknowledger, Delivery, DeliveryStream, MessageQueue, QueueError};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Per-queue bookkeeping visible to tests.
#[derive(Debug, Default)]
struct QueueLog {
    published: Vec<Envelope>,
    acked: Vec<Envelope>,
    nacked: Vec<Envelope>,
    pending: usize,
    fail_publishes: u32,
}

struct Channel {
    tx: mpsc::UnboundedSender<Envelope>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>>,
}

type Logs = Arc<Mutex<HashMap<String, QueueLog>>>;

/// In-memory [`MessageQueue`].
///
/// Behaves like the broker as far as consumers can tell:
/// - `nack` re-enqueues the envelope with `attempt + 1`
/// - a delivery dropped without being settled is re-enqueued unchanged
/// - several subscribers on one queue compete for messages
///
/// Publishes, acks and nacks are recorded for assertions, and publish failures can be
/// injected with [`fail_next_publishes`](InMemoryQueue::fail_next_publishes).
///
/// # Example
///
/// ```
/// use fulfillment_testing::InMemoryQueue;
/// use fulfillment_core::queue::MessageQueue;
/// use fulfillment_core::message::{Envelope, OrderMessage};
/// # use fulfillment_core::types::{OrderId, UserId};
///
/// # tokio_test::block_on(async {
/// let queue = InMemoryQueue::new();
/// let message = OrderMessage::new(OrderId::generate(), UserId::new(1), vec![]);
/// let envelope = Envelope::wrap(&message, chrono::Utc::now()).unwrap();
///
/// queue.publish("orders", &envelope).await.unwrap();
/// assert_eq!(queue.published("orders").len(), 1);
/// assert_eq!(queue.pending("orders"), 1);
/// # });
/// ```
#[derive(Default)]
pub struct InMemoryQueue {
    channels: Mutex<HashMap<String, Channel>>,
    logs: Logs,
}

impl InMemoryQueue {
    /// Create an empty transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, queue: &str) -> mpsc::UnboundedSender<Envelope> {
        self.channel(queue).0
    }

    fn channel(
        &self,
        queue: &str,
    ) -> (
        mpsc::UnboundedSender<Envelope>,
        Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>>,
    ) {
        let mut channels = self.channels.lock().unwrap();
        let channel = channels.entry(queue.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            Channel {
                tx,
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
            }
        });
        (channel.tx.clone(), Arc::clone(&channel.rx))
    }

    /// Make the next `count` publishes to `queue` fail with [`QueueError::PublishFailed`].
    pub fn fail_next_publishes(&self, queue: &str, count: u32) {
        self.logs
            .lock()
            .unwrap()
            .entry(queue.to_string())
            .or_default()
            .fail_publishes = count;
    }

    /// Every envelope successfully published to `queue`, in order (redeliveries excluded).
    #[must_use]
    pub fn published(&self, queue: &str) -> Vec<Envelope> {
        self.read(queue, |log| log.published.clone())
    }

    /// Every envelope acknowledged on `queue`, in order.
    #[must_use]
    pub fn acked(&self, queue: &str) -> Vec<Envelope> {
        self.read(queue, |log| log.acked.clone())
    }

    /// Every envelope rejected on `queue`, in order.
    #[must_use]
    pub fn nacked(&self, queue: &str) -> Vec<Envelope> {
        self.read(queue, |log| log.nacked.clone())
    }

    /// Messages on `queue` that are not acknowledged yet, queued or in flight.
    #[must_use]
    pub fn pending(&self, queue: &str) -> usize {
        self.read(queue, |log| log.pending)
    }

    fn read<T: Default>(&self, queue: &str, f: impl FnOnce(&QueueLog) -> T) -> T {
        self.logs.lock().unwrap().get(queue).map(f).unwrap_or_default()
    }
}

impl MessageQueue for InMemoryQueue {
    fn publish(
        &self,
        queue: &str,
        envelope: &Envelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send + '_>> {
        let queue = queue.to_string();
        let envelope = envelope.clone();
        Box::pin(async move {
            {
                let mut logs = self.logs.lock().unwrap();
                let log = logs.entry(queue.clone()).or_default();
                if log.fail_publishes > 0 {
                    log.fail_publishes -= 1;
                    return Err(QueueError::PublishFailed {
                        queue,
                        reason: "injected failure".to_string(),
                    });
                }
                log.published.push(envelope.clone());
                log.pending += 1;
            }

            self.sender(&queue)
                .send(envelope)
                .map_err(|e| QueueError::PublishFailed {
                    queue,
                    reason: e.to_string(),
                })
        })
    }

    fn subscribe(
        &self,
        queue: &str,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, QueueError>> + Send + '_>> {
        let queue = queue.to_string();
        Box::pin(async move {
            let (tx, rx) = self.channel(&queue);
            let logs = Arc::clone(&self.logs);

            let stream = futures::stream::unfold((), move |()| {
                let rx = Arc::clone(&rx);
                let tx = tx.clone();
                let logs = Arc::clone(&logs);
                let queue = queue.clone();
                async move {
                    let envelope = rx.lock().await.recv().await?;
                    let acker = InMemoryAcker {
                        queue: queue.clone(),
                        envelope: Some(envelope.clone()),
                        tx,
                        logs,
                    };
                    Some((Ok::<_, QueueError>(Delivery::new(queue, envelope, Box::new(acker))), ()))
                }
            });

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

struct InMemoryAcker {
    queue: String,
    envelope: Option<Envelope>,
    tx: mpsc::UnboundedSender<Envelope>,
    logs: Logs,
}

impl InMemoryAcker {
    fn with_log(&self, f: impl FnOnce(&mut QueueLog)) {
        let mut logs = self.logs.lock().unwrap();
        f(logs.entry(self.queue.clone()).or_default());
    }
}

impl Acknowledger for InMemoryAcker {
    fn ack(mut self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send>> {
        if let Some(envelope) = self.envelope.take() {
            self.with_log(|log| {
                log.acked.push(envelope);
                log.pending = log.pending.saturating_sub(1);
            });
        }
        Box::pin(async { Ok(()) })
    }

    fn nack(mut self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), QueueError>> + Send>> {
        let result = match self.envelope.take() {
            Some(envelope) => {
                self.with_log(|log| log.nacked.push(envelope.clone()));
                self.tx
                    .send(envelope.redelivery())
                    .map_err(|e| QueueError::AcknowledgementFailed(e.to_string()))
            }
            None => Ok(()),
        };
        Box::pin(async move { result })
    }
}

impl Drop for InMemoryAcker {
    fn drop(&mut self) {
        if let Some(envelope) = self.envelope.take() {
            let _ = self.tx.send(envelope);
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use fulfillment_core::message::OrderMessage;
    use fulfillment_core::types::{OrderId, UserId};
    use futures::StreamExt;

    fn envelope() -> Envelope {
        let message = OrderMessage::new(OrderId::generate(), UserId::new(7), vec![]);
        Envelope::wrap(&message, chrono::Utc::now()).expect("wrap")
    }

    #[tokio::test]
    async fn nack_redelivers_with_next_attempt() {
        let queue = InMemoryQueue::new();
        queue.publish("orders", &envelope()).await.unwrap();
        let mut stream = queue.subscribe("orders").await.unwrap();

        let first = stream.next().await.expect("delivery").unwrap();
        assert_eq!(first.envelope().attempt, 0);
        first.nack().await.unwrap();

        let second = stream.next().await.expect("redelivery").unwrap();
        assert_eq!(second.envelope().attempt, 1);
        second.ack().await.unwrap();

        assert_eq!(queue.pending("orders"), 0);
        assert_eq!(queue.nacked("orders").len(), 1);
        assert_eq!(queue.acked("orders").len(), 1);
    }

    #[tokio::test]
    async fn dropped_delivery_is_redelivered_unchanged() {
        let queue = InMemoryQueue::new();
        queue.publish("orders", &envelope()).await.unwrap();
        let mut stream = queue.subscribe("orders").await.unwrap();

        drop(stream.next().await.expect("delivery").unwrap());

        let again = stream.next().await.expect("redelivery").unwrap();
        assert_eq!(again.envelope().attempt, 0);
        assert_eq!(queue.pending("orders"), 1);
    }

    #[tokio::test]
    async fn injected_publish_failures_are_consumed() {
        let queue = InMemoryQueue::new();
        queue.fail_next_publishes("orders", 1);

        assert!(queue.publish("orders", &envelope()).await.is_err());
        assert!(queue.publish("orders", &envelope()).await.is_ok());
        assert_eq!(queue.published("orders").len(), 1);
    }
}
