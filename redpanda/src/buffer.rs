//! Bounded holding area for publishes the broker did not accept.

use std::collections::VecDeque;
use tokio::sync::{Mutex, Notify};

/// A record waiting to be sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingPublish {
    /// Destination topic
    pub topic: String,
    /// Partitioning key
    pub key: String,
    /// Encoded envelope
    pub payload: Vec<u8>,
}

/// FIFO of [`PendingPublish`] records with a hard capacity.
///
/// The flush task waits on [`PublishBuffer::wait`] and drains from the front; a record
/// whose send fails again goes back to the front so per-topic order is kept.
#[derive(Debug)]
pub struct PublishBuffer {
    capacity: usize,
    entries: Mutex<VecDeque<PendingPublish>>,
    notify: Notify,
}

impl PublishBuffer {
    /// Empty buffer holding at most `capacity` records.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Append a record.
    ///
    /// Returns the new depth, or hands the record back when the buffer is full.
    pub async fn push(&self, entry: PendingPublish) -> Result<usize, PendingPublish> {
        let mut entries = self.entries.lock().await;
        if entries.len() >= self.capacity {
            return Err(entry);
        }
        entries.push_back(entry);
        let depth = entries.len();
        drop(entries);

        self.notify.notify_one();
        Ok(depth)
    }

    /// Put a record back at the head after a failed send.
    ///
    /// A retried record may push the depth one past capacity for the duration of the
    /// retry; new publishes are still refused.
    pub async fn requeue(&self, entry: PendingPublish) {
        self.entries.lock().await.push_front(entry);
    }

    /// Take the oldest record.
    pub async fn pop(&self) -> Option<PendingPublish> {
        self.entries.lock().await.pop_front()
    }

    /// Number of buffered records.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether nothing is buffered.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Sleep until a record is pushed.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(n: u8) -> PendingPublish {
        PendingPublish {
            topic: "orders".to_string(),
            key: format!("key-{n}"),
            payload: vec![n],
        }
    }

    #[tokio::test]
    async fn refuses_records_beyond_capacity() {
        let buffer = PublishBuffer::new(2);

        assert_eq!(buffer.push(record(1)).await, Ok(1));
        assert_eq!(buffer.push(record(2)).await, Ok(2));
        assert_eq!(buffer.push(record(3)).await, Err(record(3)));
        assert_eq!(buffer.len().await, 2);
    }

    #[tokio::test]
    async fn requeued_records_are_sent_first() {
        let buffer = PublishBuffer::new(4);
        buffer.push(record(1)).await.ok();
        buffer.push(record(2)).await.ok();

        let first = buffer.pop().await;
        assert_eq!(first, Some(record(1)));
        buffer.requeue(record(1)).await;

        assert_eq!(buffer.pop().await, Some(record(1)));
        assert_eq!(buffer.pop().await, Some(record(2)));
        assert!(buffer.is_empty().await);
    }

    #[tokio::test]
    async fn push_wakes_a_waiter() {
        let buffer = std::sync::Arc::new(PublishBuffer::new(1));
        let waiter = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.wait().await })
        };

        buffer.push(record(1)).await.ok();
        let woke = tokio::time::timeout(std::time::Duration::from_secs(1), waiter).await;
        assert!(matches!(woke, Ok(Ok(()))));
    }
}
