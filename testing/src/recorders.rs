//! Recording notifier and dead-letter sink.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on a poisoned lock

use fulfillment_core::dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink};
use fulfillment_core::notify::{Notifier, OrderNotification};
use fulfillment_core::types::{OrderId, OrderStatus};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

/// [`Notifier`] that keeps everything it is told.
#[derive(Clone, Debug, Default)]
pub struct RecordingNotifier {
    user: Arc<Mutex<Vec<OrderNotification>>>,
    global: Arc<Mutex<Vec<String>>>,
}

impl RecordingNotifier {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every user notification, in send order.
    #[must_use]
    pub fn user_notifications(&self) -> Vec<OrderNotification> {
        self.user.lock().unwrap().clone()
    }

    /// Statuses announced for one order, in send order.
    #[must_use]
    pub fn statuses_for(&self, order_id: OrderId) -> Vec<OrderStatus> {
        self.user
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.order_id == order_id)
            .map(|n| n.status)
            .collect()
    }

    /// Every global message, in send order.
    #[must_use]
    pub fn global_messages(&self) -> Vec<String> {
        self.global.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify_user(&self, notification: OrderNotification) {
        self.user.lock().unwrap().push(notification);
    }

    fn notify_global(&self, message: &str) {
        self.global.lock().unwrap().push(message.to_string());
    }
}

/// [`DeadLetterSink`] backed by a `Vec`, with optional injected outages.
#[derive(Clone, Debug, Default)]
pub struct InMemoryDeadLetters {
    entries: Arc<Mutex<Vec<DeadLetter>>>,
    unavailable: Arc<Mutex<bool>>,
}

impl InMemoryDeadLetters {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every parked message, in order.
    #[must_use]
    pub fn entries(&self) -> Vec<DeadLetter> {
        self.entries.lock().unwrap().clone()
    }

    /// Make the sink reject writes until called again with `false`.
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock().unwrap() = unavailable;
    }
}

impl DeadLetterSink for InMemoryDeadLetters {
    fn dead_letter(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            if *self.unavailable.lock().unwrap() {
                return Err(DeadLetterError::StorageFailed("sink unavailable".to_string()));
            }
            self.entries.lock().unwrap().push(letter);
            Ok(())
        })
    }
}
