//! Notification gateway.
//!
//! [`BroadcastNotifier`] fans every notification out on a `tokio::sync::broadcast`
//! channel. The WebSocket layer (outside this crate) subscribes and forwards the JSON
//! form of each [`Notification`] to connected users. Sending never blocks and never
//! fails: with nobody listening, or a listener lagging behind, notifications are lost.

use fulfillment_core::notify::{Notifier, OrderNotification};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default channel capacity.
pub const DEFAULT_CAPACITY: usize = 1024;

/// One message for the notification collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// Status change for one user's order
    OrderStatus(OrderNotification),
    /// Announcement for every connected user
    Global {
        /// Text to show
        message: String,
    },
}

impl Notification {
    /// Wire form sent over the WebSocket.
    ///
    /// # Errors
    ///
    /// Returns the serializer's error; not expected for these types.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// [`Notifier`] backed by a broadcast channel.
#[derive(Clone, Debug)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    /// Create a notifier whose subscribers may fall `capacity` messages behind.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive every notification sent from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    fn send(&self, notification: Notification) {
        if self.sender.send(notification).is_err() {
            tracing::trace!("No notification subscribers");
        }
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Notifier for BroadcastNotifier {
    fn notify_user(&self, notification: OrderNotification) {
        tracing::debug!(
            user_id = %notification.user_id,
            order_id = %notification.order_id,
            status = %notification.status,
            "Notifying user"
        );
        self.send(Notification::OrderStatus(notification));
    }

    fn notify_global(&self, message: &str) {
        tracing::debug!(message = %message, "Broadcasting global notification");
        self.send(Notification::Global {
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use fulfillment_core::types::{OrderId, OrderStatus, UserId};

    #[tokio::test]
    async fn subscribers_receive_user_and_global_notifications() {
        let notifier = BroadcastNotifier::default();
        let mut rx = notifier.subscribe();
        let order_id = OrderId::generate();

        notifier.notify_user(OrderNotification::new(UserId::new(3), order_id, OrderStatus::Shipped));
        notifier.notify_global("Book 9 is back in stock");

        match rx.recv().await.unwrap() {
            Notification::OrderStatus(n) => {
                assert_eq!(n.order_id, order_id);
                assert_eq!(n.status, OrderStatus::Shipped);
            }
            other @ Notification::Global { .. } => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            rx.recv().await.unwrap(),
            Notification::Global {
                message: "Book 9 is back in stock".to_string()
            }
        );
    }

    #[test]
    fn sending_without_subscribers_is_silent() {
        let notifier = BroadcastNotifier::new(4);
        notifier.notify_global("nobody is listening");
    }

    #[test]
    fn json_form_is_tagged() {
        let json = Notification::Global {
            message: "hello".to_string(),
        }
        .to_json()
        .unwrap();
        assert_eq!(json, r#"{"type":"global","message":"hello"}"#);
    }
}
