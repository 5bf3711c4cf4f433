//! Status/notification gateway.
//!
//! Stages push order status changes and global announcements through a [`Notifier`].
//! Delivery is best-effort and fire-and-forget: a notifier never fails the caller and
//! gives no ordering guarantee.

use crate::types::{OrderId, OrderStatus, UserId};
use serde::{Deserialize, Serialize};

/// A status change addressed to one user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderNotification {
    /// Recipient
    pub user_id: UserId,
    /// Order that changed
    pub order_id: OrderId,
    /// New status
    pub status: OrderStatus,
    /// Why the change happened, when it was not the user's doing
    pub reason: Option<String>,
}

impl OrderNotification {
    /// A plain status change.
    #[must_use]
    pub const fn new(user_id: UserId, order_id: OrderId, status: OrderStatus) -> Self {
        Self {
            user_id,
            order_id,
            status,
            reason: None,
        }
    }

    /// Attach a reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Sink for user-facing notifications.
pub trait Notifier: Send + Sync {
    /// Push a status change to the owning user.
    fn notify_user(&self, notification: OrderNotification);

    /// Broadcast a message to every connected user.
    fn notify_global(&self, message: &str);
}
