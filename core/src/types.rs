//! Core domain types for order fulfillment.
//!
//! Orders progress through states:
//! `Pending → Processing → Shipped → Delivered`, with `Pending | Processing → Cancelled`
//! as the only other edge. `Delivered` and `Cancelled` are terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for an order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderId(Uuid);

impl OrderId {
    /// Creates an `OrderId` from an existing UUID
    #[must_use]
    pub const fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Generates a fresh random `OrderId`
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a user (owned by the excluded auth layer)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(i64);

impl UserId {
    /// Creates a new `UserId`
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the inner value
    #[must_use]
    pub const fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a book in the catalog
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BookId(i64);

impl BookId {
    /// Creates a new `BookId`
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the inner value
    #[must_use]
    pub const fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for BookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single line item in an order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    /// Book being ordered
    pub book_id: BookId,
    /// Number of copies
    pub quantity: u32,
}

impl LineItem {
    /// Creates a new line item
    #[must_use]
    pub const fn new(book_id: BookId, quantity: u32) -> Self {
        Self { book_id, quantity }
    }
}

/// Status of an order in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Recorded, waiting for the order processor
    Pending,
    /// Stock validated and reserved, shipping scheduled
    Processing,
    /// Handed to the carrier
    Shipped,
    /// Received by the customer (terminal)
    Delivered,
    /// Cancelled by the user, an admin, or a stock shortfall (terminal)
    Cancelled,
}

impl OrderStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::Processing,
        Self::Shipped,
        Self::Delivered,
        Self::Cancelled,
    ];

    /// Whether the state machine allows moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing | Self::Cancelled)
                | (Self::Processing, Self::Shipped | Self::Cancelled)
                | (Self::Shipped, Self::Delivered)
        )
    }

    /// No transition leaves a terminal status.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Cancelled)
    }

    /// Cancellation is only legal before shipment.
    #[must_use]
    pub const fn is_cancellable(self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }

    /// Whether inventory has been reserved for an order in this status.
    #[must_use]
    pub const fn holds_reservation(self) -> bool {
        matches!(self, Self::Processing | Self::Shipped | Self::Delivered)
    }

    /// Storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Shipped => "shipped",
            Self::Delivered => "delivered",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A customer order.
///
/// `items` and `created_at` never change after creation; `status` changes only through
/// [`OrderStore::transition`](crate::store::OrderStore::transition). `reservations_sent`
/// is set once by [`OrderStore::mark_reservations_sent`](crate::store::OrderStore::mark_reservations_sent)
/// after every reservation of an accepted order was published or dead-lettered.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Order identifier
    pub id: OrderId,
    /// Owning user
    pub user_id: UserId,
    /// Ordered books
    pub items: Vec<LineItem>,
    /// Current lifecycle status
    pub status: OrderStatus,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// The order's reservations have been handed to the inventory queue
    #[serde(default)]
    pub reservations_sent: bool,
}

impl Order {
    /// Creates a new order in [`OrderStatus::Pending`].
    #[must_use]
    pub const fn new(
        id: OrderId,
        user_id: UserId,
        items: Vec<LineItem>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_id,
            items,
            status: OrderStatus::Pending,
            created_at,
            reservations_sent: false,
        }
    }

    /// Whether `requester` may read or cancel this order.
    #[must_use]
    pub fn is_visible_to(&self, requester: &Requester) -> bool {
        requester.is_admin || requester.user_id == self.user_id
    }
}

/// The authenticated caller of an order operation, as resolved by the auth layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Requester {
    /// Calling user
    pub user_id: UserId,
    /// Admins can act on any order
    pub is_admin: bool,
}

impl Requester {
    /// A regular user
    #[must_use]
    pub const fn user(user_id: UserId) -> Self {
        Self {
            user_id,
            is_admin: false,
        }
    }

    /// An administrator
    #[must_use]
    pub const fn admin(user_id: UserId) -> Self {
        Self {
            user_id,
            is_admin: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn any_status() -> impl Strategy<Value = OrderStatus> {
        prop::sample::select(OrderStatus::ALL.to_vec())
    }

    #[test]
    fn happy_path_is_linear() {
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Processing));
        assert!(OrderStatus::Processing.can_transition_to(OrderStatus::Shipped));
        assert!(OrderStatus::Shipped.can_transition_to(OrderStatus::Delivered));
        assert!(!OrderStatus::Processing.can_transition_to(OrderStatus::Delivered));
        assert!(!OrderStatus::Pending.can_transition_to(OrderStatus::Shipped));
    }

    #[test]
    fn shipped_orders_cannot_be_cancelled() {
        assert!(!OrderStatus::Shipped.can_transition_to(OrderStatus::Cancelled));
        assert!(!OrderStatus::Delivered.can_transition_to(OrderStatus::Cancelled));
        assert!(!OrderStatus::Shipped.is_cancellable());
    }

    #[test]
    fn status_storage_names_parse_back() {
        for status in OrderStatus::ALL {
            assert_eq!(OrderStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OrderStatus::parse("lost"), None);
    }

    #[test]
    fn admins_see_every_order() {
        let order = Order::new(
            OrderId::generate(),
            UserId::new(1),
            vec![LineItem::new(BookId::new(7), 1)],
            Utc::now(),
        );
        assert!(order.is_visible_to(&Requester::user(UserId::new(1))));
        assert!(order.is_visible_to(&Requester::admin(UserId::new(99))));
        assert!(!order.is_visible_to(&Requester::user(UserId::new(2))));
    }

    proptest! {
        #[test]
        fn terminal_statuses_have_no_exits(from in any_status(), to in any_status()) {
            if from.is_terminal() {
                prop_assert!(!from.can_transition_to(to));
            }
        }

        #[test]
        fn delivered_is_only_reached_from_shipped(from in any_status()) {
            if from.can_transition_to(OrderStatus::Delivered) {
                prop_assert_eq!(from, OrderStatus::Shipped);
            }
        }

        #[test]
        fn no_self_transitions(status in any_status()) {
            prop_assert!(!status.can_transition_to(status));
        }
    }
}
