//! Order persistence with compare-and-set status transitions.
//!
//! The order store is the single source of truth for order status. Status only ever
//! changes through [`OrderStore::transition`], which checks the current status and writes
//! the new one as one atomic step. Two stages racing on the same order (a user cancelling
//! while the shipping timer fires) therefore serialize on that row: exactly one of them
//! observes the status it expected.

use crate::types::{Order, OrderId, OrderStatus};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors from order store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No order with this id
    #[error("Order not found: {0}")]
    NotFound(OrderId),

    /// An order with this id already exists
    #[error("Order already exists: {0}")]
    AlreadyExists(OrderId),

    /// The order was not in any of the expected statuses at commit time
    #[error("Order {order_id} is {actual}, expected one of {expected:?}")]
    StatusConflict {
        /// Order being transitioned
        order_id: OrderId,
        /// Statuses the caller required
        expected: Vec<OrderStatus>,
        /// Status found at commit time
        actual: OrderStatus,
    },

    /// The state machine has no edge from `from` to `to`
    #[error("Illegal transition {from} -> {to}")]
    IllegalTransition {
        /// Source status
        from: OrderStatus,
        /// Requested status
        to: OrderStatus,
    },

    /// Backend failure
    #[error("Database error: {0}")]
    DatabaseError(String),
}

/// Durable order records.
pub trait OrderStore: Send + Sync {
    /// Persist a new order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyExists`] if the id is taken.
    fn insert(&self, order: Order) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>;

    /// Load an order by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the order does not exist.
    fn get(&self, order_id: OrderId) -> Pin<Box<dyn Future<Output = Result<Order, StoreError>> + Send + '_>>;

    /// Atomically move an order to `next` if its status is one of `expected`.
    ///
    /// Returns the updated order.
    ///
    /// # Errors
    ///
    /// - [`StoreError::IllegalTransition`] if an `expected` status has no edge to `next`
    /// - [`StoreError::StatusConflict`] if the status at commit time is not in `expected`
    /// - [`StoreError::NotFound`] if the order does not exist
    fn transition(
        &self,
        order_id: OrderId,
        expected: &[OrderStatus],
        next: OrderStatus,
    ) -> Pin<Box<dyn Future<Output = Result<Order, StoreError>> + Send + '_>>;

    /// Record that the order's reservations were published. Idempotent.
    ///
    /// Redelivered order messages and restarts check the flag so reservations go out
    /// once per order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the order does not exist.
    fn mark_reservations_sent(
        &self,
        order_id: OrderId,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>;

    /// Orders currently in any of `statuses`, oldest first.
    ///
    /// Used at startup to resume shipments that were in flight when the process stopped.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DatabaseError`] on backend failure.
    fn list_by_status(
        &self,
        statuses: &[OrderStatus],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Order>, StoreError>> + Send + '_>>;
}

/// Reject a transition request the state machine cannot satisfy.
///
/// Implementations call this before touching storage.
///
/// # Errors
///
/// Returns [`StoreError::IllegalTransition`] for the first expected status without an
/// edge to `next`.
pub fn check_transition(expected: &[OrderStatus], next: OrderStatus) -> Result<(), StoreError> {
    match expected.iter().find(|from| !from.can_transition_to(next)) {
        Some(from) => Err(StoreError::IllegalTransition { from: *from, to: next }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_legal_from_pending_and_processing() {
        assert!(
            check_transition(
                &[OrderStatus::Pending, OrderStatus::Processing],
                OrderStatus::Cancelled
            )
            .is_ok()
        );
    }

    #[test]
    fn cancel_from_shipped_is_illegal() {
        let result = check_transition(&[OrderStatus::Shipped], OrderStatus::Cancelled);
        assert_eq!(
            result,
            Err(StoreError::IllegalTransition {
                from: OrderStatus::Shipped,
                to: OrderStatus::Cancelled,
            })
        );
    }
}
