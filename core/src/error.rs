//! Errors surfaced to callers of the order API.

use crate::catalog::CatalogError;
use crate::queue::QueueError;
use crate::store::StoreError;
use crate::types::{BookId, OrderId, OrderStatus};
use thiserror::Error;

/// Errors from order operations.
///
/// `Validation`, `Authorization` and `InvalidState` are rejected synchronously and never
/// retried. `InsufficientStock` is detected after the create call returned and is
/// resolved by cancelling the order; it only reaches callers through the status field
/// and notifications.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FulfillmentError {
    /// Bad input
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Requester is neither the owner nor an admin
    #[error("Not authorized: {0}")]
    Authorization(String),

    /// Operation not legal in the order's current status
    #[error("Order {order_id} cannot be changed in status {status}")]
    InvalidState {
        /// Order the operation targeted
        order_id: OrderId,
        /// Status at the time of the check
        status: OrderStatus,
    },

    /// No such order
    #[error("Order not found: {0}")]
    NotFound(OrderId),

    /// Requested quantity exceeds available stock
    #[error("Insufficient stock for book {book_id}: requested {requested}, available {available}")]
    InsufficientStock {
        /// Book that is short
        book_id: BookId,
        /// Quantity requested
        requested: u32,
        /// Stock at the time of the check
        available: u32,
    },

    /// Order store failure
    #[error(transparent)]
    Store(StoreError),

    /// Catalog failure
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Queue transport failure
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl From<StoreError> for FulfillmentError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(order_id) => Self::NotFound(order_id),
            StoreError::StatusConflict {
                order_id, actual, ..
            } => Self::InvalidState {
                order_id,
                status: actual,
            },
            other => Self::Store(other),
        }
    }
}

impl FulfillmentError {
    /// Whether retrying the same operation could succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Store(StoreError::DatabaseError(_))
                | Self::Catalog(CatalogError::DatabaseError(_))
                | Self::Queue(_)
        )
    }
}
