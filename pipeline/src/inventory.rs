//! Inventory manager.
//!
//! Consumes `inventory_updates` and applies each signed delta to the catalog:
//!
//! 1. The catalog applies the delta atomically per book; its ledger turns a redelivered
//!    update into a no-op.
//! 2. A reservation larger than the current stock is rejected, never clamped. The order
//!    processor validated stock before publishing, so this only happens when two orders
//!    raced for the same copies. The order is reported to a [`ShortfallListener`] and
//!    the message is dead-lettered for reconciliation. The ledger keeps the rejection, so
//!    a redelivered copy stays rejected even after the book is restocked.
//! 3. A restock that lifts a book from zero stock announces it as back in stock.
//!
//! The handler returns only after the catalog committed, so the delivery is acked after
//! the stock change is durable.

use async_trait::async_trait;
use fulfillment_core::catalog::{AdjustmentOutcome, Catalog, CatalogError, StockAdjustment};
use fulfillment_core::message::{Envelope, InventoryUpdateMessage};
use fulfillment_core::notify::Notifier;
use fulfillment_core::types::{BookId, OrderId};
use fulfillment_runtime::consumer::{HandlerError, MessageHandler};
use fulfillment_runtime::metrics::InventoryMetrics;
use std::sync::Arc;

/// Told when a reservation could not be applied.
#[async_trait]
pub trait ShortfallListener: Send + Sync {
    /// The reservation of `book_id` for `order_id` was rejected.
    ///
    /// `attempt` is the delivery attempt of the rejected update.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Retry`] if the order could not be dealt with yet; the
    /// update is then redelivered and reported again.
    async fn on_shortfall(&self, order_id: OrderId, book_id: BookId, attempt: u32) -> Result<(), HandlerError>;
}

/// Handler for the inventory-update queue.
pub struct InventoryManager {
    catalog: Arc<dyn Catalog>,
    notifier: Arc<dyn Notifier>,
    shortfalls: Arc<dyn ShortfallListener>,
}

impl InventoryManager {
    /// Create a manager.
    #[must_use]
    pub fn new(
        catalog: Arc<dyn Catalog>,
        notifier: Arc<dyn Notifier>,
        shortfalls: Arc<dyn ShortfallListener>,
    ) -> Self {
        Self {
            catalog,
            notifier,
            shortfalls,
        }
    }

    async fn reject_reservation(&self, message: &InventoryUpdateMessage, error: &CatalogError) -> HandlerError {
        InventoryMetrics::record_shortfall();
        tracing::warn!(
            order_id = %message.order_id,
            book_id = %message.book_id,
            delta = message.quantity_delta,
            error = %error,
            "Reservation rejected after validation, concurrent orders raced for stock"
        );

        match self
            .shortfalls
            .on_shortfall(message.order_id, message.book_id, message.attempt)
            .await
        {
            Ok(()) => HandlerError::Reconcile(error.to_string()),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl MessageHandler for InventoryManager {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        let message: InventoryUpdateMessage = envelope.open()?;
        if message.quantity_delta == 0 {
            return Err(HandlerError::Poison(format!(
                "zero quantity delta for order {} book {}",
                message.order_id, message.book_id
            )));
        }

        let kind = message.kind();
        let adjustment = StockAdjustment {
            order_id: message.order_id,
            book_id: message.book_id,
            delta: message.quantity_delta,
        };

        match self.catalog.apply_adjustment(adjustment).await {
            Ok(AdjustmentOutcome::Applied { previous, stock }) => {
                InventoryMetrics::record_adjustment(kind_label(&message), "applied");
                tracing::info!(
                    order_id = %message.order_id,
                    book_id = %message.book_id,
                    kind = %kind,
                    previous,
                    stock,
                    "Stock adjusted"
                );
                if previous == 0 && stock > 0 {
                    self.notifier
                        .notify_global(&format!("Book {} is back in stock", message.book_id));
                }
                Ok(())
            }
            Ok(AdjustmentOutcome::Duplicate { stock }) => {
                InventoryMetrics::record_adjustment(kind_label(&message), "duplicate");
                tracing::debug!(
                    order_id = %message.order_id,
                    book_id = %message.book_id,
                    kind = %kind,
                    stock,
                    "Adjustment already applied, skipping"
                );
                Ok(())
            }
            Ok(AdjustmentOutcome::Voided { stock }) => {
                InventoryMetrics::record_adjustment(kind_label(&message), "voided");
                tracing::info!(
                    order_id = %message.order_id,
                    book_id = %message.book_id,
                    kind = %kind,
                    stock,
                    "Adjustment voided, nothing was reserved"
                );
                Ok(())
            }
            Err(error @ CatalogError::InsufficientStock { .. }) => {
                InventoryMetrics::record_adjustment(kind_label(&message), "rejected");
                Err(self.reject_reservation(&message, &error).await)
            }
            Err(error @ CatalogError::BookNotFound(_)) if message.quantity_delta < 0 => {
                InventoryMetrics::record_adjustment(kind_label(&message), "rejected");
                Err(self.reject_reservation(&message, &error).await)
            }
            Err(error @ CatalogError::BookNotFound(_)) => {
                InventoryMetrics::record_adjustment(kind_label(&message), "rejected");
                Err(HandlerError::Reconcile(error.to_string()))
            }
            Err(error @ CatalogError::DatabaseError(_)) => Err(HandlerError::retry(error)),
        }
    }
}

const fn kind_label(message: &InventoryUpdateMessage) -> &'static str {
    if message.quantity_delta < 0 {
        "reservation"
    } else {
        "restock"
    }
}
