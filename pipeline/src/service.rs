//! Order API consumed by the HTTP layer.
//!
//! [`OrderService`] answers synchronously and never waits on inventory or shipping:
//! `create_order` records the order and enqueues it, everything after that happens in
//! the background stages and reaches the user as notifications and status changes.

use crate::publisher::{dead_letter_unpublished, envelope_for, publish_with_retry, InventoryPublisher};
use fulfillment_core::dead_letter::DeadLetterSink;
use fulfillment_core::environment::Clock;
use fulfillment_core::error::FulfillmentError;
use fulfillment_core::message::{Envelope, OrderMessage};
use fulfillment_core::notify::{Notifier, OrderNotification};
use fulfillment_core::queue::{MessageQueue, QueueError};
use fulfillment_core::store::{OrderStore, StoreError};
use fulfillment_core::types::{LineItem, Order, OrderId, OrderStatus, Requester, UserId};
use fulfillment_runtime::metrics::OrderMetrics;
use fulfillment_runtime::retry::RetryPolicy;
use std::sync::Arc;

/// Entry point for creating, reading and cancelling orders.
#[derive(Clone)]
pub struct OrderService {
    store: Arc<dyn OrderStore>,
    transport: Arc<dyn MessageQueue>,
    orders_queue: String,
    inventory: InventoryPublisher,
    dead_letters: Arc<dyn DeadLetterSink>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl OrderService {
    /// Create the service.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn OrderStore>,
        transport: Arc<dyn MessageQueue>,
        orders_queue: impl Into<String>,
        inventory: InventoryPublisher,
        dead_letters: Arc<dyn DeadLetterSink>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            transport,
            orders_queue: orders_queue.into(),
            inventory,
            dead_letters,
            notifier,
            clock,
            retry,
        }
    }

    /// Record a new PENDING order and hand it to the order processor.
    ///
    /// Line items for the same book are merged. If the order message cannot be published
    /// after the retry budget, it is dead-lettered and the order is still returned: the
    /// order store, not the queue, is the system of record.
    ///
    /// # Errors
    ///
    /// - [`FulfillmentError::Validation`] for an empty order or a zero quantity
    /// - [`FulfillmentError::Store`] if the order cannot be persisted
    /// - [`FulfillmentError::Queue`] if the order message could neither be published nor
    ///   dead-lettered
    pub async fn create_order(&self, user_id: UserId, items: Vec<LineItem>) -> Result<Order, FulfillmentError> {
        let items = validate_items(items)?;
        let order = Order::new(OrderId::generate(), user_id, items, self.clock.now());

        self.store.insert(order.clone()).await?;
        OrderMetrics::record_created();
        tracing::info!(order_id = %order.id, user_id = %user_id, items = order.items.len(), "Order created");
        self.notifier
            .notify_user(OrderNotification::new(user_id, order.id, OrderStatus::Pending));

        let message = OrderMessage::new(order.id, user_id, order.items.clone());
        let envelope = envelope_for(&message, &self.orders_queue, self.clock.as_ref())?;
        if let Err(error) =
            publish_with_retry(self.transport.as_ref(), &self.orders_queue, &envelope, &self.retry).await
        {
            self.park(&self.orders_queue, envelope, &error).await?;
        }

        Ok(order)
    }

    /// Read an order.
    ///
    /// # Errors
    ///
    /// - [`FulfillmentError::NotFound`] if there is no such order
    /// - [`FulfillmentError::Authorization`] if the requester is neither owner nor admin
    pub async fn get_order(&self, order_id: OrderId, requester: &Requester) -> Result<Order, FulfillmentError> {
        let order = self.store.get(order_id).await?;
        authorize(&order, requester)?;
        Ok(order)
    }

    /// Cancel an order that has not shipped yet.
    ///
    /// The status change is a compare-and-set from the status just read. If the order
    /// processor accepted the order in between, the cancel is retried from PROCESSING; if
    /// shipping got there first, the cancel fails and the shipment proceeds. Cancelling a
    /// PROCESSING order publishes one restock per line item.
    ///
    /// # Errors
    ///
    /// - [`FulfillmentError::NotFound`] if there is no such order
    /// - [`FulfillmentError::Authorization`] if the requester is neither owner nor admin
    /// - [`FulfillmentError::InvalidState`] if the order is shipped, delivered or
    ///   already cancelled
    pub async fn cancel_order(&self, order_id: OrderId, requester: &Requester) -> Result<Order, FulfillmentError> {
        let order = self.store.get(order_id).await?;
        authorize(&order, requester)?;

        let mut observed = order.status;
        let cancelled = loop {
            if !observed.is_cancellable() {
                return Err(FulfillmentError::InvalidState {
                    order_id,
                    status: observed,
                });
            }
            match self
                .store
                .transition(order_id, &[observed], OrderStatus::Cancelled)
                .await
            {
                Ok(cancelled) => break cancelled,
                Err(StoreError::StatusConflict { actual, .. }) => {
                    tracing::debug!(order_id = %order_id, expected = %observed, actual = %actual, "Status moved during cancel");
                    observed = actual;
                }
                Err(e) => return Err(e.into()),
            }
        };

        OrderMetrics::record_transition(OrderStatus::Cancelled.as_str());
        OrderMetrics::record_cancelled("user");
        tracing::info!(order_id = %order_id, previous = %observed, by = %requester.user_id, "Order cancelled");
        self.notifier.notify_user(OrderNotification::new(
            cancelled.user_id,
            order_id,
            OrderStatus::Cancelled,
        ));

        if observed.holds_reservation() {
            let failed = self.inventory.restock(&cancelled).await;
            let lost = self.inventory.park(failed).await;
            if lost > 0 {
                tracing::error!(order_id = %order_id, lost, "Restock lost");
            }
        }

        Ok(cancelled)
    }

    /// Dead-letter a message whose publish retries ran out.
    async fn park(&self, queue: &str, envelope: Envelope, error: &QueueError) -> Result<(), QueueError> {
        dead_letter_unpublished(self.dead_letters.as_ref(), queue, envelope, error, self.clock.as_ref()).await
    }
}

fn authorize(order: &Order, requester: &Requester) -> Result<(), FulfillmentError> {
    if order.is_visible_to(requester) {
        Ok(())
    } else {
        Err(FulfillmentError::Authorization(format!(
            "user {} is not the owner of order {} or an admin",
            requester.user_id, order.id
        )))
    }
}

/// Reject empty orders and zero quantities, and merge lines for the same book.
fn validate_items(items: Vec<LineItem>) -> Result<Vec<LineItem>, FulfillmentError> {
    if items.is_empty() {
        return Err(FulfillmentError::Validation(
            "order must contain at least one item".to_string(),
        ));
    }

    let mut merged: Vec<LineItem> = Vec::with_capacity(items.len());
    for item in items {
        if item.quantity == 0 {
            return Err(FulfillmentError::Validation(format!(
                "quantity for book {} must be positive",
                item.book_id
            )));
        }
        match merged.iter_mut().find(|line| line.book_id == item.book_id) {
            Some(line) => {
                line.quantity = line.quantity.checked_add(item.quantity).ok_or_else(|| {
                    FulfillmentError::Validation(format!("quantity for book {} is too large", item.book_id))
                })?;
            }
            None => merged.push(item),
        }
    }
    Ok(merged)
}
