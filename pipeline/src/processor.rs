//! Order processor.
//!
//! Consumes the `orders` queue. For each [`OrderMessage`]:
//!
//! ```text
//! load order
//!   not PENDING            ─► duplicate delivery, ack
//!   any item short         ─► PENDING → CANCELLED, notify with reason, no inventory messages
//!   all items available    ─► PENDING → PROCESSING, one reservation per item, start shipping
//! ```
//!
//! Status changes go through the store's compare-and-set, so a cancellation that lands
//! between the stock check and the transition wins and the message becomes a no-op.
//!
//! An order in PROCESSING whose reservations are not yet recorded as sent resumes the
//! steps after the transition: the reservations are published again (the catalog ledger
//! ignores the ones already applied), the order is marked, and shipping is initiated.
//! Once marked, further deliveries only make sure shipping is running.
//!
//! Restocks that cannot be published are dead-lettered. The message is only redelivered
//! if the dead letter sink failed too.

use crate::inventory::ShortfallListener;
use crate::publisher::{FailedPublish, InventoryPublisher};
use crate::shipping::ShippingSimulator;
use async_trait::async_trait;
use fulfillment_core::catalog::{Catalog, CatalogError};
use fulfillment_core::error::FulfillmentError;
use fulfillment_core::message::{Envelope, OrderMessage};
use fulfillment_core::notify::{Notifier, OrderNotification};
use fulfillment_core::store::{OrderStore, StoreError};
use fulfillment_core::types::{BookId, Order, OrderId, OrderStatus};
use fulfillment_runtime::consumer::{HandlerError, MessageHandler};
use fulfillment_runtime::metrics::OrderMetrics;
use std::sync::Arc;

/// Handler for the order queue.
pub struct OrderProcessor {
    store: Arc<dyn OrderStore>,
    catalog: Arc<dyn Catalog>,
    notifier: Arc<dyn Notifier>,
    inventory: InventoryPublisher,
    shipping: Arc<ShippingSimulator>,
}

impl OrderProcessor {
    /// Create a processor.
    #[must_use]
    pub fn new(
        store: Arc<dyn OrderStore>,
        catalog: Arc<dyn Catalog>,
        notifier: Arc<dyn Notifier>,
        inventory: InventoryPublisher,
        shipping: Arc<ShippingSimulator>,
    ) -> Self {
        Self {
            store,
            catalog,
            notifier,
            inventory,
            shipping,
        }
    }

    /// Pick up orders that were mid-shipment when the process last stopped.
    ///
    /// PROCESSING orders not yet marked as reserved get their reservations published
    /// before shipping resumes, since the process may have stopped between the
    /// transition and the publish. Reservations that still cannot be published are
    /// dead-lettered and the order stays unmarked. Returns how many orders were resumed.
    ///
    /// # Errors
    ///
    /// Returns the store error if the orders cannot be listed.
    pub async fn resume_in_flight(&self) -> Result<usize, StoreError> {
        let orders = self
            .store
            .list_by_status(&[OrderStatus::Processing, OrderStatus::Shipped])
            .await?;

        for order in &orders {
            if order.status == OrderStatus::Processing && !order.reservations_sent {
                let failed = self.inventory.reserve(order).await;
                if failed.is_empty() {
                    self.store.mark_reservations_sent(order.id).await?;
                } else {
                    log_failed_publishes(order.id, &failed);
                    self.inventory.park(failed).await;
                }
            }
            self.shipping.initiate_shipping(order);
        }

        if !orders.is_empty() {
            tracing::info!(count = orders.len(), "Resumed in-flight orders");
        }
        Ok(orders.len())
    }

    /// First book whose stock cannot cover its line item, if any.
    async fn find_shortfall(&self, order: &Order) -> Result<Option<FulfillmentError>, HandlerError> {
        for item in &order.items {
            let available = match self.catalog.stock(item.book_id).await {
                Ok(stock) => stock,
                Err(CatalogError::BookNotFound(_)) => 0,
                Err(e) => return Err(HandlerError::retry(e)),
            };
            if available < item.quantity {
                return Ok(Some(FulfillmentError::InsufficientStock {
                    book_id: item.book_id,
                    requested: item.quantity,
                    available,
                }));
            }
        }
        Ok(None)
    }

    async fn process(&self, order: Order) -> Result<(), HandlerError> {
        if let Some(shortfall) = self.find_shortfall(&order).await? {
            return self.reject(&order, &shortfall).await;
        }

        let order = match self
            .store
            .transition(order.id, &[OrderStatus::Pending], OrderStatus::Processing)
            .await
        {
            Ok(order) => order,
            Err(StoreError::StatusConflict { actual, .. }) => {
                tracing::info!(order_id = %order.id, status = %actual, "Order changed during processing, skipping");
                return Ok(());
            }
            Err(e) => return Err(HandlerError::retry(e)),
        };

        OrderMetrics::record_transition(OrderStatus::Processing.as_str());
        tracing::info!(order_id = %order.id, items = order.items.len(), "Order accepted");
        self.notifier.notify_user(OrderNotification::new(
            order.user_id,
            order.id,
            OrderStatus::Processing,
        ));

        self.reserve_and_ship(&order).await
    }

    async fn reserve_and_ship(&self, order: &Order) -> Result<(), HandlerError> {
        let failed = self.inventory.reserve(order).await;
        if let Some(first) = failed.first() {
            log_failed_publishes(order.id, &failed);
            return Err(HandlerError::retry(&first.error));
        }
        self.store
            .mark_reservations_sent(order.id)
            .await
            .map_err(HandlerError::retry)?;
        self.shipping.initiate_shipping(order);
        Ok(())
    }

    /// Cancel an order whose stock check failed. No inventory message is sent.
    async fn reject(&self, order: &Order, shortfall: &FulfillmentError) -> Result<(), HandlerError> {
        match self
            .store
            .transition(order.id, &[OrderStatus::Pending], OrderStatus::Cancelled)
            .await
        {
            Ok(order) => {
                OrderMetrics::record_transition(OrderStatus::Cancelled.as_str());
                OrderMetrics::record_cancelled("stock");
                tracing::info!(order_id = %order.id, reason = %shortfall, "Order cancelled for insufficient stock");
                self.notifier.notify_user(
                    OrderNotification::new(order.user_id, order.id, OrderStatus::Cancelled)
                        .with_reason(shortfall.to_string()),
                );
                Ok(())
            }
            Err(StoreError::StatusConflict { actual, .. }) => {
                tracing::info!(order_id = %order.id, status = %actual, "Order changed during processing, skipping");
                Ok(())
            }
            Err(e) => Err(HandlerError::retry(e)),
        }
    }

    async fn restock(&self, order: &Order) -> Result<(), HandlerError> {
        let failed = self.inventory.restock(order).await;
        if failed.is_empty() {
            return Ok(());
        }
        log_failed_publishes(order.id, &failed);
        match self.inventory.park(failed).await {
            0 => Ok(()),
            lost => Err(HandlerError::retry(format!("{lost} restocks for order {} lost", order.id))),
        }
    }
}

#[async_trait]
impl MessageHandler for OrderProcessor {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        let message: OrderMessage = envelope.open()?;

        let order = match self.store.get(message.order_id).await {
            Ok(order) => order,
            Err(e @ StoreError::NotFound(_)) => {
                tracing::warn!(order_id = %message.order_id, attempt = message.attempt, "Order not visible yet");
                return Err(HandlerError::retry(e));
            }
            Err(e) => return Err(HandlerError::retry(e)),
        };

        match order.status {
            OrderStatus::Pending => self.process(order).await,
            OrderStatus::Processing if !order.reservations_sent => {
                tracing::info!(order_id = %order.id, attempt = message.attempt, "Resuming accepted order");
                self.reserve_and_ship(&order).await
            }
            OrderStatus::Processing => {
                tracing::debug!(order_id = %order.id, attempt = message.attempt, "Reservations already sent");
                self.shipping.initiate_shipping(&order);
                Ok(())
            }
            status => {
                tracing::debug!(order_id = %order.id, status = %status, "Duplicate order message, skipping");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl ShortfallListener for OrderProcessor {
    async fn on_shortfall(&self, order_id: OrderId, book_id: BookId, attempt: u32) -> Result<(), HandlerError> {
        match self
            .store
            .transition(order_id, &[OrderStatus::Processing], OrderStatus::Cancelled)
            .await
        {
            Ok(order) => {
                OrderMetrics::record_transition(OrderStatus::Cancelled.as_str());
                OrderMetrics::record_cancelled("stock");
                tracing::warn!(order_id = %order_id, book_id = %book_id, "Accepted order cancelled, stock was taken by a concurrent order");
                self.notifier.notify_user(
                    OrderNotification::new(order.user_id, order_id, OrderStatus::Cancelled)
                        .with_reason(format!("Book {book_id} sold out before the order could be reserved")),
                );
                self.restock(&order).await
            }
            Err(StoreError::StatusConflict {
                actual: OrderStatus::Cancelled,
                ..
            }) if attempt > 0 => {
                // A previous attempt cancelled the order but may not have finished restocking.
                let order = self.store.get(order_id).await.map_err(HandlerError::retry)?;
                self.restock(&order).await
            }
            Err(StoreError::StatusConflict { actual, .. }) => {
                tracing::warn!(order_id = %order_id, book_id = %book_id, status = %actual, "Shortfall for order that is no longer processing");
                Ok(())
            }
            Err(e @ StoreError::DatabaseError(_)) => Err(HandlerError::retry(e)),
            Err(e) => {
                tracing::warn!(order_id = %order_id, book_id = %book_id, error = %e, "Shortfall for unknown order");
                Ok(())
            }
        }
    }
}

fn log_failed_publishes(order_id: OrderId, failed: &[FailedPublish]) {
    for publish in failed {
        tracing::error!(
            order_id = %order_id,
            correlation_id = %publish.envelope.correlation_id,
            error = %publish.error,
            "Inventory update not published"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::shipping::ShippingDelays;
    use chrono::Utc;
    use fulfillment_core::message::{INVENTORY_UPDATES_QUEUE, InventoryUpdateMessage};
    use fulfillment_core::types::{LineItem, UserId};
    use fulfillment_runtime::retry::RetryPolicy;
    use fulfillment_core::dead_letter::DeadLetterReason;
    use fulfillment_testing::{
        InMemoryCatalog, InMemoryDeadLetters, InMemoryOrderStore, InMemoryQueue, RecordingNotifier, test_clock,
    };
    use std::time::Duration;
    use tokio::sync::broadcast;

    struct Harness {
        store: Arc<InMemoryOrderStore>,
        queue: Arc<InMemoryQueue>,
        dead_letters: Arc<InMemoryDeadLetters>,
        notifier: Arc<RecordingNotifier>,
        shipping: Arc<ShippingSimulator>,
        processor: OrderProcessor,
        _shutdown: broadcast::Sender<()>,
    }

    fn harness(catalog: InMemoryCatalog) -> Harness {
        let store = Arc::new(InMemoryOrderStore::new());
        let queue = Arc::new(InMemoryQueue::new());
        let dead_letters = Arc::new(InMemoryDeadLetters::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let (shutdown, rx) = broadcast::channel(1);
        let hour = Duration::from_secs(3600);
        let shipping = Arc::new(ShippingSimulator::new(
            store.clone(),
            notifier.clone(),
            ShippingDelays {
                ship_after: hour,
                deliver_after: hour,
            },
            RetryPolicy::immediate(0),
            rx,
        ));
        let inventory = InventoryPublisher::new(
            queue.clone(),
            INVENTORY_UPDATES_QUEUE,
            dead_letters.clone(),
            Arc::new(test_clock()),
            RetryPolicy::immediate(1),
        );
        let processor = OrderProcessor::new(
            store.clone(),
            Arc::new(catalog),
            notifier.clone(),
            inventory,
            shipping.clone(),
        );
        Harness {
            store,
            queue,
            dead_letters,
            notifier,
            shipping,
            processor,
            _shutdown: shutdown,
        }
    }

    async fn pending_order(store: &InMemoryOrderStore, items: Vec<LineItem>) -> (Order, Envelope) {
        let order = Order::new(OrderId::generate(), UserId::new(9), items, Utc::now());
        store.insert(order.clone()).await.unwrap();
        let message = OrderMessage::new(order.id, order.user_id, order.items.clone());
        (order, Envelope::wrap(&message, Utc::now()).unwrap())
    }

    fn deltas(queue: &InMemoryQueue) -> Vec<i64> {
        queue
            .published(INVENTORY_UPDATES_QUEUE)
            .iter()
            .map(|e| e.open::<InventoryUpdateMessage>().unwrap().quantity_delta)
            .collect()
    }

    #[tokio::test]
    async fn available_stock_moves_order_to_processing() {
        let h = harness(InMemoryCatalog::new().with_book(BookId::new(1), 5));
        let (order, envelope) = pending_order(&h.store, vec![LineItem::new(BookId::new(1), 3)]).await;

        h.processor.handle(&envelope).await.unwrap();

        assert_eq!(h.store.status(order.id), Some(OrderStatus::Processing));
        assert_eq!(deltas(&h.queue), vec![-3]);
        assert_eq!(h.notifier.statuses_for(order.id), vec![OrderStatus::Processing]);
        assert_eq!(h.shipping.in_flight(), 1);
    }

    #[tokio::test]
    async fn short_stock_cancels_without_inventory_messages() {
        let h = harness(InMemoryCatalog::new().with_book(BookId::new(2), 1));
        let (order, envelope) = pending_order(&h.store, vec![LineItem::new(BookId::new(2), 2)]).await;

        h.processor.handle(&envelope).await.unwrap();

        assert_eq!(h.store.status(order.id), Some(OrderStatus::Cancelled));
        assert!(h.queue.published(INVENTORY_UPDATES_QUEUE).is_empty());
        let notification = &h.notifier.user_notifications()[0];
        assert_eq!(notification.status, OrderStatus::Cancelled);
        assert!(notification.reason.as_deref().unwrap().contains("Insufficient stock"));
    }

    #[tokio::test]
    async fn unknown_book_counts_as_out_of_stock() {
        let h = harness(InMemoryCatalog::new());
        let (order, envelope) = pending_order(&h.store, vec![LineItem::new(BookId::new(404), 1)]).await;

        h.processor.handle(&envelope).await.unwrap();

        assert_eq!(h.store.status(order.id), Some(OrderStatus::Cancelled));
    }

    #[tokio::test]
    async fn duplicate_delivery_is_a_no_op() {
        let h = harness(InMemoryCatalog::new().with_book(BookId::new(1), 5));
        let (order, envelope) = pending_order(&h.store, vec![LineItem::new(BookId::new(1), 1)]).await;

        h.processor.handle(&envelope).await.unwrap();
        h.processor.handle(&envelope).await.unwrap();

        assert_eq!(h.store.history(order.id).len(), 1);
        assert_eq!(deltas(&h.queue), vec![-1]);
    }

    #[tokio::test]
    async fn failed_reservation_publish_is_retried_and_resumed() {
        let h = harness(InMemoryCatalog::new().with_book(BookId::new(1), 5));
        let (order, envelope) = pending_order(&h.store, vec![LineItem::new(BookId::new(1), 2)]).await;
        h.queue.fail_next_publishes(INVENTORY_UPDATES_QUEUE, 2);

        let first = h.processor.handle(&envelope).await;
        assert!(matches!(first, Err(HandlerError::Retry(_))));
        assert_eq!(h.store.status(order.id), Some(OrderStatus::Processing));
        assert_eq!(h.shipping.in_flight(), 0);

        assert!(!h.store.order(order.id).unwrap().reservations_sent);

        h.processor.handle(&envelope.redelivery()).await.unwrap();
        assert_eq!(deltas(&h.queue), vec![-2]);
        assert!(h.store.order(order.id).unwrap().reservations_sent);
        assert_eq!(h.shipping.in_flight(), 1);
    }

    #[tokio::test]
    async fn redelivered_message_does_not_reserve_twice() {
        let h = harness(InMemoryCatalog::new().with_book(BookId::new(1), 5));
        let (order, envelope) = pending_order(&h.store, vec![LineItem::new(BookId::new(1), 1)]).await;

        h.processor.handle(&envelope).await.unwrap();
        h.processor.handle(&envelope.redelivery()).await.unwrap();
        h.processor.handle(&envelope.redelivery().redelivery()).await.unwrap();

        assert_eq!(h.store.status(order.id), Some(OrderStatus::Processing));
        assert_eq!(deltas(&h.queue), vec![-1]);
        assert_eq!(h.shipping.in_flight(), 1);
    }

    #[tokio::test]
    async fn cancelled_order_is_not_processed() {
        let h = harness(InMemoryCatalog::new().with_book(BookId::new(1), 5));
        let (order, envelope) = pending_order(&h.store, vec![LineItem::new(BookId::new(1), 1)]).await;
        h.store
            .transition(order.id, &[OrderStatus::Pending], OrderStatus::Cancelled)
            .await
            .unwrap();

        h.processor.handle(&envelope).await.unwrap();

        assert!(h.queue.published(INVENTORY_UPDATES_QUEUE).is_empty());
        assert!(h.notifier.user_notifications().is_empty());
    }

    #[tokio::test]
    async fn store_outage_asks_for_redelivery() {
        let h = harness(InMemoryCatalog::new().with_book(BookId::new(1), 5));
        let (_, envelope) = pending_order(&h.store, vec![LineItem::new(BookId::new(1), 1)]).await;
        h.store.fail_next_calls(1);

        let result = h.processor.handle(&envelope).await;
        assert!(matches!(result, Err(HandlerError::Retry(_))));
    }

    #[tokio::test]
    async fn shortfall_cancels_processing_order_and_restocks() {
        let h = harness(InMemoryCatalog::new().with_book(BookId::new(1), 5));
        let (order, envelope) = pending_order(&h.store, vec![LineItem::new(BookId::new(1), 2)]).await;
        h.processor.handle(&envelope).await.unwrap();

        h.processor.on_shortfall(order.id, BookId::new(1), 0).await.unwrap();

        assert_eq!(h.store.status(order.id), Some(OrderStatus::Cancelled));
        assert_eq!(deltas(&h.queue), vec![-2, 2]);
        assert_eq!(
            h.notifier.statuses_for(order.id),
            vec![OrderStatus::Processing, OrderStatus::Cancelled]
        );
    }

    #[tokio::test]
    async fn unpublishable_restocks_after_shortfall_are_dead_lettered() {
        let h = harness(InMemoryCatalog::new().with_book(BookId::new(1), 5));
        let (order, envelope) = pending_order(&h.store, vec![LineItem::new(BookId::new(1), 2)]).await;
        h.processor.handle(&envelope).await.unwrap();
        h.queue.fail_next_publishes(INVENTORY_UPDATES_QUEUE, 2);

        h.processor.on_shortfall(order.id, BookId::new(1), 0).await.unwrap();

        assert_eq!(h.store.status(order.id), Some(OrderStatus::Cancelled));
        let entries = h.dead_letters.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reason, DeadLetterReason::PublishFailed);
        let restock: InventoryUpdateMessage = entries[0].envelope.open().unwrap();
        assert_eq!(restock.quantity_delta, 2);
    }

    #[tokio::test]
    async fn lost_restocks_after_shortfall_are_retried() {
        let h = harness(InMemoryCatalog::new().with_book(BookId::new(1), 5));
        let (order, envelope) = pending_order(&h.store, vec![LineItem::new(BookId::new(1), 2)]).await;
        h.processor.handle(&envelope).await.unwrap();
        h.queue.fail_next_publishes(INVENTORY_UPDATES_QUEUE, 2);
        h.dead_letters.set_unavailable(true);

        let first = h.processor.on_shortfall(order.id, BookId::new(1), 0).await;
        assert!(matches!(first, Err(HandlerError::Retry(_))));

        h.dead_letters.set_unavailable(false);
        h.processor.on_shortfall(order.id, BookId::new(1), 1).await.unwrap();
        assert_eq!(deltas(&h.queue), vec![-2, 2]);
    }

    #[tokio::test]
    async fn shortfall_for_shipped_order_changes_nothing() {
        let h = harness(InMemoryCatalog::new().with_book(BookId::new(1), 5));
        let (order, envelope) = pending_order(&h.store, vec![LineItem::new(BookId::new(1), 2)]).await;
        h.processor.handle(&envelope).await.unwrap();
        h.store
            .transition(order.id, &[OrderStatus::Processing], OrderStatus::Shipped)
            .await
            .unwrap();

        h.processor.on_shortfall(order.id, BookId::new(1), 0).await.unwrap();

        assert_eq!(h.store.status(order.id), Some(OrderStatus::Shipped));
        assert_eq!(deltas(&h.queue), vec![-2]);
    }

    #[tokio::test]
    async fn in_flight_orders_are_resumed() {
        let h = harness(InMemoryCatalog::new().with_book(BookId::new(1), 5));
        let (order, _) = pending_order(&h.store, vec![LineItem::new(BookId::new(1), 1)]).await;
        h.store
            .transition(order.id, &[OrderStatus::Pending], OrderStatus::Processing)
            .await
            .unwrap();

        let resumed = h.processor.resume_in_flight().await.unwrap();

        assert_eq!(resumed, 1);
        assert_eq!(deltas(&h.queue), vec![-1]);
        assert!(h.store.order(order.id).unwrap().reservations_sent);
        assert_eq!(h.shipping.in_flight(), 1);
    }

    #[tokio::test]
    async fn resumed_orders_with_sent_reservations_only_ship() {
        let h = harness(InMemoryCatalog::new().with_book(BookId::new(1), 5));
        let (order, envelope) = pending_order(&h.store, vec![LineItem::new(BookId::new(1), 1)]).await;
        h.processor.handle(&envelope).await.unwrap();

        let resumed = h.processor.resume_in_flight().await.unwrap();

        assert_eq!(resumed, 1);
        assert_eq!(deltas(&h.queue), vec![-1]);
        assert_eq!(h.store.status(order.id), Some(OrderStatus::Processing));
        assert_eq!(h.shipping.in_flight(), 1);
    }
}
