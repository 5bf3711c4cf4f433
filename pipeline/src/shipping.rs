//! Shipping simulator.
//!
//! Once an order reaches PROCESSING, [`ShippingSimulator::initiate_shipping`] spawns one
//! timed task for it:
//!
//! ```text
//!   PROCESSING ──(shipping delay)──► SHIPPED ──(delivery delay)──► DELIVERED
//! ```
//!
//! Each step is a compare-and-set from the expected prior status. If a cancellation got
//! there first the step is a no-op and the task ends quietly: no transition, no
//! notification. Shutdown is only observed while a task sleeps, never in the middle of
//! a transition.

use fulfillment_core::notify::{Notifier, OrderNotification};
use fulfillment_core::store::{OrderStore, StoreError};
use fulfillment_core::types::{Order, OrderId, OrderStatus};
use fulfillment_runtime::metrics::OrderMetrics;
use fulfillment_runtime::retry::{RetryPolicy, retry_with_predicate};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Time an order spends in each shipping stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShippingDelays {
    /// PROCESSING to SHIPPED
    pub ship_after: Duration,
    /// SHIPPED to DELIVERED
    pub deliver_after: Duration,
}

impl Default for ShippingDelays {
    fn default() -> Self {
        Self {
            ship_after: Duration::from_secs(10),
            deliver_after: Duration::from_secs(10),
        }
    }
}

type InFlight = Arc<Mutex<HashMap<OrderId, JoinHandle<()>>>>;

/// Advances accepted orders through shipping on a timer.
pub struct ShippingSimulator {
    store: Arc<dyn OrderStore>,
    notifier: Arc<dyn Notifier>,
    delays: ShippingDelays,
    retry: RetryPolicy,
    shutdown: broadcast::Receiver<()>,
    in_flight: InFlight,
}

impl ShippingSimulator {
    /// Create a simulator; its tasks stop sleeping when `shutdown` fires.
    #[must_use]
    pub fn new(
        store: Arc<dyn OrderStore>,
        notifier: Arc<dyn Notifier>,
        delays: ShippingDelays,
        retry: RetryPolicy,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            store,
            notifier,
            delays,
            retry,
            shutdown,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Schedule the shipping timeline for an order.
    ///
    /// Starts from the order's current status: a PROCESSING order waits to ship, a
    /// SHIPPED order (resumed after a restart) waits to be delivered. Any other status,
    /// or an order that already has a task, is ignored.
    pub fn initiate_shipping(&self, order: &Order) {
        if !matches!(order.status, OrderStatus::Processing | OrderStatus::Shipped) {
            tracing::debug!(order_id = %order.id, status = %order.status, "Nothing to ship");
            return;
        }

        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if in_flight.get(&order.id).is_some_and(|task| !task.is_finished()) {
            tracing::debug!(order_id = %order.id, "Shipment already scheduled");
            return;
        }

        let shipment = Shipment {
            order: order.clone(),
            store: Arc::clone(&self.store),
            notifier: Arc::clone(&self.notifier),
            delays: self.delays,
            retry: self.retry.clone(),
            shutdown: self.shutdown.resubscribe(),
            in_flight: Arc::clone(&self.in_flight),
        };
        in_flight.insert(order.id, tokio::spawn(shipment.run()));
        OrderMetrics::record_in_flight(in_flight.len());

        tracing::info!(
            order_id = %order.id,
            status = %order.status,
            ship_after_secs = self.delays.ship_after.as_secs(),
            "Shipping initiated"
        );
    }

    /// Number of shipments still running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|task| !task.is_finished())
            .count()
    }

    /// Wait for running shipments to stop after the shutdown signal, up to `timeout`.
    pub async fn drain(&self, timeout: Duration) {
        let handles: Vec<(OrderId, JoinHandle<()>)> = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();

        for (order_id, handle) in handles {
            let abort = handle.abort_handle();
            if tokio::time::timeout(timeout, handle).await.is_err() {
                tracing::warn!(order_id = %order_id, "Shipment did not stop in time, aborting");
                abort.abort();
            }
        }
        OrderMetrics::record_in_flight(0);
    }
}

/// One order's shipping timeline.
struct Shipment {
    order: Order,
    store: Arc<dyn OrderStore>,
    notifier: Arc<dyn Notifier>,
    delays: ShippingDelays,
    retry: RetryPolicy,
    shutdown: broadcast::Receiver<()>,
    in_flight: InFlight,
}

impl Shipment {
    async fn run(mut self) {
        let order_id = self.order.id;

        if self.order.status == OrderStatus::Processing {
            let shipped = self.wait(self.delays.ship_after).await
                && self.advance(OrderStatus::Processing, OrderStatus::Shipped).await;
            if !shipped {
                self.finish();
                return;
            }
        }

        if self.wait(self.delays.deliver_after).await {
            self.advance(OrderStatus::Shipped, OrderStatus::Delivered).await;
        }

        tracing::debug!(order_id = %order_id, "Shipment finished");
        self.finish();
    }

    /// Sleep for `delay`; false if shutdown arrived first.
    async fn wait(&mut self, delay: Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(delay) => true,
            _ = self.shutdown.recv() => {
                tracing::info!(order_id = %self.order.id, "Shipment paused by shutdown");
                false
            }
        }
    }

    /// Compare-and-set `from -> to`; true if this task made the transition.
    async fn advance(&self, from: OrderStatus, to: OrderStatus) -> bool {
        let order_id = self.order.id;
        let result = retry_with_predicate(
            &self.retry,
            || self.store.transition(order_id, &[from], to),
            |e: &StoreError| matches!(e, StoreError::DatabaseError(_)),
        )
        .await;

        match result {
            Ok(order) => {
                OrderMetrics::record_transition(to.as_str());
                tracing::info!(order_id = %order_id, from = %from, to = %to, "Order advanced");
                self.notifier
                    .notify_user(OrderNotification::new(order.user_id, order_id, to));
                true
            }
            Err(StoreError::StatusConflict { actual, .. }) => {
                tracing::info!(
                    order_id = %order_id,
                    expected = %from,
                    actual = %actual,
                    "Order moved on before shipping step, skipping"
                );
                false
            }
            Err(e) => {
                tracing::error!(order_id = %order_id, from = %from, to = %to, error = %e, "Shipping step failed");
                false
            }
        }
    }

    fn finish(&self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        in_flight.remove(&self.order.id);
        OrderMetrics::record_in_flight(in_flight.len());
    }
}
