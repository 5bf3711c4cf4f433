//! Prometheus metrics for the fulfillment pipeline.
//!
//! Recorders are grouped by concern:
//! - [`QueueMetrics`]: publishes, deliveries and their outcomes (ack, nack, dead-letter)
//! - [`OrderMetrics`]: order creation, status transitions, cancellations
//! - [`InventoryMetrics`]: stock adjustments and shortfalls
//! - [`DeadLetterMetrics`]: parked messages by reason
//! - [`RetryMetrics`]: retry attempts of transient operations
//!
//! # Example
//!
//! ```rust,no_run
//! use fulfillment_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
}

/// Prometheus exporter serving `/metrics` over HTTP.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server bound to `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register metric descriptions, install the global recorder and start the
    /// HTTP listener.
    ///
    /// Must be called from inside a tokio runtime. A second call in the same process
    /// (tests) logs a warning and keeps the existing recorder.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Build`] if the exporter cannot be built.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .with_http_listener(self.addr);

        let (recorder, exporter) = builder
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();

        if metrics::set_global_recorder(recorder).is_err() {
            tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
            return Ok(());
        }

        let addr = self.addr;
        tokio::spawn(async move {
            // The exporter's error type carries no description to log.
            if exporter.await.is_err() {
                tracing::error!(addr = %addr, "Metrics exporter stopped");
            }
        });

        self.handle = Some(handle);
        tracing::info!(addr = %self.addr, "Metrics available at http://{}/metrics", self.addr);
        Ok(())
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if this instance did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    // Queue
    describe_counter!(
        "queue_messages_published_total",
        "Messages published, by queue"
    );
    describe_counter!(
        "queue_publish_errors_total",
        "Publishes that failed or were dropped, by queue"
    );
    describe_counter!(
        "queue_deliveries_total",
        "Deliveries settled by a consumer, by queue and outcome"
    );
    describe_histogram!(
        "queue_handler_duration_seconds",
        "Time spent in a message handler"
    );
    describe_gauge!(
        "queue_publish_buffer_depth",
        "Messages waiting in the outbound publish buffer"
    );

    // Orders
    describe_counter!("orders_created_total", "Orders accepted by the service");
    describe_counter!(
        "order_transitions_total",
        "Committed status transitions, by target status"
    );
    describe_counter!(
        "orders_cancelled_total",
        "Cancelled orders, by cause (user or stock)"
    );
    describe_gauge!(
        "shipments_in_flight",
        "Orders currently waiting in the shipping simulator"
    );

    // Inventory
    describe_counter!(
        "inventory_adjustments_total",
        "Stock adjustments, by kind and outcome"
    );
    describe_counter!(
        "inventory_shortfalls_total",
        "Reservations rejected for insufficient stock"
    );

    // Dead letters
    describe_counter!(
        "dead_letters_total",
        "Messages parked in the dead-letter sink, by queue and reason"
    );

    // Retry
    describe_counter!("retry_attempts_total", "Total number of retry attempts");
    describe_counter!("retry_successes_total", "Operations that succeeded after a retry");
    describe_counter!(
        "retry_exhausted_total",
        "Operations that failed after max retries"
    );
}

/// How a delivery was settled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Handled and acknowledged
    Acked,
    /// Rejected for redelivery
    Nacked,
    /// Parked in the dead-letter sink
    DeadLettered,
}

impl DeliveryOutcome {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Acked => "acked",
            Self::Nacked => "nacked",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

/// Queue transport metrics recorder.
pub struct QueueMetrics;

impl QueueMetrics {
    /// Record a successful publish.
    pub fn record_publish(queue: &str) {
        counter!("queue_messages_published_total", "queue" => queue.to_string()).increment(1);
    }

    /// Record a failed or dropped publish.
    pub fn record_publish_error(queue: &str) {
        counter!("queue_publish_errors_total", "queue" => queue.to_string()).increment(1);
    }

    /// Record how a delivery was settled and how long the handler took.
    pub fn record_delivery(queue: &str, outcome: DeliveryOutcome, duration: Duration) {
        counter!(
            "queue_deliveries_total",
            "queue" => queue.to_string(),
            "outcome" => outcome.as_str()
        )
        .increment(1);
        histogram!("queue_handler_duration_seconds", "queue" => queue.to_string())
            .record(duration.as_secs_f64());
    }

    /// Record the current depth of the publish buffer.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_buffer_depth(depth: usize) {
        gauge!("queue_publish_buffer_depth").set(depth as f64);
    }
}

/// Order lifecycle metrics recorder.
pub struct OrderMetrics;

impl OrderMetrics {
    /// Record an accepted order.
    pub fn record_created() {
        counter!("orders_created_total").increment(1);
    }

    /// Record a committed status transition.
    pub fn record_transition(to: &'static str) {
        counter!("order_transitions_total", "to" => to).increment(1);
    }

    /// Record a cancellation, `cause` being `"user"` or `"stock"`.
    pub fn record_cancelled(cause: &'static str) {
        counter!("orders_cancelled_total", "cause" => cause).increment(1);
    }

    /// Record the number of orders waiting for shipment or delivery.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_in_flight(count: usize) {
        gauge!("shipments_in_flight").set(count as f64);
    }
}

/// Inventory metrics recorder.
pub struct InventoryMetrics;

impl InventoryMetrics {
    /// Record a stock adjustment by kind (`reserve`/`restock`) and outcome.
    pub fn record_adjustment(kind: &'static str, outcome: &'static str) {
        counter!("inventory_adjustments_total", "kind" => kind, "outcome" => outcome).increment(1);
    }

    /// Record a rejected reservation.
    pub fn record_shortfall() {
        counter!("inventory_shortfalls_total").increment(1);
    }
}

/// Dead-letter metrics recorder.
pub struct DeadLetterMetrics;

impl DeadLetterMetrics {
    /// Record a parked message.
    pub fn record(queue: &str, reason: &'static str) {
        counter!("dead_letters_total", "queue" => queue.to_string(), "reason" => reason)
            .increment(1);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("retry_attempts_total").increment(1);
    }

    /// Record a successful retry.
    pub fn record_success() {
        counter!("retry_successes_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("retry_exhausted_total").increment(1);
    }
}
