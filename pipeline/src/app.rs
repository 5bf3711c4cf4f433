//! Pipeline wiring and lifecycle.
//!
//! [`Pipeline::start`] builds the three stages on top of a set of [`Seams`] and runs
//! them as background workers:
//!
//! 1. The shipping simulator resumes orders that were PROCESSING or SHIPPED when the
//!    process last stopped
//! 2. One [`QueueConsumer`] drives the [`OrderProcessor`] on the orders queue
//! 3. One [`QueueConsumer`] drives the [`InventoryManager`] on the inventory queue
//!
//! The [`OrderService`] returned by [`Pipeline::service`] is what the API layer calls.
//! [`Pipeline::shutdown`] stops the consumers between messages, then waits for the
//! shipping tasks to park.
//!
//! # Example
//!
//! ```rust,ignore
//! let pipeline = Pipeline::start(seams, PipelineSettings::from(&config)).await?;
//! let order = pipeline.service().create_order(user_id, items).await?;
//!
//! shutdown_signal().await;
//! pipeline.shutdown().await;
//! ```

use crate::config::Config;
use crate::inventory::InventoryManager;
use crate::processor::OrderProcessor;
use crate::publisher::InventoryPublisher;
use crate::service::OrderService;
use crate::shipping::{ShippingDelays, ShippingSimulator};
use fulfillment_core::catalog::Catalog;
use fulfillment_core::dead_letter::DeadLetterSink;
use fulfillment_core::environment::Clock;
use fulfillment_core::message::{INVENTORY_UPDATES_QUEUE, ORDERS_QUEUE};
use fulfillment_core::notify::Notifier;
use fulfillment_core::queue::MessageQueue;
use fulfillment_core::store::{OrderStore, StoreError};
use fulfillment_runtime::consumer::{ConsumerError, DEFAULT_MAX_ATTEMPTS, QueueConsumer};
use fulfillment_runtime::lifecycle::Workers;
use fulfillment_runtime::retry::RetryPolicy;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while starting the pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A queue consumer could not be built
    #[error(transparent)]
    Consumer(#[from] ConsumerError),

    /// In-flight orders could not be loaded
    #[error("Failed to resume in-flight orders: {0}")]
    Resume(#[from] StoreError),
}

/// The collaborators the pipeline runs against.
#[derive(Clone)]
pub struct Seams {
    /// Queue transport
    pub queue: Arc<dyn MessageQueue>,
    /// Order records
    pub store: Arc<dyn OrderStore>,
    /// Book stock
    pub catalog: Arc<dyn Catalog>,
    /// User and global notifications
    pub notifier: Arc<dyn Notifier>,
    /// Parking for messages that cannot be processed
    pub dead_letters: Arc<dyn DeadLetterSink>,
    /// Time source
    pub clock: Arc<dyn Clock>,
}

/// Tunables of a running pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Queue carrying new orders
    pub orders_queue: String,
    /// Queue carrying stock adjustments
    pub inventory_queue: String,
    /// Deliveries per message before it is dead-lettered
    pub max_delivery_attempts: u32,
    /// Backoff for publishes and store calls
    pub retry: RetryPolicy,
    /// Shipping timeline
    pub shipping: ShippingDelays,
    /// How long shutdown waits for each worker
    pub shutdown_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            orders_queue: ORDERS_QUEUE.to_string(),
            inventory_queue: INVENTORY_UPDATES_QUEUE.to_string(),
            max_delivery_attempts: DEFAULT_MAX_ATTEMPTS,
            retry: RetryPolicy::default(),
            shipping: ShippingDelays::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            orders_queue: config.queue.orders_queue.clone(),
            inventory_queue: config.queue.inventory_queue.clone(),
            max_delivery_attempts: config.queue.max_delivery_attempts,
            retry: RetryPolicy::builder()
                .max_retries(config.retry.max_retries)
                .initial_delay(Duration::from_millis(config.retry.initial_delay_ms))
                .max_delay(Duration::from_millis(config.retry.max_delay_ms))
                .build(),
            shipping: ShippingDelays {
                ship_after: Duration::from_secs(config.shipping.shipping_delay_secs),
                deliver_after: Duration::from_secs(config.shipping.delivery_delay_secs),
            },
            shutdown_timeout: config.server.shutdown_timeout(),
        }
    }
}

/// A running order-fulfillment pipeline.
pub struct Pipeline {
    service: OrderService,
    shipping: Arc<ShippingSimulator>,
    workers: Workers,
    shutdown_timeout: Duration,
}

impl Pipeline {
    /// Wire the stages and start the background workers.
    ///
    /// # Errors
    ///
    /// - [`PipelineError::Resume`] if in-flight orders cannot be listed
    /// - [`PipelineError::Consumer`] if a consumer is misconfigured
    pub async fn start(seams: Seams, settings: PipelineSettings) -> Result<Self, PipelineError> {
        let mut workers = Workers::new(settings.shutdown_timeout);

        let inventory = InventoryPublisher::new(
            Arc::clone(&seams.queue),
            settings.inventory_queue.clone(),
            Arc::clone(&seams.dead_letters),
            Arc::clone(&seams.clock),
            settings.retry.clone(),
        );
        let shipping = Arc::new(ShippingSimulator::new(
            Arc::clone(&seams.store),
            Arc::clone(&seams.notifier),
            settings.shipping,
            settings.retry.clone(),
            workers.subscribe(),
        ));
        let processor = Arc::new(OrderProcessor::new(
            Arc::clone(&seams.store),
            Arc::clone(&seams.catalog),
            Arc::clone(&seams.notifier),
            inventory.clone(),
            Arc::clone(&shipping),
        ));
        let inventory_manager = Arc::new(InventoryManager::new(
            Arc::clone(&seams.catalog),
            Arc::clone(&seams.notifier),
            processor.clone(),
        ));

        processor.resume_in_flight().await?;

        let order_consumer = QueueConsumer::builder()
            .name("order-processor")
            .queue(settings.orders_queue.clone())
            .transport(Arc::clone(&seams.queue))
            .handler(processor)
            .dead_letters(Arc::clone(&seams.dead_letters))
            .clock(Arc::clone(&seams.clock))
            .shutdown(workers.subscribe())
            .max_attempts(settings.max_delivery_attempts)
            .build()?;
        workers.add("order-processor", order_consumer.spawn());

        let inventory_consumer = QueueConsumer::builder()
            .name("inventory-manager")
            .queue(settings.inventory_queue.clone())
            .transport(Arc::clone(&seams.queue))
            .handler(inventory_manager)
            .dead_letters(Arc::clone(&seams.dead_letters))
            .clock(Arc::clone(&seams.clock))
            .shutdown(workers.subscribe())
            .max_attempts(settings.max_delivery_attempts)
            .build()?;
        workers.add("inventory-manager", inventory_consumer.spawn());

        let service = OrderService::new(
            Arc::clone(&seams.store),
            Arc::clone(&seams.queue),
            settings.orders_queue.clone(),
            inventory,
            Arc::clone(&seams.dead_letters),
            Arc::clone(&seams.notifier),
            Arc::clone(&seams.clock),
            settings.retry,
        );

        tracing::info!(
            orders_queue = %settings.orders_queue,
            inventory_queue = %settings.inventory_queue,
            workers = workers.len(),
            "Order fulfillment pipeline started"
        );

        Ok(Self {
            service,
            shipping,
            workers,
            shutdown_timeout: settings.shutdown_timeout,
        })
    }

    /// The order API.
    #[must_use]
    pub const fn service(&self) -> &OrderService {
        &self.service
    }

    /// Shipments currently running.
    #[must_use]
    pub fn shipments_in_flight(&self) -> usize {
        self.shipping.in_flight()
    }

    /// Stop consuming and park the shipping tasks.
    ///
    /// Consumers finish the message in hand before stopping. Shipments stop at their
    /// next sleep and are resumed from the order store on the next start.
    pub async fn shutdown(self) {
        tracing::info!("Shutting down order fulfillment pipeline");
        self.workers.shutdown().await;
        self.shipping.drain(self.shutdown_timeout).await;
        tracing::info!("Order fulfillment pipeline stopped");
    }
}
