//! Order-fulfillment worker process.
//!
//! Connects to `PostgreSQL` and Redpanda, runs the pipeline's background stages and
//! serves Prometheus metrics until Ctrl+C or SIGTERM.

use anyhow::Context;
use fulfillment_core::environment::SystemClock;
use fulfillment_postgres::{DeadLetterQueue, PostgresCatalog, PostgresOrderStore, run_migrations};
use fulfillment_redpanda::RedpandaQueue;
use fulfillment_runtime::lifecycle::shutdown_signal;
use fulfillment_runtime::metrics::MetricsServer;
use order_fulfillment::{BroadcastNotifier, Config, Pipeline, PipelineSettings, Seams};
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Best effort: a missing .env is normal in production
    let _ = dotenvy::dotenv();
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&config.server.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        brokers = %config.queue.brokers,
        consumer_group = %config.queue.consumer_group,
        orders_queue = %config.queue.orders_queue,
        inventory_queue = %config.queue.inventory_queue,
        "Starting order fulfillment"
    );

    let metrics_addr: SocketAddr = config
        .server
        .metrics_addr
        .parse()
        .with_context(|| format!("invalid METRICS_ADDR {}", config.server.metrics_addr))?;
    let mut metrics = MetricsServer::new(metrics_addr);
    metrics.start()?;

    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.postgres.max_connections)
        .min_connections(config.postgres.min_connections)
        .acquire_timeout(config.postgres.connect_timeout())
        .connect(&config.postgres.url)
        .await
        .context("failed to connect to PostgreSQL")?;
    run_migrations(&pool).await?;
    info!("Database ready");

    let settings = PipelineSettings::from(&config);

    info!("Connecting to Redpanda...");
    let queue = Arc::new(
        RedpandaQueue::builder()
            .brokers(&config.queue.brokers)
            .consumer_group(&config.queue.consumer_group)
            .publish_buffer_capacity(config.queue.publish_buffer_capacity)
            .redelivery(settings.retry.clone())
            .build()?,
    );
    info!("Queue transport ready");

    let notifier = Arc::new(BroadcastNotifier::default());
    let seams = Seams {
        queue: queue.clone(),
        store: Arc::new(PostgresOrderStore::new(pool.clone())),
        catalog: Arc::new(PostgresCatalog::new(pool.clone())),
        notifier,
        dead_letters: Arc::new(DeadLetterQueue::new(pool.clone())),
        clock: Arc::new(SystemClock),
    };

    let shutdown_timeout = settings.shutdown_timeout;
    let pipeline = Pipeline::start(seams, settings).await?;

    shutdown_signal().await;

    pipeline.shutdown().await;
    let unsent = queue.flush(shutdown_timeout).await;
    if unsent > 0 {
        warn!(unsent, "Publishes still buffered at exit were dropped");
    }
    pool.close().await;

    info!("Order fulfillment stopped");
    Ok(())
}
