//! `PostgreSQL` adapters for the order-fulfillment pipeline.
//!
//! - [`PostgresOrderStore`]: orders, with status changes as a single conditional
//!   `UPDATE ... WHERE status = ANY(...)`
//! - [`PostgresCatalog`]: book stock plus the per-(order, book) adjustment ledger,
//!   updated together in one transaction under a row lock on the book
//! - [`DeadLetterQueue`]: the `failed_messages` table and its resolution workflow
//!
//! # Example
//!
//! ```ignore
//! use fulfillment_postgres::{PostgresOrderStore, run_migrations};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = sqlx::PgPool::connect("postgres://localhost/bookstore").await?;
//!     run_migrations(&pool).await?;
//!     let orders = PostgresOrderStore::new(pool);
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod catalog;
pub mod dead_letter_queue;
pub mod order_store;

pub use catalog::PostgresCatalog;
pub use dead_letter_queue::{DLQStatus, DeadLetterQueue, FailedMessage};
pub use order_store::PostgresOrderStore;

use sqlx::PgPool;

/// Apply the schema in `migrations/`.
///
/// # Errors
///
/// Returns the migrator's error if a migration fails or the history is inconsistent.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    tracing::info!("Running database migrations");
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations complete");
    Ok(())
}
