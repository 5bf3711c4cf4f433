//! Book stock and the reservation ledger.

use fulfillment_core::catalog::{
    AdjustmentOutcome, Catalog, CatalogError, LedgerState, StockAdjustment, plan_adjustment,
};
use fulfillment_core::types::BookId;
use sqlx::PgPool;
use std::future::Future;
use std::pin::Pin;

/// `PostgreSQL` [`Catalog`].
///
/// Every adjustment runs in one transaction:
///
/// 1. `SELECT stock FROM books ... FOR UPDATE` serializes all adjustments of that book
/// 2. the `(order_id, book_id)` row of `stock_ledger` decides whether the delta applies
/// 3. stock and ledger are written together, or not at all
///
/// A reservation that would drive stock below zero is rejected, so stock is never
/// negative (the table's `CHECK` enforces the same). The rejection is recorded in the
/// ledger in the same transaction.
#[derive(Clone)]
pub struct PostgresCatalog {
    pool: PgPool,
}

fn db_error(error: sqlx::Error) -> CatalogError {
    CatalogError::DatabaseError(error.to_string())
}

fn stock_from_db(stock: i32) -> Result<u32, CatalogError> {
    u32::try_from(stock).map_err(|_| CatalogError::DatabaseError(format!("Negative stock in database: {stock}")))
}

fn stock_to_db(stock: u32) -> Result<i32, CatalogError> {
    i32::try_from(stock).map_err(|_| CatalogError::DatabaseError(format!("Stock out of range: {stock}")))
}

impl PostgresCatalog {
    /// Create a catalog over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a book or overwrite its title and stock.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::DatabaseError`] if the write fails.
    pub async fn upsert_book(&self, book_id: BookId, title: &str, stock: u32) -> Result<(), CatalogError> {
        sqlx::query(
            r"
            INSERT INTO books (id, title, stock)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE
            SET title = EXCLUDED.title, stock = EXCLUDED.stock, updated_at = NOW()
            ",
        )
        .bind(book_id.get())
        .bind(title)
        .bind(stock_to_db(stock)?)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        tracing::info!(book_id = %book_id, stock, "Book stock set");
        Ok(())
    }

    /// Overwrite the stock of an existing book.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::BookNotFound`] if the book does not exist.
    pub async fn set_stock(&self, book_id: BookId, stock: u32) -> Result<(), CatalogError> {
        let result = sqlx::query("UPDATE books SET stock = $1, updated_at = NOW() WHERE id = $2")
            .bind(stock_to_db(stock)?)
            .bind(book_id.get())
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(CatalogError::BookNotFound(book_id));
        }
        Ok(())
    }

    async fn apply(&self, adjustment: StockAdjustment) -> Result<AdjustmentOutcome, CatalogError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let stock: Option<i32> = sqlx::query_scalar("SELECT stock FROM books WHERE id = $1 FOR UPDATE")
            .bind(adjustment.book_id.get())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_error)?;
        let stock = stock_from_db(stock.ok_or(CatalogError::BookNotFound(adjustment.book_id))?)?;

        let entry: Option<String> = sqlx::query_scalar(
            "SELECT state FROM stock_ledger WHERE order_id = $1 AND book_id = $2",
        )
        .bind(adjustment.order_id.as_uuid())
        .bind(adjustment.book_id.get())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?;
        let entry = entry
            .map(|s| {
                LedgerState::parse(&s)
                    .ok_or_else(|| CatalogError::DatabaseError(format!("Invalid ledger state: {s}")))
            })
            .transpose()?;

        // Dropping `tx` on an early return rolls back.
        let plan = plan_adjustment(&adjustment, entry, stock);

        if let Some((state, new_stock)) = plan.write {
            sqlx::query("UPDATE books SET stock = $1, updated_at = NOW() WHERE id = $2")
                .bind(stock_to_db(new_stock)?)
                .bind(adjustment.book_id.get())
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;

            sqlx::query(
                r"
                INSERT INTO stock_ledger (order_id, book_id, state, quantity)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (order_id, book_id) DO UPDATE
                SET state = EXCLUDED.state, updated_at = NOW()
                ",
            )
            .bind(adjustment.order_id.as_uuid())
            .bind(adjustment.book_id.get())
            .bind(state.as_str())
            .bind(adjustment.delta.abs())
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        }

        // A rejected reservation commits its ledger row before the error is returned.
        tx.commit().await.map_err(db_error)?;
        plan.result
    }
}

impl Catalog for PostgresCatalog {
    fn stock(&self, book_id: BookId) -> Pin<Box<dyn Future<Output = Result<u32, CatalogError>> + Send + '_>> {
        Box::pin(async move {
            let stock: Option<i32> = sqlx::query_scalar("SELECT stock FROM books WHERE id = $1")
                .bind(book_id.get())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error)?;
            stock_from_db(stock.ok_or(CatalogError::BookNotFound(book_id))?)
        })
    }

    fn apply_adjustment(
        &self,
        adjustment: StockAdjustment,
    ) -> Pin<Box<dyn Future<Output = Result<AdjustmentOutcome, CatalogError>> + Send + '_>> {
        Box::pin(self.apply(adjustment))
    }
}
