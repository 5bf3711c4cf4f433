//! Order persistence.

use chrono::{DateTime, Utc};
use fulfillment_core::store::{OrderStore, StoreError, check_transition};
use fulfillment_core::types::{LineItem, Order, OrderId, OrderStatus, UserId};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

/// `PostgreSQL` [`OrderStore`].
///
/// A transition is one statement:
///
/// ```sql
/// UPDATE orders SET status = $next WHERE id = $id AND status = ANY($expected) RETURNING ...
/// ```
///
/// so concurrent callers racing on the same order see exactly one winner. When no row
/// is updated, a follow-up read tells a missing order apart from a status conflict.
#[derive(Clone)]
pub struct PostgresOrderStore {
    pool: PgPool,
}

impl PostgresOrderStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_order(row: &sqlx::postgres::PgRow) -> Result<Order, StoreError> {
        let id: Uuid = row.try_get("id").map_err(db_error)?;
        let user_id: i64 = row.try_get("user_id").map_err(db_error)?;
        let Json(items): Json<Vec<LineItem>> = row.try_get("items").map_err(db_error)?;
        let status: String = row.try_get("status").map_err(db_error)?;
        let created_at: DateTime<Utc> = row.try_get("created_at").map_err(db_error)?;

        Ok(Order {
            id: OrderId::new(id),
            user_id: UserId::new(user_id),
            items,
            status: parse_status(&status)?,
            created_at,
            reservations_sent: row.try_get("reservations_sent").map_err(db_error)?,
        })
    }
}

fn db_error(error: sqlx::Error) -> StoreError {
    StoreError::DatabaseError(error.to_string())
}

fn parse_status(s: &str) -> Result<OrderStatus, StoreError> {
    OrderStatus::parse(s).ok_or_else(|| StoreError::DatabaseError(format!("Invalid order status: {s}")))
}

impl OrderStore for PostgresOrderStore {
    fn insert(&self, order: Order) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO orders (id, user_id, items, status, created_at)
                VALUES ($1, $2, $3, $4, $5)
                ",
            )
            .bind(order.id.as_uuid())
            .bind(order.user_id.get())
            .bind(Json(&order.items))
            .bind(order.status.as_str())
            .bind(order.created_at)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(db_err) = &e {
                    if db_err.is_unique_violation() {
                        return StoreError::AlreadyExists(order.id);
                    }
                }
                db_error(e)
            })?;

            tracing::debug!(order_id = %order.id, "Order inserted");
            Ok(())
        })
    }

    fn get(&self, order_id: OrderId) -> Pin<Box<dyn Future<Output = Result<Order, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                SELECT id, user_id, items, status, created_at, reservations_sent
                FROM orders
                WHERE id = $1
                ",
            )
            .bind(order_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .ok_or(StoreError::NotFound(order_id))?;

            Self::row_to_order(&row)
        })
    }

    fn transition(
        &self,
        order_id: OrderId,
        expected: &[OrderStatus],
        next: OrderStatus,
    ) -> Pin<Box<dyn Future<Output = Result<Order, StoreError>> + Send + '_>> {
        let expected = expected.to_vec();
        Box::pin(async move {
            check_transition(&expected, next)?;
            let expected_names: Vec<&str> = expected.iter().map(OrderStatus::as_str).collect();

            let updated = sqlx::query(
                r"
                UPDATE orders
                SET status = $1, updated_at = NOW()
                WHERE id = $2 AND status = ANY($3)
                RETURNING id, user_id, items, status, created_at, reservations_sent
                ",
            )
            .bind(next.as_str())
            .bind(order_id.as_uuid())
            .bind(&expected_names)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

            if let Some(row) = updated {
                tracing::debug!(order_id = %order_id, to = %next, "Order status updated");
                return Self::row_to_order(&row);
            }

            let actual: Option<String> = sqlx::query_scalar("SELECT status FROM orders WHERE id = $1")
                .bind(order_id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error)?;

            match actual {
                None => Err(StoreError::NotFound(order_id)),
                Some(actual) => Err(StoreError::StatusConflict {
                    order_id,
                    expected,
                    actual: parse_status(&actual)?,
                }),
            }
        })
    }

    fn mark_reservations_sent(
        &self,
        order_id: OrderId,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query("UPDATE orders SET reservations_sent = TRUE, updated_at = NOW() WHERE id = $1")
                .bind(order_id.as_uuid())
                .execute(&self.pool)
                .await
                .map_err(db_error)?;

            if result.rows_affected() == 0 {
                return Err(StoreError::NotFound(order_id));
            }
            Ok(())
        })
    }

    fn list_by_status(
        &self,
        statuses: &[OrderStatus],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Order>, StoreError>> + Send + '_>> {
        let names: Vec<&'static str> = statuses.iter().map(OrderStatus::as_str).collect();
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT id, user_id, items, status, created_at, reservations_sent
                FROM orders
                WHERE status = ANY($1)
                ORDER BY created_at ASC
                ",
            )
            .bind(&names)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

            rows.iter().map(Self::row_to_order).collect()
        })
    }
}
