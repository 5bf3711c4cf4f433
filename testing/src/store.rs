//! In-memory order store and stock catalog.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on a poisoned lock

use fulfillment_core::catalog::{
    AdjustmentOutcome, Catalog, CatalogError, LedgerState, StockAdjustment, plan_adjustment,
};
use fulfillment_core::store::{OrderStore, StoreError, check_transition};
use fulfillment_core::types::{BookId, Order, OrderId, OrderStatus};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

/// In-memory [`OrderStore`]. Every transition is a compare-and-set under one lock.
#[derive(Clone, Debug, Default)]
pub struct InMemoryOrderStore {
    orders: Arc<Mutex<HashMap<OrderId, Order>>>,
    transitions: Arc<Mutex<Vec<(OrderId, OrderStatus, OrderStatus)>>>,
    fail_next: Arc<Mutex<u32>>,
}

impl InMemoryOrderStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current status of an order, if it exists.
    #[must_use]
    pub fn status(&self, order_id: OrderId) -> Option<OrderStatus> {
        self.orders.lock().unwrap().get(&order_id).map(|o| o.status)
    }

    /// Snapshot of an order.
    #[must_use]
    pub fn order(&self, order_id: OrderId) -> Option<Order> {
        self.orders.lock().unwrap().get(&order_id).cloned()
    }

    /// Every committed transition `(order, from, to)`, in commit order.
    #[must_use]
    pub fn transitions(&self) -> Vec<(OrderId, OrderStatus, OrderStatus)> {
        self.transitions.lock().unwrap().clone()
    }

    /// Committed transitions of one order, as `(from, to)` pairs.
    #[must_use]
    pub fn history(&self, order_id: OrderId) -> Vec<(OrderStatus, OrderStatus)> {
        self.transitions()
            .into_iter()
            .filter(|(id, _, _)| *id == order_id)
            .map(|(_, from, to)| (from, to))
            .collect()
    }

    /// Make the next `count` calls fail with [`StoreError::DatabaseError`].
    pub fn fail_next_calls(&self, count: u32) {
        *self.fail_next.lock().unwrap() = count;
    }

    fn injected_failure(&self) -> Result<(), StoreError> {
        let mut remaining = self.fail_next.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            return Err(StoreError::DatabaseError("injected failure".to_string()));
        }
        Ok(())
    }
}

impl OrderStore for InMemoryOrderStore {
    fn insert(&self, order: Order) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(async move {
            self.injected_failure()?;
            let mut orders = self.orders.lock().unwrap();
            if orders.contains_key(&order.id) {
                return Err(StoreError::AlreadyExists(order.id));
            }
            orders.insert(order.id, order);
            Ok(())
        })
    }

    fn get(&self, order_id: OrderId) -> Pin<Box<dyn Future<Output = Result<Order, StoreError>> + Send + '_>> {
        Box::pin(async move {
            self.injected_failure()?;
            self.order(order_id).ok_or(StoreError::NotFound(order_id))
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
            self.injected_failure()?;
            check_transition(&expected, next)?;

            let mut orders = self.orders.lock().unwrap();
            let order = orders.get_mut(&order_id).ok_or(StoreError::NotFound(order_id))?;
            if !expected.contains(&order.status) {
                return Err(StoreError::StatusConflict {
                    order_id,
                    expected,
                    actual: order.status,
                });
            }

            let from = order.status;
            order.status = next;
            self.transitions.lock().unwrap().push((order_id, from, next));
            Ok(order.clone())
        })
    }

    fn mark_reservations_sent(
        &self,
        order_id: OrderId,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(async move {
            self.injected_failure()?;
            let mut orders = self.orders.lock().unwrap();
            let order = orders.get_mut(&order_id).ok_or(StoreError::NotFound(order_id))?;
            order.reservations_sent = true;
            Ok(())
        })
    }

    fn list_by_status(
        &self,
        statuses: &[OrderStatus],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Order>, StoreError>> + Send + '_>> {
        let statuses = statuses.to_vec();
        Box::pin(async move {
            self.injected_failure()?;
            let mut orders: Vec<Order> = self
                .orders
                .lock()
                .unwrap()
                .values()
                .filter(|o| statuses.contains(&o.status))
                .cloned()
                .collect();
            orders.sort_by_key(|o| o.created_at);
            Ok(orders)
        })
    }
}

/// Stock and ledger of one book, guarded by that book's own lock.
#[derive(Debug)]
struct BookState {
    stock: u32,
    ledger: HashMap<OrderId, LedgerState>,
}

/// In-memory [`Catalog`] with the same ledger rules as the Postgres catalog.
///
/// Each book has its own lock, so adjustments of different books never wait on each
/// other. The book map itself is only locked to look a book up.
#[derive(Clone, Debug, Default)]
pub struct InMemoryCatalog {
    books: Arc<Mutex<HashMap<BookId, Arc<Mutex<BookState>>>>>,
    applied: Arc<Mutex<Vec<StockAdjustment>>>,
}

impl InMemoryCatalog {
    /// Create an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a book, or reset the stock of an existing one (its ledger is kept).
    pub fn add_book(&self, book_id: BookId, stock: u32) {
        let mut books = self.books.lock().unwrap();
        match books.get(&book_id) {
            Some(book) => book.lock().unwrap().stock = stock,
            None => {
                books.insert(
                    book_id,
                    Arc::new(Mutex::new(BookState {
                        stock,
                        ledger: HashMap::new(),
                    })),
                );
            }
        }
    }

    /// Builder-style [`add_book`](Self::add_book).
    #[must_use]
    pub fn with_book(self, book_id: BookId, stock: u32) -> Self {
        self.add_book(book_id, stock);
        self
    }

    /// Current stock of a book.
    #[must_use]
    pub fn stock_of(&self, book_id: BookId) -> Option<u32> {
        Some(self.book(book_id)?.lock().unwrap().stock)
    }

    /// Ledger entry of an `(order, book)` pair.
    #[must_use]
    pub fn ledger_entry(&self, order_id: OrderId, book_id: BookId) -> Option<LedgerState> {
        self.book(book_id)?.lock().unwrap().ledger.get(&order_id).copied()
    }

    /// Adjustments that actually moved stock, in order.
    #[must_use]
    pub fn applied(&self) -> Vec<StockAdjustment> {
        self.applied.lock().unwrap().clone()
    }

    fn book(&self, book_id: BookId) -> Option<Arc<Mutex<BookState>>> {
        self.books.lock().unwrap().get(&book_id).cloned()
    }
}

impl Catalog for InMemoryCatalog {
    fn stock(&self, book_id: BookId) -> Pin<Box<dyn Future<Output = Result<u32, CatalogError>> + Send + '_>> {
        Box::pin(async move { self.stock_of(book_id).ok_or(CatalogError::BookNotFound(book_id)) })
    }

    fn apply_adjustment(
        &self,
        adjustment: StockAdjustment,
    ) -> Pin<Box<dyn Future<Output = Result<AdjustmentOutcome, CatalogError>> + Send + '_>> {
        Box::pin(async move {
            let book = self
                .book(adjustment.book_id)
                .ok_or(CatalogError::BookNotFound(adjustment.book_id))?;
            let mut book = book.lock().unwrap();

            let entry = book.ledger.get(&adjustment.order_id).copied();
            let plan = plan_adjustment(&adjustment, entry, book.stock);
            if let Some((ledger_state, new_stock)) = plan.write {
                book.ledger.insert(adjustment.order_id, ledger_state);
                book.stock = new_stock;
                if matches!(plan.result, Ok(AdjustmentOutcome::Applied { .. })) {
                    self.applied.lock().unwrap().push(adjustment);
                }
            }
            plan.result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fulfillment_core::types::{Order, UserId};

    fn order() -> Order {
        Order::new(
            OrderId::generate(),
            UserId::new(1),
            vec![],
            chrono::Utc::now(),
        )
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let store = InMemoryOrderStore::new();
        let order = order();
        store.insert(order.clone()).await.unwrap();

        store
            .transition(order.id, &[OrderStatus::Pending], OrderStatus::Processing)
            .await
            .unwrap();
        let second = store
            .transition(order.id, &[OrderStatus::Pending], OrderStatus::Processing)
            .await;

        assert!(matches!(
            second,
            Err(StoreError::StatusConflict {
                actual: OrderStatus::Processing,
                ..
            })
        ));
        assert_eq!(
            store.history(order.id),
            vec![(OrderStatus::Pending, OrderStatus::Processing)]
        );
    }

    #[tokio::test]
    async fn list_by_status_filters_on_current_status() {
        let store = InMemoryOrderStore::new();
        let shipping = order();
        let waiting = order();
        store.insert(shipping.clone()).await.unwrap();
        store.insert(waiting.clone()).await.unwrap();
        store
            .transition(shipping.id, &[OrderStatus::Pending], OrderStatus::Processing)
            .await
            .unwrap();

        let in_flight = store
            .list_by_status(&[OrderStatus::Processing, OrderStatus::Shipped])
            .await
            .unwrap();
        assert_eq!(in_flight.len(), 1);
        assert_eq!(in_flight[0].id, shipping.id);
    }

    #[tokio::test]
    async fn forbidden_transitions_are_rejected_before_lookup() {
        let store = InMemoryOrderStore::new();
        let result = store
            .transition(OrderId::generate(), &[OrderStatus::Shipped], OrderStatus::Cancelled)
            .await;
        assert!(matches!(result, Err(StoreError::IllegalTransition { .. })));
    }

    #[tokio::test]
    async fn duplicate_reservation_is_not_applied_twice() {
        let book = BookId::new(1);
        let catalog = InMemoryCatalog::new().with_book(book, 5);
        let adjustment = StockAdjustment {
            order_id: OrderId::generate(),
            book_id: book,
            delta: -2,
        };

        catalog.apply_adjustment(adjustment).await.unwrap();
        let again = catalog.apply_adjustment(adjustment).await.unwrap();

        assert_eq!(again, AdjustmentOutcome::Duplicate { stock: 3 });
        assert_eq!(catalog.stock_of(book), Some(3));
        assert_eq!(catalog.applied().len(), 1);
    }

    #[tokio::test]
    async fn rejected_reservation_is_recorded_and_never_applied() {
        let book = BookId::new(1);
        let catalog = InMemoryCatalog::new().with_book(book, 0);
        let reservation = StockAdjustment {
            order_id: OrderId::generate(),
            book_id: book,
            delta: -1,
        };

        let rejected = catalog.apply_adjustment(reservation).await;
        assert!(matches!(rejected, Err(CatalogError::InsufficientStock { .. })));
        assert_eq!(
            catalog.ledger_entry(reservation.order_id, book),
            Some(LedgerState::Rejected)
        );

        catalog.add_book(book, 1);
        let redelivered = catalog.apply_adjustment(reservation).await;
        assert!(matches!(redelivered, Err(CatalogError::InsufficientStock { .. })));
        assert_eq!(catalog.stock_of(book), Some(1));
        assert!(catalog.applied().is_empty());
    }

    #[tokio::test]
    async fn concurrent_reservations_never_oversell_a_book() {
        let book = BookId::new(1);
        let catalog = InMemoryCatalog::new().with_book(book, 3).with_book(BookId::new(2), 3);

        let attempts = (0..10).map(|i| {
            let catalog = catalog.clone();
            tokio::spawn(async move {
                catalog
                    .apply_adjustment(StockAdjustment {
                        order_id: OrderId::generate(),
                        book_id: BookId::new(1 + i % 2),
                        delta: -1,
                    })
                    .await
            })
        });
        let results = futures::future::join_all(attempts).await;

        let applied = results.iter().filter(|r| matches!(r, Ok(Ok(_)))).count();
        assert_eq!(applied, 6);
        assert_eq!(catalog.stock_of(book), Some(0));
        assert_eq!(catalog.stock_of(BookId::new(2)), Some(0));
    }

    #[tokio::test]
    async fn reservations_sent_flag_is_stored() {
        let store = InMemoryOrderStore::new();
        let order = order();
        store.insert(order.clone()).await.unwrap();

        store.mark_reservations_sent(order.id).await.unwrap();

        assert!(store.order(order.id).unwrap().reservations_sent);
        let missing = store.mark_reservations_sent(OrderId::generate()).await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }
}
