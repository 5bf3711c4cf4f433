//! End-to-end scenarios against the in-memory seams.
//!
//! Each test starts a real [`Pipeline`] (both queue consumers and the shipping simulator)
//! and drives it through [`OrderService`](order_fulfillment::OrderService), waiting on
//! the background stages with `eventually`.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use fulfillment_core::dead_letter::DeadLetterReason;
use fulfillment_core::message::{INVENTORY_UPDATES_QUEUE, InventoryUpdateMessage, ORDERS_QUEUE};
use fulfillment_core::queue::MessageQueue;
use fulfillment_core::types::{BookId, LineItem, Order, OrderStatus, Requester, UserId};
use fulfillment_runtime::retry::RetryPolicy;
use fulfillment_testing::properties::line_items;
use fulfillment_testing::{
    InMemoryCatalog, InMemoryDeadLetters, InMemoryOrderStore, InMemoryQueue, RecordingNotifier, eventually,
    init_test_tracing, test_clock,
};
use order_fulfillment::shipping::ShippingDelays;
use order_fulfillment::{Pipeline, PipelineSettings, Seams};
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const BOOK_A: BookId = BookId::new(1);
const BOOK_B: BookId = BookId::new(2);
const BOOK_C: BookId = BookId::new(3);

const PARKED: ShippingDelays = ShippingDelays {
    ship_after: Duration::from_secs(3600),
    deliver_after: Duration::from_secs(3600),
};

const FAST: ShippingDelays = ShippingDelays {
    ship_after: Duration::from_millis(50),
    deliver_after: Duration::from_millis(50),
};

struct World {
    queue: Arc<InMemoryQueue>,
    store: Arc<InMemoryOrderStore>,
    catalog: Arc<InMemoryCatalog>,
    notifier: Arc<RecordingNotifier>,
    dead_letters: Arc<InMemoryDeadLetters>,
    seams: Seams,
    pipeline: Pipeline,
}

fn settings(shipping: ShippingDelays) -> PipelineSettings {
    PipelineSettings {
        retry: RetryPolicy::immediate(1),
        shipping,
        shutdown_timeout: Duration::from_secs(1),
        ..PipelineSettings::default()
    }
}

async fn start(catalog: InMemoryCatalog, shipping: ShippingDelays) -> World {
    init_test_tracing();
    let queue = Arc::new(InMemoryQueue::new());
    let store = Arc::new(InMemoryOrderStore::new());
    let catalog = Arc::new(catalog);
    let notifier = Arc::new(RecordingNotifier::new());
    let dead_letters = Arc::new(InMemoryDeadLetters::new());
    let seams = Seams {
        queue: queue.clone(),
        store: store.clone(),
        catalog: catalog.clone(),
        notifier: notifier.clone(),
        dead_letters: dead_letters.clone(),
        clock: Arc::new(test_clock()),
    };
    let pipeline = Pipeline::start(seams.clone(), settings(shipping)).await.unwrap();
    World {
        queue,
        store,
        catalog,
        notifier,
        dead_letters,
        seams,
        pipeline,
    }
}

impl World {
    async fn order(&self, user: i64, book_id: BookId, quantity: u32) -> Order {
        self.pipeline
            .service()
            .create_order(UserId::new(user), vec![LineItem::new(book_id, quantity)])
            .await
            .unwrap()
    }

    async fn reach(&self, order: &Order, status: OrderStatus) {
        eventually(|| self.store.status(order.id) == Some(status)).await;
    }

    async fn settle(&self) {
        eventually(|| self.queue.pending(ORDERS_QUEUE) == 0 && self.queue.pending(INVENTORY_UPDATES_QUEUE) == 0).await;
    }

    fn inventory_messages(&self) -> Vec<InventoryUpdateMessage> {
        self.queue
            .published(INVENTORY_UPDATES_QUEUE)
            .iter()
            .map(|e| e.open().unwrap())
            .collect()
    }
}

#[tokio::test]
async fn accepted_then_cancelled_order_returns_its_stock() {
    let world = start(InMemoryCatalog::new().with_book(BOOK_A, 5), PARKED).await;

    let order = world.order(1, BOOK_A, 3).await;
    world.reach(&order, OrderStatus::Processing).await;
    eventually(|| world.catalog.stock_of(BOOK_A) == Some(2)).await;

    let cancelled = world
        .pipeline
        .service()
        .cancel_order(order.id, &Requester::user(UserId::new(1)))
        .await
        .unwrap();

    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    eventually(|| world.catalog.stock_of(BOOK_A) == Some(5)).await;
    let deltas: Vec<i64> = world.inventory_messages().iter().map(|m| m.quantity_delta).collect();
    assert_eq!(deltas, vec![-3, 3]);

    world.pipeline.shutdown().await;
}

#[tokio::test]
async fn short_order_is_cancelled_without_touching_stock() {
    let world = start(InMemoryCatalog::new().with_book(BOOK_B, 1), PARKED).await;

    let order = world.order(1, BOOK_B, 2).await;
    world.reach(&order, OrderStatus::Cancelled).await;
    world.settle().await;

    assert!(world.inventory_messages().is_empty());
    assert_eq!(world.catalog.stock_of(BOOK_B), Some(1));
    let last = world.notifier.user_notifications().pop().unwrap();
    assert_eq!(last.status, OrderStatus::Cancelled);
    assert!(last.reason.is_some());

    world.pipeline.shutdown().await;
}

#[tokio::test]
async fn concurrent_orders_for_the_last_copy_have_one_winner() {
    let world = start(InMemoryCatalog::new().with_book(BOOK_C, 1), PARKED).await;

    let (first, second) = tokio::join!(world.order(1, BOOK_C, 1), world.order(2, BOOK_C, 1));
    world.settle().await;
    eventually(|| {
        let mut statuses = [world.store.status(first.id), world.store.status(second.id)];
        statuses.sort_by_key(|s| s.map(|s| s.as_str()));
        statuses == [Some(OrderStatus::Cancelled), Some(OrderStatus::Processing)]
    })
    .await;
    world.settle().await;

    assert_eq!(world.catalog.stock_of(BOOK_C), Some(0));
    // A loser accepted before the winner's reservation landed is flagged for reconciliation.
    assert!(
        world
            .dead_letters
            .entries()
            .iter()
            .all(|letter| letter.reason == DeadLetterReason::NeedsReconciliation)
    );

    world.pipeline.shutdown().await;
}

#[tokio::test]
async fn shipping_timer_after_cancel_is_a_no_op() {
    let world = start(InMemoryCatalog::new().with_book(BOOK_A, 5), FAST).await;

    let order = world.order(1, BOOK_A, 1).await;
    world.reach(&order, OrderStatus::Processing).await;
    world
        .pipeline
        .service()
        .cancel_order(order.id, &Requester::admin(UserId::new(42)))
        .await
        .unwrap();

    tokio::time::sleep(FAST.ship_after * 4).await;

    assert_eq!(world.store.status(order.id), Some(OrderStatus::Cancelled));
    assert_eq!(
        world.notifier.statuses_for(order.id),
        vec![OrderStatus::Pending, OrderStatus::Processing, OrderStatus::Cancelled]
    );
    eventually(|| world.pipeline.shipments_in_flight() == 0).await;

    world.pipeline.shutdown().await;
}

#[tokio::test]
async fn order_is_delivered_through_shipped() {
    let world = start(InMemoryCatalog::new().with_book(BOOK_A, 5), FAST).await;

    let order = world.order(7, BOOK_A, 2).await;
    world.reach(&order, OrderStatus::Delivered).await;

    assert_eq!(
        world.store.history(order.id),
        vec![
            (OrderStatus::Pending, OrderStatus::Processing),
            (OrderStatus::Processing, OrderStatus::Shipped),
            (OrderStatus::Shipped, OrderStatus::Delivered),
        ]
    );
    assert_eq!(
        world.notifier.statuses_for(order.id),
        vec![
            OrderStatus::Pending,
            OrderStatus::Processing,
            OrderStatus::Shipped,
            OrderStatus::Delivered
        ]
    );
    assert_eq!(world.catalog.stock_of(BOOK_A), Some(3));

    world.pipeline.shutdown().await;
}

#[tokio::test]
async fn redelivered_order_message_is_processed_once() {
    let world = start(InMemoryCatalog::new().with_book(BOOK_A, 5), PARKED).await;

    let order = world.order(1, BOOK_A, 2).await;
    world.reach(&order, OrderStatus::Processing).await;
    let envelope = world.queue.published(ORDERS_QUEUE)[0].clone();
    world.queue.publish(ORDERS_QUEUE, &envelope).await.unwrap();
    world.settle().await;

    assert_eq!(world.queue.acked(ORDERS_QUEUE).len(), 2);
    assert_eq!(world.inventory_messages().len(), 1);
    assert_eq!(world.store.history(order.id).len(), 1);
    assert_eq!(world.catalog.stock_of(BOOK_A), Some(3));

    world.pipeline.shutdown().await;
}

#[tokio::test]
async fn cancelling_before_processing_sends_no_restock() {
    let world = start(InMemoryCatalog::new().with_book(BOOK_A, 5), PARKED).await;
    // The order message never reaches the processor, so the order stays PENDING.
    world.queue.fail_next_publishes(ORDERS_QUEUE, 2);

    let order = world.order(1, BOOK_A, 2).await;
    assert_eq!(world.dead_letters.entries()[0].reason, DeadLetterReason::PublishFailed);
    world
        .pipeline
        .service()
        .cancel_order(order.id, &Requester::user(UserId::new(1)))
        .await
        .unwrap();
    world.settle().await;

    assert!(world.inventory_messages().is_empty());
    assert_eq!(world.catalog.stock_of(BOOK_A), Some(5));

    world.pipeline.shutdown().await;
}

#[tokio::test]
async fn restart_resumes_shipments() {
    let world = start(InMemoryCatalog::new().with_book(BOOK_A, 5), PARKED).await;
    let order = world.order(1, BOOK_A, 1).await;
    world.reach(&order, OrderStatus::Processing).await;
    world.settle().await;

    let World {
        queue,
        store,
        catalog,
        seams,
        pipeline,
        ..
    } = world;
    pipeline.shutdown().await;
    assert_eq!(store.status(order.id), Some(OrderStatus::Processing));

    let restarted = Pipeline::start(seams, settings(FAST)).await.unwrap();
    eventually(|| store.status(order.id) == Some(OrderStatus::Delivered)).await;
    // The reservation went out before the restart, so resuming only restarts shipping.
    assert_eq!(queue.published(INVENTORY_UPDATES_QUEUE).len(), 1);
    assert_eq!(catalog.stock_of(BOOK_A), Some(4));

    restarted.shutdown().await;
}

#[tokio::test]
async fn back_in_stock_is_announced() {
    let world = start(InMemoryCatalog::new().with_book(BOOK_A, 2), PARKED).await;

    let order = world.order(1, BOOK_A, 2).await;
    world.reach(&order, OrderStatus::Processing).await;
    eventually(|| world.catalog.stock_of(BOOK_A) == Some(0)).await;
    world
        .pipeline
        .service()
        .cancel_order(order.id, &Requester::user(UserId::new(1)))
        .await
        .unwrap();

    eventually(|| world.notifier.global_messages() == vec![format!("Book {BOOK_A} is back in stock")]).await;

    world.pipeline.shutdown().await;
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn stock_matches_accepted_orders(orders in prop::collection::vec(line_items(3), 1..6)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let catalog = (1..=5).fold(InMemoryCatalog::new(), |c, id| c.with_book(BookId::new(id), 3));
            let world = start(catalog, PARKED).await;

            let mut created = Vec::new();
            for (user, items) in (1..).zip(orders) {
                let order = world
                    .pipeline
                    .service()
                    .create_order(UserId::new(user), items)
                    .await
                    .unwrap();
                created.push(order);
            }

            eventually(|| created.iter().all(|o| world.store.status(o.id) != Some(OrderStatus::Pending))).await;
            world.settle().await;

            let mut reserved: HashMap<BookId, u32> = HashMap::new();
            for order in &created {
                if world.store.status(order.id) == Some(OrderStatus::Processing) {
                    for item in &order.items {
                        *reserved.entry(item.book_id).or_default() += item.quantity;
                    }
                }
            }
            for id in 1..=5 {
                let book = BookId::new(id);
                let taken = reserved.get(&book).copied().unwrap_or(0);
                assert!(taken <= 3, "book {book} oversold: {taken}");
                assert_eq!(world.catalog.stock_of(book), Some(3 - taken));
            }

            world.pipeline.shutdown().await;
        });
    }
}
