//! Integration tests for [`RedpandaQueue`] against a real Kafka-compatible broker.
//!
//! These tests use testcontainers to start Kafka and validate:
//! - Publish/subscribe round-trip
//! - Nack redelivers with a bumped attempt counter
//! - Unsettled deliveries are redelivered to the next subscription
//! - Acked deliveries are not redelivered
//!
//! # Running These Tests
//!
//! Marked `#[ignore]` because they need Docker and take 15-60 seconds each:
//!
//! ```bash
//! cargo test -p fulfillment-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use chrono::Utc;
use fulfillment_core::message::{Envelope, OrderMessage};
use fulfillment_core::queue::{DeliveryStream, MessageQueue};
use fulfillment_core::types::{BookId, LineItem, OrderId, UserId};
use fulfillment_redpanda::RedpandaQueue;
use futures::StreamExt;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    (kafka, format!("{host}:{port}"))
}

fn queue(brokers: &str, group: &str) -> RedpandaQueue {
    RedpandaQueue::builder()
        .brokers(brokers)
        .consumer_group(group)
        .auto_offset_reset("earliest")
        .build()
        .expect("Failed to create queue")
}

fn order_envelope() -> (OrderId, Envelope) {
    let order_id = OrderId::generate();
    let message = OrderMessage::new(order_id, UserId::new(7), vec![LineItem::new(BookId::new(1), 1)]);
    (order_id, Envelope::wrap(&message, Utc::now()).expect("wrap"))
}

/// Publish a warmup message so the topic is auto-created before anyone subscribes.
async fn ensure_topic_exists(queue: &RedpandaQueue, topic: &str) {
    let (_, warmup) = order_envelope();
    for attempt in 1..=60 {
        if queue.publish(topic, &warmup).await.is_ok() && queue.buffered().await == 0 {
            tokio::time::sleep(Duration::from_secs(3)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(attempt != 60, "Failed to create topic {topic}");
    }
}

/// Next delivery whose correlation id matches, acking warmup traffic on the way.
async fn next_for(stream: &mut DeliveryStream, correlation_id: &str) -> fulfillment_core::queue::Delivery {
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let delivery = stream
                .next()
                .await
                .expect("stream ended")
                .expect("delivery error");
            if delivery.envelope().correlation_id == correlation_id {
                return delivery;
            }
            delivery.ack().await.expect("ack warmup");
        }
    })
    .await
    .expect("Timeout waiting for delivery")
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn published_envelopes_are_delivered() {
    let (_kafka, brokers) = start_kafka().await;
    let queue = queue(&brokers, "round-trip");
    ensure_topic_exists(&queue, "orders").await;

    let mut stream = queue.subscribe("orders").await.expect("subscribe");
    let (order_id, envelope) = order_envelope();
    queue.publish("orders", &envelope).await.expect("publish");

    let delivery = next_for(&mut stream, &order_id.to_string()).await;
    assert_eq!(delivery.envelope(), &envelope);
    let opened: OrderMessage = delivery.envelope().open().expect("open");
    assert_eq!(opened.order_id, order_id);
    delivery.ack().await.expect("ack");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn nack_redelivers_with_next_attempt() {
    let (_kafka, brokers) = start_kafka().await;
    let queue = queue(&brokers, "nack");
    ensure_topic_exists(&queue, "orders").await;

    let mut stream = queue.subscribe("orders").await.expect("subscribe");
    let (order_id, envelope) = order_envelope();
    queue.publish("orders", &envelope).await.expect("publish");

    let first = next_for(&mut stream, &order_id.to_string()).await;
    assert_eq!(first.envelope().attempt, 0);
    first.nack().await.expect("nack");

    let second = next_for(&mut stream, &order_id.to_string()).await;
    assert_eq!(second.envelope().attempt, 1);
    second.ack().await.expect("ack");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn unsettled_delivery_is_redelivered_to_next_subscription() {
    let (_kafka, brokers) = start_kafka().await;
    let queue = queue(&brokers, "crash");
    ensure_topic_exists(&queue, "orders").await;

    let (order_id, envelope) = order_envelope();
    {
        let mut stream = queue.subscribe("orders").await.expect("subscribe");
        queue.publish("orders", &envelope).await.expect("publish");
        let delivery = next_for(&mut stream, &order_id.to_string()).await;
        // Consumer "crashes": the delivery and the stream are dropped unsettled.
        drop(delivery);
    }
    tokio::time::sleep(Duration::from_secs(7)).await;

    let mut stream = queue.subscribe("orders").await.expect("resubscribe");
    let again = next_for(&mut stream, &order_id.to_string()).await;
    assert_eq!(again.envelope(), &envelope);
    again.ack().await.expect("ack");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn acked_delivery_is_not_redelivered() {
    let (_kafka, brokers) = start_kafka().await;
    let queue = queue(&brokers, "acked");
    ensure_topic_exists(&queue, "inventory_updates").await;

    let (first_id, first) = order_envelope();
    let (second_id, second) = order_envelope();
    {
        let mut stream = queue.subscribe("inventory_updates").await.expect("subscribe");
        queue.publish("inventory_updates", &first).await.expect("publish");
        next_for(&mut stream, &first_id.to_string())
            .await
            .ack()
            .await
            .expect("ack");
    }
    tokio::time::sleep(Duration::from_secs(7)).await;

    queue.publish("inventory_updates", &second).await.expect("publish");
    let mut stream = queue.subscribe("inventory_updates").await.expect("resubscribe");
    let first_id = first_id.to_string();
    let second_id = second_id.to_string();
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let delivery = stream.next().await.expect("stream ended").expect("delivery error");
            let correlation_id = delivery.envelope().correlation_id.clone();
            assert_ne!(correlation_id, first_id, "acked message was redelivered");
            delivery.ack().await.expect("ack");
            if correlation_id == second_id {
                break;
            }
        }
    })
    .await
    .expect("Timeout waiting for delivery");
}
