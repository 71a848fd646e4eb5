//! Integration tests for [`RedpandaTransport`] with a real Kafka instance.
//!
//! These tests use testcontainers to spin up Kafka and validate:
//! - Publish/poll round-trip with manual commit
//! - Latest subscriptions read records published right after they return
//! - Topic creation and metadata lookup
//! - A full request/reply exchange through the bridge
//!
//! # Running These Tests
//!
//! These tests are marked as `#[ignore]` by default because they:
//! - Require Docker to be running (for testcontainers)
//! - Take 15-60 seconds per test to spin up Kafka
//!
//! To run explicitly:
//! ```bash
//! cargo test -p entity-bridge-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]

use entity_bridge_core::{
    BridgeConfig, Entity, LogTransport, StartOffset, Subscription, TopicAdmin, TopicSettings,
    TransportError,
};
use entity_bridge_redpanda::RedpandaTransport;
use entity_bridge_runtime::Bridge;
use entity_bridge_testing::InMemoryEntityStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Order {
    id: u64,
    amount: i64,
}

impl Entity for Order {
    type Id = u64;
    const MODEL_TYPE: &'static str = "Order";

    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn merge_from(&mut self, incoming: Self) {
        self.amount = incoming.amount;
    }
}

/// Helper to wait for Kafka to accept publishes
async fn wait_for_kafka_ready(brokers: &str) -> RedpandaTransport {
    let max_attempts = 60;
    for attempt in 1..=max_attempts {
        if let Ok(transport) = RedpandaTransport::new(brokers) {
            if transport.publish("warmup-topic", "warmup", b"{}").await.is_ok() {
                tokio::time::sleep(Duration::from_millis(500)).await;
                return transport;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(
            attempt != max_attempts,
            "Kafka failed to become ready after {max_attempts} attempts"
        );
    }
    unreachable!("loop either returns or panics")
}

async fn start_kafka() -> (testcontainers::ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get Kafka port");
    (kafka, format!("127.0.0.1:{port}"))
}

#[tokio::test]
#[ignore]
async fn test_publish_poll_and_commit_round_trip() {
    let (_kafka, brokers) = start_kafka().await;
    let transport = wait_for_kafka_ready(&brokers).await;

    let topic = "order-payment-order";
    transport
        .create_topic(topic, &TopicSettings::default())
        .await
        .expect("Failed to create topic");
    transport
        .publish(topic, "c1", br#"{"eventType":"GET_ALL"}"#)
        .await
        .expect("Failed to publish");

    let mut consumer = transport
        .subscribe(Subscription::new(topic, "round-trip", StartOffset::Earliest))
        .await
        .expect("Failed to subscribe");

    let mut received = None;
    for _ in 0..30 {
        if let Some(record) = consumer.poll(Duration::from_secs(1)).await.expect("poll") {
            received = Some(record);
            break;
        }
    }

    let record = received.expect("No record received");
    assert_eq!(record.topic, topic);
    assert_eq!(record.key.as_deref(), Some("c1"));
    assert_eq!(record.body(), br#"{"eventType":"GET_ALL"}"#);
    consumer.commit(&record).expect("Failed to commit");
}

#[tokio::test]
#[ignore]
async fn test_latest_subscription_reads_record_published_right_after() {
    let (_kafka, brokers) = start_kafka().await;
    let transport = wait_for_kafka_ready(&brokers).await;

    let topic = "payment-order-order";
    transport
        .create_topic(topic, &TopicSettings::default())
        .await
        .expect("Failed to create topic");
    transport
        .publish(topic, "before", b"{}")
        .await
        .expect("Failed to publish");

    // A fresh group and no poll in between: nothing has joined a group yet.
    let mut consumer = transport
        .subscribe(Subscription::new(topic, "order-responses-fresh", StartOffset::Latest))
        .await
        .expect("Failed to subscribe");
    transport
        .publish(topic, "after", b"{}")
        .await
        .expect("Failed to publish");

    let mut received = None;
    for _ in 0..10 {
        if let Some(record) = consumer.poll(Duration::from_secs(1)).await.expect("poll") {
            received = Some(record);
            break;
        }
    }

    let record = received.expect("Record published after subscribe was skipped");
    assert_eq!(record.key.as_deref(), Some("after"));
}

#[tokio::test]
#[ignore]
async fn test_topic_creation_is_visible_in_metadata() {
    let (_kafka, brokers) = start_kafka().await;
    let transport = wait_for_kafka_ready(&brokers).await;

    let topic = "invoice-dead-letter";
    assert!(!transport.topic_exists(topic).await.expect("metadata"));

    transport
        .create_topic(topic, &TopicSettings::default())
        .await
        .expect("Failed to create topic");

    let mut visible = false;
    for _ in 0..20 {
        if transport.topic_exists(topic).await.expect("metadata") {
            visible = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    assert!(visible, "Created topic never appeared in metadata");

    let again = transport.create_topic(topic, &TopicSettings::default()).await;
    assert_eq!(again, Err(TransportError::TopicAlreadyExists(topic.to_string())));
}

#[tokio::test]
#[ignore]
async fn test_bridge_request_reply_over_kafka() {
    let (_kafka, brokers) = start_kafka().await;
    let transport = Arc::new(wait_for_kafka_ready(&brokers).await);

    // Payment serves orders to the order service.
    let next = AtomicU64::new(42);
    let store = InMemoryEntityStore::<Order>::new()
        .with_id_allocator(move || next.fetch_add(1, Ordering::SeqCst));
    let payment = Bridge::builder(
        BridgeConfig::new(&brokers, "payment").with_source_services(["order"]),
        transport.clone(),
        transport.clone(),
    )
    .build();
    payment.serve::<Order>(Arc::new(store.clone()));

    let order = Bridge::builder(
        BridgeConfig::new(&brokers, "order").with_request_timeout(Duration::from_secs(15)),
        transport.clone(),
        transport,
    )
    .build();
    let orders = order.client::<Order>("payment");

    // The very first request starts the response listener; its reply must not
    // be lost while the listener is still joining.
    let created = orders
        .create(Order { id: 0, amount: 100 })
        .await
        .expect("create failed");
    assert_eq!(created, Order { id: 42, amount: 100 });

    let found = orders.get_by_id(42).await.expect("get_by_id failed");
    assert_eq!(found, Some(created));

    order.shutdown().await;
    payment.shutdown().await;
}
