//! End-to-end request/reply between two bridges sharing an in-memory log.
//!
//! The "order" service calls the "payment" service, which owns `Order` records:
//! commands travel on `order-payment-order` and replies on `payment-order-order`.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use entity_bridge_core::{BridgeConfig, Entity, Envelope, EventType, LogTransport};
use entity_bridge_runtime::{Bridge, Command, LoopState, RemoteFailure, RequestError, RequestOptions, RetryPolicy};
use entity_bridge_testing::{InMemoryEntityStore, InMemoryLog, test_clock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

// ============================================================================
// Test Fixtures
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Order {
    #[serde(default)]
    id: u64,
    customer: String,
    amount: i64,
    #[serde(default)]
    status: String,
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
        *self = Self {
            id: self.id,
            ..incoming
        };
    }
}

fn order(id: u64, customer: &str, amount: i64) -> Order {
    Order {
        id,
        customer: customer.to_string(),
        amount,
        status: String::new(),
    }
}

fn quick_retry() -> RetryPolicy {
    RetryPolicy::builder()
        .max_retries(3)
        .initial_delay(Duration::from_millis(5))
        .max_delay(Duration::from_millis(20))
        .build()
}

fn bridge(log: &InMemoryLog, service: &str, sources: &[&str]) -> Bridge {
    bridge_with_retry(log, service, sources, quick_retry())
}

fn bridge_with_retry(log: &InMemoryLog, service: &str, sources: &[&str], retry: RetryPolicy) -> Bridge {
    let config = BridgeConfig::new("in-memory", service)
        .with_source_services(sources.iter().copied())
        .with_poll_timeout(Duration::from_millis(50))
        .with_request_timeout(Duration::from_secs(5));
    let log = Arc::new(log.clone());
    Bridge::builder(config, log.clone(), log)
        .clock(Arc::new(test_clock()))
        .retry_policy(retry)
        .build()
}

struct Fixture {
    log: InMemoryLog,
    store: InMemoryEntityStore<Order>,
    payment: Bridge,
    order: Bridge,
}

impl Fixture {
    fn new() -> Self {
        let log = InMemoryLog::new();
        let next = AtomicU64::new(42);
        let store = InMemoryEntityStore::<Order>::new()
            .with_id_allocator(move || next.fetch_add(1, Ordering::SeqCst));

        let payment = bridge(&log, "payment", &["order"]);
        payment.serve::<Order>(Arc::new(store.clone()));
        let order = bridge(&log, "order", &[]);

        Self {
            log,
            store,
            payment,
            order,
        }
    }

    async fn shutdown(self) {
        self.order.shutdown().await;
        self.payment.shutdown().await;
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met in time");
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn create_round_trip_assigns_id() {
    let fixture = Fixture::new();
    let orders = fixture.order.client::<Order>("payment");

    let created = orders.create(order(0, "alice", 100)).await.unwrap();

    assert_eq!(created, order(42, "alice", 100));
    assert_eq!(fixture.store.get(&42), Some(order(42, "alice", 100)));

    let replies = fixture.log.json_records("payment-order-order");
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0]["eventType"], "CREATED_RESPONSE");
    assert_eq!(replies[0]["modelType"], "Order");
    assert_eq!(replies[0]["payload"]["id"], 42);

    let commands = fixture.log.json_records("order-payment-order");
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0]["eventType"], "CREATE");
    assert_eq!(commands[0]["correlationId"], replies[0]["correlationId"]);

    fixture.shutdown().await;
}

#[tokio::test]
async fn concurrent_requests_each_get_their_own_reply() {
    let fixture = Fixture::new();
    let orders = fixture.order.client::<Order>("payment");

    let calls = (1..=10).map(|amount| {
        let orders = orders.clone();
        async move { orders.create(order(0, "bulk", amount)).await }
    });
    let results = futures::future::join_all(calls).await;

    for (amount, result) in (1..=10).zip(results) {
        assert_eq!(result.unwrap().amount, amount);
    }
    assert_eq!(fixture.store.len(), 10);
    assert_eq!(fixture.order.correlator().pending(), 0);

    fixture.shutdown().await;
}

#[tokio::test]
async fn update_merges_into_existing_record() {
    let fixture = Fixture::new();
    fixture.store.insert(Order {
        status: "new".to_string(),
        ..order(7, "alice", 100)
    });
    let orders = fixture.order.client::<Order>("payment");

    // Every field but the id comes from the payload, empty ones included.
    let payload = order(7, "mallory", 250);
    let updated = orders.update(payload.clone()).await.unwrap();

    assert_eq!(updated, payload);
    assert_eq!(fixture.store.get(&7), Some(payload));

    fixture.shutdown().await;
}

#[tokio::test]
async fn missing_records_are_reported() {
    let fixture = Fixture::new();
    let orders = fixture.order.client::<Order>("payment");

    let not_found = RequestError::Remote(RemoteFailure("Entity with ID 99 not found.".to_string()));
    assert_eq!(orders.update(order(99, "bob", 1)).await, Err(not_found.clone()));
    assert_eq!(orders.delete(99).await, Err(not_found));
    assert_eq!(orders.get_by_id(99).await, Ok(None));

    fixture.shutdown().await;
}

#[tokio::test]
async fn delete_and_queries_see_committed_state() {
    let fixture = Fixture::new();
    fixture.store.insert(order(1, "alice", 10));
    fixture.store.insert(order(2, "bob", 20));
    let orders = fixture.order.client::<Order>("payment");

    assert_eq!(orders.get_all().await.unwrap().len(), 2);
    assert_eq!(orders.delete(1).await, Ok(1));
    assert_eq!(orders.get_all().await.unwrap(), vec![order(2, "bob", 20)]);
    assert_eq!(orders.get_by_id(2).await, Ok(Some(order(2, "bob", 20))));

    fixture.shutdown().await;
}

#[tokio::test]
async fn store_failures_come_back_as_remote_errors() {
    let fixture = Fixture::new();
    let orders = fixture.order.client::<Order>("payment");

    fixture.store.fail_next_commits(1);
    let error = orders.create(order(0, "alice", 5)).await.unwrap_err();

    let message = error.remote_message().expect("remote failure");
    assert!(message.starts_with("Error creating entity: "), "{message}");
    assert!(fixture.store.is_empty());

    fixture.shutdown().await;
}

#[tokio::test]
async fn replies_only_resolve_waiters_of_their_own_topic() {
    let fixture = Fixture::new();
    let correlator = fixture.order.correlator();

    let orders = correlator.register("payment-order-order", "c1").await.unwrap();
    // The same id on another response topic is a different waiter.
    let invoices = correlator.register("billing-order-invoice", "c1").await.unwrap();
    assert_eq!(correlator.pending(), 2);

    let reply = Envelope::new(
        EventType::GetAllResponse,
        "Invoice",
        json!(["wrong"]),
        "c1",
        chrono::Utc::now(),
    );
    fixture
        .log
        .publish("billing-order-invoice", "c1", &reply.to_bytes().unwrap())
        .await
        .unwrap();

    let invoice_reply = invoices.wait(Duration::from_secs(1)).await.unwrap();
    assert_eq!(invoice_reply.payload, json!(["wrong"]));
    let order_reply = orders.wait(Duration::from_millis(100)).await;
    assert!(matches!(order_reply, Err(RequestError::Timeout { .. })));
    assert_eq!(correlator.pending(), 0);

    fixture.shutdown().await;
}

#[tokio::test]
async fn slow_listener_start_counts_against_timeout_and_blocks_no_other_topic() {
    let log = InMemoryLog::new();
    let payment = bridge(&log, "payment", &["order"]);
    payment.serve::<Order>(Arc::new(InMemoryEntityStore::<Order>::new()));
    eventually(|| {
        payment
            .processor_states()
            .iter()
            .all(|(_, state)| *state != LoopState::Starting)
    })
    .await;

    let slow_retry = RetryPolicy::builder()
        .max_retries(3)
        .initial_delay(Duration::from_millis(1500))
        .max_delay(Duration::from_millis(1500))
        .build();
    let order = bridge_with_retry(&log, "order", &[], slow_retry);
    let billing = order.client::<Order>("billing");
    let orders = order.client::<Order>("payment");

    // The billing listener's first subscription fails and backs off.
    log.fail_next_subscriptions(1);
    let options = RequestOptions::default()
        .correlation_id("slow-1")
        .timeout(Duration::from_millis(300));
    let stuck = billing.request(Command::GetAll, options);
    let other = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::time::timeout(Duration::from_secs(1), orders.get_all()).await
    };

    let started = std::time::Instant::now();
    let (stuck, other) = tokio::join!(stuck, other);

    assert_eq!(
        stuck.unwrap_err(),
        RequestError::Timeout {
            correlation_id: "slow-1".to_string(),
            timeout: Duration::from_millis(300),
        }
    );
    assert!(started.elapsed() < Duration::from_secs(1), "{:?}", started.elapsed());
    let other = other.expect("payment request waited on the billing listener");
    assert_eq!(other, Ok(Vec::new()));
    assert_eq!(order.correlator().pending(), 0);

    order.shutdown().await;
    payment.shutdown().await;
}

#[tokio::test]
async fn timeout_then_late_reply_is_discarded() {
    let fixture = Fixture::new();
    // Nobody serves "billing", so the command is never answered.
    let billing = fixture.order.client::<Order>("billing");

    let options = RequestOptions::default()
        .correlation_id("late-1")
        .timeout(Duration::from_millis(100));
    let result = billing.request(Command::GetAll, options).await;
    assert_eq!(
        result.unwrap_err(),
        RequestError::Timeout {
            correlation_id: "late-1".to_string(),
            timeout: Duration::from_millis(100),
        }
    );
    assert_eq!(fixture.order.correlator().pending(), 0);

    let late = Envelope::new(
        EventType::GetAllResponse,
        "Order",
        json!([]),
        "late-1",
        chrono::Utc::now(),
    );
    fixture
        .log
        .publish("billing-order-order", "late-1", &late.to_bytes().unwrap())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The stale reply was consumed and dropped; a new waiter does not see it.
    let options = RequestOptions::default()
        .correlation_id("late-1")
        .timeout(Duration::from_millis(100));
    let again = billing.request(Command::GetAll, options).await;
    assert!(matches!(again, Err(RequestError::Timeout { .. })));

    fixture.shutdown().await;
}

#[tokio::test]
async fn failed_reply_publish_is_dead_lettered_once() {
    let fixture = Fixture::new();
    let orders = fixture.order.client::<Order>("payment");

    // Warm up so both loops are running before injecting the fault.
    orders.get_all().await.unwrap();
    fixture.log.fail_publishes_to("payment-order-order", 1);

    let options = RequestOptions::default()
        .correlation_id("poison-1")
        .timeout(Duration::from_millis(300));
    let lost = orders
        .request(Command::Create(order(0, "carol", 30)), options)
        .await;
    assert!(matches!(lost, Err(RequestError::Timeout { .. })));

    let log = fixture.log.clone();
    eventually(|| log.records("order-dlq").len() == 1).await;
    let dead = &fixture.log.json_records("order-dlq")[0];
    let error = dead["error"].as_str().unwrap();
    assert!(error.starts_with("Process error: "), "{error}");
    assert!(dead["originalMessage"].as_str().unwrap().contains("poison-1"));

    // The loop keeps going after the poison message.
    let created = orders.create(order(0, "dave", 40)).await.unwrap();
    assert_eq!(created.customer, "dave");
    assert_eq!(fixture.log.records("order-dlq").len(), 1);

    fixture.shutdown().await;
}

#[tokio::test]
async fn requests_fail_after_shutdown() {
    let fixture = Fixture::new();
    let orders = fixture.order.client::<Order>("payment");
    orders.get_all().await.unwrap();

    fixture.order.shutdown().await;
    assert_eq!(orders.get_all().await, Err(RequestError::Shutdown));
    assert_eq!(
        fixture.order.correlator().listener_state("payment-order-order"),
        None
    );

    fixture.payment.shutdown().await;
}

#[tokio::test]
async fn bridge_reports_processor_states() {
    let fixture = Fixture::new();

    let states = fixture.payment.processor_states();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].0, "order-payment-order");
    assert!(!states[0].1.is_terminal());

    // Listener is started lazily on the first request.
    let orders = fixture.order.client::<Order>("payment");
    orders.get_all().await.unwrap();
    let listener = fixture
        .order
        .correlator()
        .listener_state("payment-order-order")
        .unwrap();
    assert!(matches!(
        listener,
        LoopState::Subscribed | LoopState::Idle | LoopState::Processing
    ));

    fixture.payment.shutdown().await;
    assert!(fixture.payment.processor_states().is_empty());
    fixture.order.shutdown().await;
}
