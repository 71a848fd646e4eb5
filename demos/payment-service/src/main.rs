//! Payment Service - Entity Bridge Example
//!
//! Serves `Order` commands published by the configured source services and
//! answers them on the matching response topics.
//!
//! # Running the Example
//!
//! ```bash
//! KAFKA_BOOTSTRAP_SERVERS=localhost:9092 \
//! KAFKA_CURRENT_SERVICE=payment \
//! KAFKA_SOURCE_SERVICES=order,utility \
//! METRICS_ADDR=0.0.0.0:9000 \
//! cargo run -p payment-service
//! ```
//!
//! With `KAFKA_SOURCE_SERVICES=order` this consumes `order-payment-order` and
//! replies on `payment-order-order`.

#![allow(missing_docs)]

mod store;

use entity_bridge_core::{BridgeConfig, Entity};
use entity_bridge_redpanda::RedpandaTransport;
use entity_bridge_runtime::Bridge;
use entity_bridge_runtime::metrics::MetricsServer;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use store::OrderStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Order {
    #[serde(default)]
    id: u64,
    customer_id: String,
    amount_cents: i64,
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize tracing subscriber
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Load configuration
    let config = BridgeConfig::from_env()?;
    tracing::info!(
        service = %config.service_name,
        brokers = %config.brokers,
        sources = ?config.source_services,
        "Starting payment service"
    );

    // 3. Optional Prometheus exporter
    if let Ok(addr) = std::env::var("METRICS_ADDR") {
        let mut server = MetricsServer::new(addr.parse()?);
        server.start()?;
    }

    // 4. Wire the bridge
    let transport = Arc::new(RedpandaTransport::builder().brokers(&config.brokers).build()?);
    let bridge = Bridge::builder(config, transport.clone(), transport).build();

    let store = OrderStore::default();
    for binding in bridge.serve::<Order>(Arc::new(store.clone())) {
        tracing::info!(
            command_topic = %binding.command_topic,
            response_topic = %binding.response_topic,
            consumer_group = %binding.group_id,
            "Serving orders"
        );
    }

    // 5. Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, stopping...");

    bridge.shutdown().await;
    tracing::info!(orders = store.len(), "Clean shutdown complete");

    Ok(())
}
