//! Kafka-protocol transport for the entity bridge.
//!
//! This crate provides [`RedpandaTransport`], which implements the
//! [`LogTransport`] and [`TopicAdmin`] traits from `entity-bridge-core` on top
//! of rdkafka.
//!
//! # Why Redpanda?
//!
//! - **Kafka-compatible**: Uses standard Kafka protocol, works with any Kafka-compatible system
//! - **Vendor swappable**: Can use Redpanda, Apache Kafka, AWS MSK, Azure Event Hubs, etc.
//! - **Simpler operations**: Redpanda is easier to deploy and operate than Kafka
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - Consumers are created with `enable.auto.commit=false`
//! - The read loop commits a record only after it has been handled
//! - If the process crashes before commit, the record is redelivered
//! - Ordering is guaranteed within a partition (records share a partition by key)
//!
//! `Earliest` subscriptions join their consumer group and resume from its
//! committed offsets. `Latest` subscriptions are assigned every partition at
//! its high watermark before [`subscribe`](LogTransport::subscribe) returns, so
//! a record published after that is never skipped.
//!
//! # Producer defaults
//!
//! | Setting | Default |
//! |---|---|
//! | `acks` | `all` |
//! | `compression.type` | `gzip` |
//! | `linger.ms` | 5 |
//! | `batch.size` | 16384 |
//! | `message.timeout.ms` | 30000 |
//! | `retry.backoff.ms` | 100 |
//!
//! # Example
//!
//! ```no_run
//! use entity_bridge_core::{LogTransport, StartOffset, Subscription};
//! use entity_bridge_redpanda::RedpandaTransport;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = RedpandaTransport::new("localhost:9092")?;
//!
//! transport.publish("order-payment-order", "c1", br#"{"eventType":"GET_ALL"}"#).await?;
//!
//! let mut consumer = transport
//!     .subscribe(Subscription::new("order-payment-order", "payment-group", StartOffset::Earliest))
//!     .await?;
//! if let Some(record) = consumer.poll(Duration::from_secs(1)).await? {
//!     consumer.commit(&record)?;
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use entity_bridge_core::{
    BoxFuture, LogConsumer, LogRecord, LogTransport, StartOffset, Subscription, TopicAdmin,
    TopicSettings, TransportError,
};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::metadata::MetadataPartition;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::time::Duration;

/// Kafka-protocol [`LogTransport`] and [`TopicAdmin`].
///
/// One producer and one admin client are shared by every publish; each
/// subscription gets its own consumer.
///
/// # Example
///
/// ```no_run
/// use entity_bridge_redpanda::RedpandaTransport;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = RedpandaTransport::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")
///     .compression("lz4")
///     .timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaTransport {
    producer: FutureProducer,
    admin: AdminClient<DefaultClientContext>,
    brokers: String,
    timeout: Duration,
    metadata_timeout: Duration,
    admin_timeout: Duration,
    session_timeout: Duration,
}

impl RedpandaTransport {
    /// Create a transport with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionFailed`] if the clients cannot be created.
    pub fn new(brokers: &str) -> Result<Self, TransportError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the transport.
    #[must_use]
    pub fn builder() -> RedpandaTransportBuilder {
        RedpandaTransportBuilder::default()
    }

    /// Get a reference to the brokers string.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }
}

/// Builder for configuring a [`RedpandaTransport`].
#[derive(Default)]
pub struct RedpandaTransportBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    linger: Option<Duration>,
    batch_size: Option<usize>,
    retry_backoff: Option<Duration>,
    timeout: Option<Duration>,
    session_timeout: Option<Duration>,
    metadata_timeout: Option<Duration>,
    admin_timeout: Option<Duration>,
}

impl RedpandaTransportBuilder {
    /// Set the broker addresses.
    ///
    /// # Parameters
    ///
    /// - `brokers`: Comma-separated list of broker addresses (e.g., "localhost:9092")
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer acknowledgment mode: "0", "1" or "all".
    ///
    /// Default: "all"
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: "none", "gzip", "snappy", "lz4", "zstd".
    ///
    /// Default: "gzip"
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set how long the producer waits to fill a batch.
    ///
    /// Default: 5 ms
    #[must_use]
    pub const fn linger(mut self, linger: Duration) -> Self {
        self.linger = Some(linger);
        self
    }

    /// Set the maximum batch size in bytes.
    ///
    /// Default: 16384
    #[must_use]
    pub const fn batch_size(mut self, bytes: usize) -> Self {
        self.batch_size = Some(bytes);
        self
    }

    /// Set the backoff between producer retries.
    ///
    /// Default: 100 ms
    #[must_use]
    pub const fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = Some(backoff);
        self
    }

    /// Set the delivery timeout of a publish.
    ///
    /// Default: 30 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the consumer group session timeout.
    ///
    /// Default: 6 seconds
    #[must_use]
    pub const fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Set the timeout of metadata lookups.
    ///
    /// Default: 10 seconds
    #[must_use]
    pub const fn metadata_timeout(mut self, timeout: Duration) -> Self {
        self.metadata_timeout = Some(timeout);
        self
    }

    /// Set the request and operation timeout of topic creation.
    ///
    /// Default: 30 seconds
    #[must_use]
    pub const fn admin_timeout(mut self, timeout: Duration) -> Self {
        self.admin_timeout = Some(timeout);
        self
    }

    /// Build the [`RedpandaTransport`].
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionFailed`] if:
    /// - Brokers not set
    /// - Cannot create producer or admin client
    /// - Invalid configuration
    pub fn build(self) -> Result<RedpandaTransport, TransportError> {
        let brokers = self
            .brokers
            .ok_or_else(|| TransportError::ConnectionFailed("Brokers not configured".to_string()))?;

        let timeout = self.timeout.unwrap_or(Duration::from_secs(30));
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("gzip");
        let linger = self.linger.unwrap_or(Duration::from_millis(5));
        let batch_size = self.batch_size.unwrap_or(16_384);
        let retry_backoff = self.retry_backoff.unwrap_or(Duration::from_millis(100));

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("compression.type", compression)
            .set("linger.ms", linger.as_millis().to_string())
            .set("batch.size", batch_size.to_string())
            .set("retry.backoff.ms", retry_backoff.as_millis().to_string())
            .create()
            .map_err(|e| TransportError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .create()
            .map_err(|e| {
                TransportError::ConnectionFailed(format!("Failed to create admin client: {e}"))
            })?;

        tracing::info!(
            brokers = %brokers,
            acks = acks,
            compression = compression,
            linger_ms = linger.as_millis(),
            batch_size = batch_size,
            "RedpandaTransport created successfully"
        );

        Ok(RedpandaTransport {
            producer,
            admin,
            brokers,
            timeout,
            metadata_timeout: self.metadata_timeout.unwrap_or(Duration::from_secs(10)),
            admin_timeout: self.admin_timeout.unwrap_or(Duration::from_secs(30)),
            session_timeout: self.session_timeout.unwrap_or(Duration::from_secs(6)),
        })
    }
}

fn is_fatal(error: &KafkaError) -> bool {
    error.rdkafka_error_code() == Some(RDKafkaErrorCode::Fatal)
}

impl LogTransport for RedpandaTransport {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        key: &'a str,
        payload: &'a [u8],
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let record = FutureRecord::to(topic).payload(payload).key(key);

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        partition = partition,
                        offset = offset,
                        key = %key,
                        "Record published"
                    );
                    Ok(())
                }
                Err((kafka_error, _)) => {
                    tracing::error!(topic = %topic, error = %kafka_error, "Failed to publish record");
                    if is_fatal(&kafka_error) {
                        return Err(TransportError::Fatal(kafka_error.to_string()));
                    }
                    Err(TransportError::PublishFailed {
                        topic: topic.to_string(),
                        reason: kafka_error.to_string(),
                    })
                }
            }
        })
    }

    fn subscribe(
        &self,
        subscription: Subscription,
    ) -> BoxFuture<'_, Result<Box<dyn LogConsumer>, TransportError>> {
        Box::pin(async move {
            let failed = |reason: String| TransportError::SubscriptionFailed {
                topic: subscription.topic.clone(),
                reason,
            };

            // Manual commit for at-least-once
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .set("group.id", &subscription.group_id)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", subscription.start.as_str())
                .set("session.timeout.ms", self.session_timeout.as_millis().to_string())
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| failed(format!("Failed to create consumer: {e}")))?;

            match subscription.start {
                // Pin every partition at its current end before returning, so
                // nothing published afterwards is skipped while a group
                // rebalance is still pending.
                StartOffset::Latest => {
                    let assignment = self.end_offsets(&subscription.topic).await.map_err(&failed)?;
                    consumer
                        .assign(&assignment)
                        .map_err(|e| failed(format!("Failed to assign partitions: {e}")))?;
                }
                StartOffset::Earliest => {
                    consumer
                        .subscribe(&[subscription.topic.as_str()])
                        .map_err(|e| failed(format!("Failed to subscribe to topic: {e}")))?;
                }
            }

            tracing::info!(
                topic = %subscription.topic,
                consumer_group = %subscription.group_id,
                auto_offset_reset = subscription.start.as_str(),
                manual_commit = true,
                "Subscribed to topic"
            );

            let consumer: Box<dyn LogConsumer> = Box::new(RedpandaConsumer { consumer });
            Ok(consumer)
        })
    }
}

impl RedpandaTransport {
    /// Every partition of `topic` positioned at its high watermark.
    async fn end_offsets(&self, topic: &str) -> Result<TopicPartitionList, String> {
        let producer = self.producer.clone();
        let timeout = self.metadata_timeout;
        let name = topic.to_string();

        tokio::task::spawn_blocking(move || {
            let client = producer.client();
            let metadata = client
                .fetch_metadata(Some(name.as_str()), Timeout::After(timeout))
                .map_err(|e| format!("Failed to fetch metadata: {e}"))?;
            let partitions: Vec<i32> = metadata
                .topics()
                .iter()
                .filter(|t| t.name() == name)
                .flat_map(|t| t.partitions().iter().map(MetadataPartition::id))
                .collect();
            if partitions.is_empty() {
                return Err(format!("Topic {name} has no partitions"));
            }

            let mut assignment = TopicPartitionList::new();
            for partition in partitions {
                let (_, high) = client
                    .fetch_watermarks(&name, partition, Timeout::After(timeout))
                    .map_err(|e| format!("Failed to fetch watermarks: {e}"))?;
                assignment
                    .add_partition_offset(&name, partition, Offset::Offset(high))
                    .map_err(|e| e.to_string())?;
            }
            Ok(assignment)
        })
        .await
        .map_err(|e| e.to_string())?
    }
}

impl TopicAdmin for RedpandaTransport {
    fn topic_exists<'a>(&'a self, topic: &'a str) -> BoxFuture<'a, Result<bool, TransportError>> {
        Box::pin(async move {
            // Full metadata rather than a per-topic request, which could
            // trigger broker-side auto-creation.
            let producer = self.producer.clone();
            let timeout = self.metadata_timeout;
            let name = topic.to_string();
            let lookup = tokio::task::spawn_blocking(move || {
                producer
                    .client()
                    .fetch_metadata(None, Timeout::After(timeout))
                    .map(|metadata| {
                        metadata
                            .topics()
                            .iter()
                            .any(|t| t.name() == name && t.error().is_none())
                    })
            })
            .await
            .map_err(|e| TransportError::AdminFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

            lookup.map_err(|e| TransportError::AdminFailed {
                topic: topic.to_string(),
                reason: format!("Failed to fetch metadata: {e}"),
            })
        })
    }

    fn create_topic<'a>(
        &'a self,
        topic: &'a str,
        settings: &'a TopicSettings,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let mut new_topic = NewTopic::new(
                topic,
                settings.partitions,
                TopicReplication::Fixed(settings.replication),
            );
            for (key, value) in &settings.config {
                new_topic = new_topic.set(key, value);
            }

            let options = AdminOptions::new()
                .request_timeout(Some(self.admin_timeout))
                .operation_timeout(Some(self.admin_timeout));

            let results = self
                .admin
                .create_topics(&[new_topic], &options)
                .await
                .map_err(|e| TransportError::AdminFailed {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                })?;

            for result in results {
                match result {
                    Ok(_) => {}
                    Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {
                        return Err(TransportError::TopicAlreadyExists(topic.to_string()));
                    }
                    Err((_, code)) => {
                        return Err(TransportError::AdminFailed {
                            topic: topic.to_string(),
                            reason: code.to_string(),
                        });
                    }
                }
            }
            Ok(())
        })
    }
}

struct RedpandaConsumer {
    consumer: StreamConsumer,
}

impl LogConsumer for RedpandaConsumer {
    fn poll(&mut self, timeout: Duration) -> BoxFuture<'_, Result<Option<LogRecord>, TransportError>> {
        Box::pin(async move {
            let Ok(received) = tokio::time::timeout(timeout, self.consumer.recv()).await else {
                return Ok(None);
            };

            match received {
                Ok(message) => {
                    let record = LogRecord {
                        topic: message.topic().to_string(),
                        partition: message.partition(),
                        offset: message.offset(),
                        key: message
                            .key()
                            .map(|key| String::from_utf8_lossy(key).into_owned()),
                        payload: message.payload().map(<[u8]>::to_vec),
                    };
                    tracing::trace!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        "Received record"
                    );
                    Ok(Some(record))
                }
                Err(e) if is_fatal(&e) => Err(TransportError::Fatal(e.to_string())),
                Err(e) => Err(TransportError::PollFailed(format!("Failed to receive message: {e}"))),
            }
        })
    }

    fn commit(&mut self, record: &LogRecord) -> Result<(), TransportError> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(&record.topic, record.partition, Offset::Offset(record.offset + 1))
            .map_err(|e| TransportError::CommitFailed(e.to_string()))?;

        self.consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| {
                if is_fatal(&e) {
                    TransportError::Fatal(e.to_string())
                } else {
                    TransportError::CommitFailed(e.to_string())
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redpanda_transport_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaTransport>();
        assert_sync::<RedpandaTransport>();
    }

    #[test]
    fn build_without_brokers_fails() {
        let result = RedpandaTransport::builder().build();
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }

    #[test]
    fn builder_accepts_producer_overrides() {
        let _builder = RedpandaTransport::builder()
            .brokers("localhost:9092")
            .linger(Duration::from_millis(10))
            .batch_size(32_768)
            .retry_backoff(Duration::from_millis(250));
    }
}
