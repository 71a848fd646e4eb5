//! Log transport abstraction: publish, poll with manual commit, topic admin.
//!
//! The bridge never talks to a broker directly. Everything it needs from the
//! partitioned log is captured by three traits:
//!
//! - [`LogTransport`]: publish keyed records and open consumers
//! - [`LogConsumer`]: bounded poll plus explicit offset commit
//! - [`TopicAdmin`]: metadata lookup and topic creation
//!
//! # Delivery Semantics
//!
//! Consumers are opened with auto-commit disabled. A record's offset is only
//! committed when the caller says so, after it has been fully handled, which
//! gives at-least-once delivery: a consumer that restarts before committing
//! sees the record again. Ordering holds within a partition only.
//!
//! # Implementations
//!
//! - `RedpandaTransport` (entity-bridge-redpanda) - Kafka protocol via rdkafka
//! - `InMemoryLog` (entity-bridge-testing) - deterministic, for tests
//!
//! # Dyn Compatibility
//!
//! Methods return `Pin<Box<dyn Future>>` rather than using `async fn` so the
//! traits can be used as `Arc<dyn LogTransport>` by the long-running loops.

use crate::topic::TopicSettings;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Boxed future returned by the transport traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors that can occur talking to the log.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Failed to connect or build a client.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a record to a topic.
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to a topic.
    #[error("Subscription failed for topic '{topic}': {reason}")]
    SubscriptionFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Reading from a subscription failed.
    #[error("Poll failed: {0}")]
    PollFailed(String),

    /// Committing an offset failed.
    #[error("Commit failed: {0}")]
    CommitFailed(String),

    /// Topic creation lost a race with another creator.
    #[error("Topic already exists: {0}")]
    TopicAlreadyExists(String),

    /// Metadata lookup or topic creation failed.
    #[error("Topic administration failed for '{topic}': {reason}")]
    AdminFailed {
        /// The topic being inspected or created
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// The client is in an unrecoverable state and must be rebuilt.
    #[error("Fatal transport error: {0}")]
    Fatal(String),
}

impl TransportError {
    /// Whether retrying on the same client can never succeed.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Where a consumer group with no committed offset starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOffset {
    /// From the earliest retained record.
    Earliest,
    /// Only records published after the subscription.
    Latest,
}

impl StartOffset {
    /// Kafka `auto.offset.reset` value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Earliest => "earliest",
            Self::Latest => "latest",
        }
    }
}

/// Parameters for opening a consumer on one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Topic to read.
    pub topic: String,
    /// Consumer group; committed offsets are tracked per group.
    pub group_id: String,
    /// Start position when the group has no committed offset.
    pub start: StartOffset,
}

impl Subscription {
    /// Create a subscription request.
    #[must_use]
    pub fn new(topic: impl Into<String>, group_id: impl Into<String>, start: StartOffset) -> Self {
        Self {
            topic: topic.into(),
            group_id: group_id.into(),
            start,
        }
    }
}

/// One record read from the log, detached from the client that read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Topic the record was read from.
    pub topic: String,
    /// Partition within the topic.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
    /// Record key, if any.
    pub key: Option<String>,
    /// Record value, if any.
    pub payload: Option<Vec<u8>>,
}

impl LogRecord {
    /// The value as bytes, empty when absent.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or_default()
    }

    /// The value as lossy UTF-8 text, for diagnostics.
    #[must_use]
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(self.body()).into_owned()
    }
}

/// Publisher and consumer factory for a partitioned log.
///
/// All implementations must be `Send + Sync`; a single transport is shared by
/// every requester and read loop in the process.
pub trait LogTransport: Send + Sync {
    /// Publish `payload` to `topic` under `key`.
    ///
    /// Records with the same key land on the same partition.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::PublishFailed`] if the record was not acknowledged.
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        key: &'a str,
        payload: &'a [u8],
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Open a consumer for `subscription` with manual offset commit.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::SubscriptionFailed`] if the consumer cannot be created.
    fn subscribe(
        &self,
        subscription: Subscription,
    ) -> BoxFuture<'_, Result<Box<dyn LogConsumer>, TransportError>>;
}

/// A single-topic consumer owned by one read loop.
pub trait LogConsumer: Send {
    /// Wait up to `timeout` for the next record.
    ///
    /// Returns `Ok(None)` when nothing arrived in time so the caller can check
    /// for cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::PollFailed`] on a read failure, or
    /// [`TransportError::Fatal`] if the consumer is unusable.
    fn poll(&mut self, timeout: Duration) -> BoxFuture<'_, Result<Option<LogRecord>, TransportError>>;

    /// Commit `record` as processed for this consumer's group.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::CommitFailed`] if the commit was rejected.
    fn commit(&mut self, record: &LogRecord) -> Result<(), TransportError>;
}

/// Topic metadata lookup and creation.
pub trait TopicAdmin: Send + Sync {
    /// Whether `topic` exists according to cluster metadata.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::AdminFailed`] if metadata cannot be fetched.
    fn topic_exists<'a>(&'a self, topic: &'a str) -> BoxFuture<'a, Result<bool, TransportError>>;

    /// Create `topic` with `settings`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::TopicAlreadyExists`] if another client created
    /// it first, or [`TransportError::AdminFailed`] for any other failure.
    fn create_topic<'a>(
        &'a self,
        topic: &'a str,
        settings: &'a TopicSettings,
    ) -> BoxFuture<'a, Result<(), TransportError>>;
}
