//! Idempotent command processing for one entity type.
//!
//! A [`CommandProcessor`] reads `{source}-{consumer}-{entity}` and answers on
//! `{consumer}-{source}-{entity}`. Per record:
//!
//! 1. skip an empty or undecodable body
//! 2. skip a foreign `modelType`
//! 3. skip a missing correlation id
//! 4. skip a correlation id that is already being processed
//! 5. apply the command through a fresh [`UnitOfWork`] and build the reply
//! 6. turn any failure of step 5 into an `ERROR_RESPONSE`
//! 7. release the correlation id
//!
//! If the reply cannot be published the original message is dead-lettered once.
//! Whatever happens, the record's offset is committed afterwards by the read
//! loop, so one bad record never blocks the partition.

use crate::dead_letter::DeadLetterRouter;
use crate::lifecycle::LoopHandle;
use crate::metrics::CommandMetrics;
use crate::publisher::Publisher;
use crate::read_loop::{ReadLoop, RecordSink};
use crate::retry::RetryPolicy;
use entity_bridge_core::config::DEFAULT_POLL_TIMEOUT;
use entity_bridge_core::entity::parse_id;
use entity_bridge_core::topic::topic_for;
use entity_bridge_core::{
    Clock, Entity, EntityStore, Envelope, EventType, LogRecord, StartOffset, StoreError,
    Subscription, TransportError,
};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Correlation ids currently being processed.
///
/// Cloning shares the table, so several processors (or concurrent calls to
/// [`CommandProcessor::handle_record`]) deduplicate against each other.
#[derive(Debug, Clone, Default)]
pub struct ProcessedIds {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl ProcessedIds {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `correlation_id`, or `None` if it is already claimed.
    ///
    /// The claim is released when the returned guard is dropped.
    #[must_use]
    pub fn claim(&self, correlation_id: &str) -> Option<Claim> {
        let inserted = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(correlation_id.to_string());

        inserted.then(|| Claim {
            table: self.clone(),
            correlation_id: correlation_id.to_string(),
        })
    }

    /// Whether `correlation_id` is currently claimed.
    #[must_use]
    pub fn contains(&self, correlation_id: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(correlation_id)
    }

    /// Number of claimed ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing is claimed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, correlation_id: &str) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(correlation_id);
    }
}

/// Guard over a claimed correlation id.
#[derive(Debug)]
pub struct Claim {
    table: ProcessedIds,
    correlation_id: String,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.table.release(&self.correlation_id);
    }
}

/// Why a record was dropped without a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Empty body, invalid JSON or unknown event type.
    Malformed,
    /// `modelType` names another entity.
    ForeignModel,
    /// No correlation id.
    MissingCorrelation,
    /// The correlation id is already being processed.
    Duplicate,
    /// A response kind arrived on a command topic.
    NotACommand,
}

impl SkipReason {
    /// Metric label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::ForeignModel => "foreign_model",
            Self::MissingCorrelation => "missing_correlation",
            Self::Duplicate => "duplicate",
            Self::NotACommand => "not_a_command",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The command was handled and this reply kind was published.
    Replied(EventType),
    /// The record was dropped.
    Skipped(SkipReason),
    /// The reply could not be published; the record went to the dead-letter topic.
    DeadLettered,
}

/// Topics and consumer group of one processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorBinding {
    /// Service that owns the entity and runs the processor.
    pub consumer: String,
    /// Service that sends the commands.
    pub source: String,
    /// `{source}-{consumer}-{entity}`
    pub command_topic: String,
    /// `{consumer}-{source}-{entity}`
    pub response_topic: String,
    /// `{consumer}-consumer-group-{source}-{entity}`
    pub group_id: String,
}

impl ProcessorBinding {
    /// Binding for `consumer` serving commands about `entity` from `source`.
    #[must_use]
    pub fn new(consumer: &str, source: &str, entity: &str) -> Self {
        Self {
            consumer: consumer.to_string(),
            source: source.to_string(),
            command_topic: topic_for(source, consumer, entity),
            response_topic: topic_for(consumer, source, entity),
            group_id: format!(
                "{consumer}-consumer-group-{source}-{}",
                entity.to_lowercase()
            ),
        }
    }
}

/// Applies commands for entity `E` from one source service.
pub struct CommandProcessor<E: Entity> {
    binding: ProcessorBinding,
    store: Arc<dyn EntityStore<E>>,
    publisher: Publisher,
    dead_letters: DeadLetterRouter,
    processed: ProcessedIds,
    clock: Arc<dyn Clock>,
    poll_timeout: Duration,
    retry: RetryPolicy,
}

impl<E: Entity> CommandProcessor<E> {
    /// Create a processor for `consumer` serving `source`.
    #[must_use]
    pub fn new(
        consumer: &str,
        source: &str,
        store: Arc<dyn EntityStore<E>>,
        publisher: Publisher,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            binding: ProcessorBinding::new(consumer, source, E::MODEL_TYPE),
            store,
            dead_letters: DeadLetterRouter::new(publisher.clone(), Arc::clone(&clock)),
            publisher,
            processed: ProcessedIds::new(),
            clock,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }

    /// Share a processed-id table with other processors.
    #[must_use]
    pub fn with_processed_ids(mut self, processed: ProcessedIds) -> Self {
        self.processed = processed;
        self
    }

    /// Set the bounded wait of each poll.
    #[must_use]
    pub const fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Set the retry policy for subscribing and poll backoff.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Topics and group this processor uses.
    #[must_use]
    pub const fn binding(&self) -> &ProcessorBinding {
        &self.binding
    }

    /// The processed-id table.
    #[must_use]
    pub const fn processed_ids(&self) -> &ProcessedIds {
        &self.processed
    }

    /// Start the read loop over the command topic, from the earliest offset.
    #[must_use]
    pub fn start(self: Arc<Self>) -> LoopHandle {
        let subscription = Subscription::new(
            &self.binding.command_topic,
            &self.binding.group_id,
            StartOffset::Earliest,
        );
        tracing::info!(
            topic = %self.binding.command_topic,
            group_id = %self.binding.group_id,
            model_type = E::MODEL_TYPE,
            "Starting command processor"
        );

        ReadLoop::new(&self.publisher, subscription)
            .poll_timeout(self.poll_timeout)
            .retry_policy(self.retry.clone())
            .spawn(ProcessorSink { processor: self })
    }

    /// Handle one record end to end. Never fails; safe to call concurrently.
    pub async fn handle_record(&self, record: &LogRecord) -> RecordOutcome {
        let envelope = match Envelope::from_slice(record.body()) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(
                    topic = %record.topic,
                    offset = record.offset,
                    error = %e,
                    "Skipping undecodable command"
                );
                return skipped(SkipReason::Malformed);
            }
        };

        if envelope.model_type != E::MODEL_TYPE {
            tracing::debug!(
                model_type = %envelope.model_type,
                expected = E::MODEL_TYPE,
                "Skipping command for another model type"
            );
            return skipped(SkipReason::ForeignModel);
        }

        let Some(correlation_id) = envelope.correlation() else {
            tracing::warn!(topic = %record.topic, offset = record.offset, "Skipping command without correlation id");
            return skipped(SkipReason::MissingCorrelation);
        };

        let Some(_claim) = self.processed.claim(correlation_id) else {
            tracing::info!(correlation_id = %correlation_id, "Skipping duplicate command");
            return skipped(SkipReason::Duplicate);
        };

        tracing::debug!(
            correlation_id = %correlation_id,
            event_type = %envelope.event_type,
            topic = %record.topic,
            "Processing command"
        );

        let Some(result) = self.apply(&envelope).await else {
            tracing::warn!(
                correlation_id = %correlation_id,
                event_type = %envelope.event_type,
                "Ignoring response kind on command topic"
            );
            return skipped(SkipReason::NotACommand);
        };

        let now = self.clock.now();
        let reply = match result {
            Ok((kind, payload)) => envelope.reply(kind, payload, now),
            Err(message) => {
                tracing::warn!(correlation_id = %correlation_id, error = %message, "Command failed");
                envelope.reply(EventType::ErrorResponse, Value::String(message), now)
            }
        };

        match self.send_reply(&reply, correlation_id).await {
            Ok(()) => {
                CommandMetrics::record_processed(envelope.event_type.as_str());
                tracing::debug!(
                    correlation_id = %correlation_id,
                    reply = %reply.event_type,
                    "Command completed"
                );
                RecordOutcome::Replied(reply.event_type)
            }
            Err(e) => {
                tracing::error!(
                    correlation_id = %correlation_id,
                    topic = %self.binding.response_topic,
                    error = %e,
                    "Failed to publish reply"
                );
                self.dead_letters
                    .send(E::MODEL_TYPE, &record.body_text(), &format!("Process error: {e}"))
                    .await;
                RecordOutcome::DeadLettered
            }
        }
    }

    async fn send_reply(&self, reply: &Envelope, key: &str) -> Result<(), TransportError> {
        let body = reply.to_bytes().map_err(|e| TransportError::PublishFailed {
            topic: self.binding.response_topic.clone(),
            reason: e.to_string(),
        })?;
        self.publisher
            .publish(&self.binding.response_topic, key, &body)
            .await
    }

    /// Run the command; `None` for response kinds.
    async fn apply(&self, envelope: &Envelope) -> Option<Result<(EventType, Value), String>> {
        let payload = &envelope.payload;
        let result = match envelope.event_type {
            EventType::Create => self
                .create(payload)
                .await
                .map_err(|e| format!("Error creating entity: {e}")),
            EventType::Update => self.update(payload).await.map_err(|e| match e {
                Failure::Missing(id) => StoreError::NotFound(id).to_string(),
                other => format!("Error updating entity: {other}"),
            }),
            EventType::Delete => self.delete(payload).await.map_err(|e| match e {
                Failure::Missing(id) => StoreError::NotFound(id).to_string(),
                other => format!("Error deleting entity: {other}"),
            }),
            EventType::GetAll => self
                .get_all()
                .await
                .map_err(|e| format!("Error retrieving entities: {e}")),
            EventType::GetById => self
                .get_by_id(payload)
                .await
                .map_err(|e| format!("Error retrieving entity: {e}")),
            EventType::CreatedResponse
            | EventType::UpdatedResponse
            | EventType::DeletedResponse
            | EventType::GetAllResponse
            | EventType::GetByIdResponse
            | EventType::ErrorResponse => return None,
        };

        let reply_kind = envelope.event_type.success_reply()?;
        Some(result.map(|payload| (reply_kind, payload)))
    }

    async fn create(&self, payload: &Value) -> Result<Value, Failure> {
        let entity = decode_entity::<E>(payload)?;
        let mut work = self.store.begin().await?;
        let stored = work.add(entity).await?;
        work.commit().await?;
        encode(&stored)
    }

    async fn update(&self, payload: &Value) -> Result<Value, Failure> {
        let incoming = decode_entity::<E>(payload)?;
        let id = incoming.id();

        let mut work = self.store.begin().await?;
        let Some(mut existing) = work.get_by_id(id.clone()).await? else {
            return Err(Failure::Missing(id.to_string()));
        };
        existing.merge_from(incoming);
        let stored = work.update(existing).await?;
        work.commit().await?;
        encode(&stored)
    }

    async fn delete(&self, payload: &Value) -> Result<Value, Failure> {
        let id = id_from::<E>(payload)?;

        let mut work = self.store.begin().await?;
        let Some(existing) = work.get_by_id(id.clone()).await? else {
            return Err(Failure::Missing(id.to_string()));
        };
        work.delete(existing).await?;
        work.commit().await?;
        encode(&id)
    }

    async fn get_all(&self) -> Result<Value, Failure> {
        let mut work = self.store.begin().await?;
        let all = work.get_all().await?;
        encode(&all)
    }

    async fn get_by_id(&self, payload: &Value) -> Result<Value, Failure> {
        let id = id_from::<E>(payload)?;
        let mut work = self.store.begin().await?;
        let found = work.get_by_id(id).await?;
        encode(&found)
    }
}

fn skipped(reason: SkipReason) -> RecordOutcome {
    CommandMetrics::record_skipped(reason.as_str());
    RecordOutcome::Skipped(reason)
}

#[derive(Debug)]
enum Failure {
    Payload(String),
    Missing(String),
    Store(StoreError),
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Payload(reason) => write!(f, "invalid payload: {reason}"),
            Self::Missing(id) => write!(f, "{}", StoreError::NotFound(id.clone())),
            Self::Store(e) => write!(f, "{e}"),
        }
    }
}

impl From<StoreError> for Failure {
    fn from(error: StoreError) -> Self {
        Self::Store(error)
    }
}

fn decode_entity<E: Entity>(payload: &Value) -> Result<E, Failure> {
    serde_json::from_value(payload.clone()).map_err(|e| Failure::Payload(e.to_string()))
}

fn id_from<E: Entity>(payload: &Value) -> Result<E::Id, Failure> {
    parse_id::<E>(payload).ok_or_else(|| Failure::Payload(format!("{payload} is not a valid id")))
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Value, Failure> {
    serde_json::to_value(value).map_err(|e| Failure::Payload(e.to_string()))
}

struct ProcessorSink<E: Entity> {
    processor: Arc<CommandProcessor<E>>,
}

impl<E: Entity> RecordSink for ProcessorSink<E> {
    async fn handle(&mut self, record: &LogRecord) {
        self.processor.handle_record(record).await;
    }

    fn poll_failed(&mut self, error: &TransportError) {
        let dead_letters = self.processor.dead_letters.clone();
        let message = format!("Consume error: {error}");
        let error = error.to_string();
        tokio::spawn(async move {
            dead_letters.send(E::MODEL_TYPE, &message, &error).await;
        });
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Invoice {
        id: u32,
        total: i64,
    }

    impl Entity for Invoice {
        type Id = u32;
        const MODEL_TYPE: &'static str = "Invoice";

        fn id(&self) -> u32 {
            self.id
        }

        fn set_id(&mut self, id: u32) {
            self.id = id;
        }

        fn merge_from(&mut self, incoming: Self) {
            self.total = incoming.total;
        }
    }

    #[test]
    fn binding_follows_naming_convention() {
        let binding = ProcessorBinding::new("payment", "order", "Invoice");
        assert_eq!(binding.command_topic, "order-payment-invoice");
        assert_eq!(binding.response_topic, "payment-order-invoice");
        assert_eq!(binding.group_id, "payment-consumer-group-order-invoice");
    }

    #[test]
    fn claims_are_exclusive_until_dropped() {
        let ids = ProcessedIds::new();
        let claim = ids.claim("c1").unwrap();
        assert!(ids.claim("c1").is_none());
        assert!(ids.contains("c1"));

        drop(claim);
        assert!(ids.is_empty());
        assert!(ids.claim("c1").is_some());
    }

    #[test]
    fn cloned_tables_share_claims() {
        let ids = ProcessedIds::new();
        let shared = ids.clone();
        let _claim = ids.claim("c1").unwrap();
        assert!(shared.claim("c1").is_none());
    }

    #[test]
    fn ids_parse_from_json_or_text() {
        assert_eq!(id_from::<Invoice>(&json!(7)).unwrap(), 7);
        assert_eq!(id_from::<Invoice>(&json!("7")).unwrap(), 7);
        assert!(id_from::<Invoice>(&json!("seven")).is_err());
        assert_eq!(
            id_from::<Invoice>(&json!({"id": 7})).unwrap_err().to_string(),
            r#"invalid payload: {"id":7} is not a valid id"#
        );
    }

    #[test]
    fn missing_entity_message_matches_store_wording() {
        assert_eq!(
            Failure::Missing("9".to_string()).to_string(),
            "Entity with ID 9 not found."
        );
    }
}
