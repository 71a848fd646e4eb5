//! Dead-letter routing for messages that cannot be processed.
//!
//! Quarantined messages go to `{entity}-dlq` as a small JSON document:
//!
//! ```json
//! { "originalMessage": "...", "error": "...", "timestamp": "2025-01-01T00:00:00Z" }
//! ```
//!
//! Routing is best effort. If the quarantine publish fails, the failure is
//! logged and counted, never returned: the dead-letter path must not be able to
//! take a read loop down.

use crate::metrics::DeadLetterMetrics;
use crate::publisher::Publisher;
use chrono::{DateTime, Utc};
use entity_bridge_core::envelope::new_message_id;
use entity_bridge_core::topic::dead_letter_topic;
use entity_bridge_core::Clock;
use serde::Serialize;
use std::sync::Arc;

/// Body published to a dead-letter topic.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    /// The offending message, as text.
    pub original_message: String,
    /// Why it was quarantined.
    pub error: String,
    /// When it was quarantined.
    pub timestamp: DateTime<Utc>,
}

/// Publishes quarantined messages to per-entity dead-letter topics.
#[derive(Clone)]
pub struct DeadLetterRouter {
    publisher: Publisher,
    clock: Arc<dyn Clock>,
}

impl DeadLetterRouter {
    /// Create a router publishing through `publisher`.
    #[must_use]
    pub fn new(publisher: Publisher, clock: Arc<dyn Clock>) -> Self {
        Self { publisher, clock }
    }

    /// Quarantine `original_message` for `model_type` with `error`.
    ///
    /// Returns whether the dead letter was published. Never fails.
    pub async fn send(&self, model_type: &str, original_message: &str, error: &str) -> bool {
        let topic = dead_letter_topic(model_type);
        let letter = DeadLetter {
            original_message: original_message.to_string(),
            error: error.to_string(),
            timestamp: self.clock.now(),
        };

        let body = match serde_json::to_vec(&letter) {
            Ok(body) => body,
            Err(e) => {
                DeadLetterMetrics::record_failed();
                tracing::error!(topic = %topic, error = %e, "Failed to encode dead letter");
                return false;
            }
        };

        match self.publisher.publish(&topic, &new_message_id(), &body).await {
            Ok(()) => {
                DeadLetterMetrics::record_published();
                tracing::warn!(topic = %topic, error = %error, "Message sent to dead-letter topic");
                true
            }
            Err(e) => {
                DeadLetterMetrics::record_failed();
                tracing::error!(
                    topic = %topic,
                    error = %e,
                    original_error = %error,
                    "Failed to publish to dead-letter topic"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::publisher::TopicProvisioner;
    use entity_bridge_testing::{InMemoryLog, test_clock};

    fn router(log: &InMemoryLog) -> DeadLetterRouter {
        let log = Arc::new(log.clone());
        let publisher = Publisher::new(log.clone(), Arc::new(TopicProvisioner::new(log)));
        DeadLetterRouter::new(publisher, Arc::new(test_clock()))
    }

    #[tokio::test]
    async fn publishes_letter_to_entity_topic() {
        let log = InMemoryLog::new();

        assert!(router(&log).send("Order", "{\"bad\"", "Process error: boom").await);

        let letters = log.json_records("order-dlq");
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0]["originalMessage"], "{\"bad\"");
        assert_eq!(letters[0]["error"], "Process error: boom");
        assert_eq!(
            letters[0]["timestamp"],
            serde_json::to_value(test_clock().now()).unwrap()
        );
    }

    #[tokio::test]
    async fn publish_failure_is_swallowed() {
        let log = InMemoryLog::new();
        log.fail_publishes_to("order-dlq", 1);

        assert!(!router(&log).send("Order", "x", "y").await);
        assert!(log.records("order-dlq").is_empty());
    }
}
