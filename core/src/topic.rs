//! Topic naming and the settings used when the bridge creates topics.
//!
//! # Naming Convention
//!
//! Every (producer service, consumer service, entity type) triple owns a pair of
//! topics, one per direction:
//!
//! - commands: `{producer}-{consumer}-{entity}` (e.g. `order-payment-order`)
//! - responses: `{consumer}-{producer}-{entity}` (the same pair, swapped)
//! - quarantine: `{entity}-dlq`
//!
//! Entity names are lowercased; service names are used verbatim.

use std::collections::BTreeMap;

/// Name of the topic carrying messages from `producer` to `consumer` about `entity`.
///
/// Pure and deterministic; the response topic of a channel is obtained by
/// swapping `producer` and `consumer`.
///
/// # Examples
///
/// ```
/// use entity_bridge_core::topic::topic_for;
///
/// assert_eq!(topic_for("order", "payment", "Order"), "order-payment-order");
/// assert_eq!(topic_for("payment", "order", "Order"), "payment-order-order");
/// ```
#[must_use]
pub fn topic_for(producer: &str, consumer: &str, entity: &str) -> String {
    format!("{producer}-{consumer}-{}", entity.to_lowercase())
}

/// Name of the quarantine topic for `entity`.
///
/// ```
/// use entity_bridge_core::topic::dead_letter_topic;
///
/// assert_eq!(dead_letter_topic("Order"), "order-dlq");
/// ```
#[must_use]
pub fn dead_letter_topic(entity: &str) -> String {
    format!("{}-dlq", entity.to_lowercase())
}

/// The two directions of one request/response channel, seen from the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicRoute {
    /// Topic the caller publishes commands to.
    pub command_topic: String,
    /// Topic the caller reads replies from.
    pub response_topic: String,
}

impl TopicRoute {
    /// Route for `caller` sending commands about `entity` to `callee`.
    #[must_use]
    pub fn between(caller: &str, callee: &str, entity: &str) -> Self {
        Self {
            command_topic: topic_for(caller, callee, entity),
            response_topic: topic_for(callee, caller, entity),
        }
    }
}

/// Settings applied when a topic has to be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSettings {
    /// Number of partitions.
    pub partitions: i32,
    /// Replication factor.
    pub replication: i32,
    /// Topic-level configuration entries.
    pub config: BTreeMap<String, String>,
}

impl Default for TopicSettings {
    /// Three partitions, replication factor one, seven days retention in
    /// one-day segments.
    fn default() -> Self {
        let config = [
            ("cleanup.policy", "delete"),
            ("retention.ms", "604800000"),
            ("segment.ms", "86400000"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            partitions: 3,
            replication: 1,
            config,
        }
    }
}
