//! In-memory partitioned log for fast, deterministic bridge tests.
//!
//! [`InMemoryLog`] implements both [`LogTransport`] and [`TopicAdmin`]:
//!
//! - topics with a fixed number of partitions; keys pick the partition
//! - committed offsets per (consumer group, topic, partition)
//! - `Earliest` / `Latest` start for groups without a committed offset
//! - bounded polls that wake as soon as a record is published
//! - fault injection for publishes, polls and subscriptions
//!
//! Consumers of the same group do not split partitions between them; each one
//! reads every partition. Tests use one consumer per group.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned locks

use entity_bridge_core::{
    BoxFuture, LogConsumer, LogRecord, LogTransport, StartOffset, Subscription, TopicAdmin,
    TopicSettings, TransportError,
};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone)]
struct Stored {
    sequence: u64,
    key: Option<String>,
    payload: Vec<u8>,
}

#[derive(Debug)]
struct Topic {
    partitions: Vec<Vec<Stored>>,
    settings: Option<TopicSettings>,
}

impl Topic {
    fn new(partitions: i32, settings: Option<TopicSettings>) -> Self {
        let count = usize::try_from(partitions.max(1)).unwrap_or(1);
        Self {
            partitions: vec![Vec::new(); count],
            settings,
        }
    }

    fn partition_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let count = self.partitions.len() as u64;
        usize::try_from(hasher.finish() % count).unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct Faults {
    publish: HashMap<String, usize>,
    polls: usize,
    fatal_polls: bool,
    subscriptions: usize,
}

#[derive(Debug, Default)]
struct State {
    topics: HashMap<String, Topic>,
    committed: HashMap<(String, String, i32), i64>,
    faults: Faults,
    sequence: u64,
    create_calls: usize,
}

impl State {
    fn topic_mut(&mut self, name: &str) -> &mut Topic {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| Topic::new(1, None))
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    published: Notify,
}

/// In-memory log implementing [`LogTransport`] and [`TopicAdmin`].
///
/// Cloning shares the log.
///
/// # Example
///
/// ```
/// use entity_bridge_core::{LogTransport, StartOffset, Subscription};
/// use entity_bridge_testing::InMemoryLog;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let log = InMemoryLog::new();
/// let mut consumer = log
///     .subscribe(Subscription::new("a-b-order", "g1", StartOffset::Earliest))
///     .await?;
///
/// log.publish("a-b-order", "c1", b"{}").await?;
///
/// let record = consumer.poll(Duration::from_millis(100)).await?.unwrap();
/// assert_eq!(record.key.as_deref(), Some("c1"));
/// consumer.commit(&record)?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryLog {
    shared: Arc<Shared>,
}

impl InMemoryLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` publishes to `topic` fail.
    pub fn fail_publishes_to(&self, topic: &str, count: usize) {
        let mut state = self.shared.state.lock().unwrap();
        state.faults.publish.insert(topic.to_string(), count);
    }

    /// Make the next `count` polls (on any consumer) fail transiently.
    pub fn fail_next_polls(&self, count: usize) {
        self.shared.state.lock().unwrap().faults.polls = count;
        self.shared.published.notify_waiters();
    }

    /// Make every poll fail with a fatal error from now on.
    pub fn fail_polls_fatally(&self) {
        self.shared.state.lock().unwrap().faults.fatal_polls = true;
        self.shared.published.notify_waiters();
    }

    /// Make the next `count` subscription attempts fail.
    pub fn fail_next_subscriptions(&self, count: usize) {
        self.shared.state.lock().unwrap().faults.subscriptions = count;
    }

    /// Every record of `topic`, in publish order.
    #[must_use]
    pub fn records(&self, topic: &str) -> Vec<LogRecord> {
        let state = self.shared.state.lock().unwrap();
        let Some(found) = state.topics.get(topic) else {
            return Vec::new();
        };

        let mut all: Vec<(u64, LogRecord)> = Vec::new();
        for (partition, records) in found.partitions.iter().enumerate() {
            for (offset, stored) in records.iter().enumerate() {
                all.push((
                    stored.sequence,
                    LogRecord {
                        topic: topic.to_string(),
                        partition: i32::try_from(partition).unwrap(),
                        offset: i64::try_from(offset).unwrap(),
                        key: stored.key.clone(),
                        payload: Some(stored.payload.clone()),
                    },
                ));
            }
        }
        all.sort_by_key(|(sequence, _)| *sequence);
        all.into_iter().map(|(_, record)| record).collect()
    }

    /// Payloads of `topic` parsed as JSON, in publish order.
    #[must_use]
    pub fn json_records(&self, topic: &str) -> Vec<serde_json::Value> {
        self.records(topic)
            .iter()
            .map(|record| serde_json::from_slice(record.body()).unwrap())
            .collect()
    }

    /// Names of all topics.
    #[must_use]
    pub fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.state.lock().unwrap().topics.keys().cloned().collect();
        names.sort();
        names
    }

    /// Settings `topic` was created with, if created through [`TopicAdmin`].
    #[must_use]
    pub fn topic_settings(&self, topic: &str) -> Option<TopicSettings> {
        self.shared
            .state
            .lock()
            .unwrap()
            .topics
            .get(topic)
            .and_then(|t| t.settings.clone())
    }

    /// Number of `create_topic` calls, successful or not.
    #[must_use]
    pub fn create_calls(&self) -> usize {
        self.shared.state.lock().unwrap().create_calls
    }

    /// Next offset `group` will read from `topic`/`partition`, if committed.
    #[must_use]
    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.shared
            .state
            .lock()
            .unwrap()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Sum of committed offsets of `group` over every partition of `topic`.
    #[must_use]
    pub fn committed_total(&self, group: &str, topic: &str) -> i64 {
        self.shared
            .state
            .lock()
            .unwrap()
            .committed
            .iter()
            .filter(|((g, t, _), _)| g == group && t == topic)
            .map(|(_, offset)| *offset)
            .sum()
    }
}

impl LogTransport for InMemoryLog {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        key: &'a str,
        payload: &'a [u8],
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            {
                let mut state = self.shared.state.lock().unwrap();

                if let Some(remaining) = state.faults.publish.get_mut(topic) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(TransportError::PublishFailed {
                            topic: topic.to_string(),
                            reason: "injected publish failure".to_string(),
                        });
                    }
                }

                state.sequence += 1;
                let sequence = state.sequence;
                let target = state.topic_mut(topic);
                let partition = target.partition_for(key);
                target.partitions[partition].push(Stored {
                    sequence,
                    key: Some(key.to_string()),
                    payload: payload.to_vec(),
                });
            }

            self.shared.published.notify_waiters();
            Ok(())
        })
    }

    fn subscribe(
        &self,
        subscription: Subscription,
    ) -> BoxFuture<'_, Result<Box<dyn LogConsumer>, TransportError>> {
        Box::pin(async move {
            let mut state = self.shared.state.lock().unwrap();

            if state.faults.subscriptions > 0 {
                state.faults.subscriptions -= 1;
                return Err(TransportError::SubscriptionFailed {
                    topic: subscription.topic,
                    reason: "injected subscription failure".to_string(),
                });
            }

            let lengths: Vec<usize> = state
                .topic_mut(&subscription.topic)
                .partitions
                .iter()
                .map(Vec::len)
                .collect();

            let positions = lengths
                .iter()
                .enumerate()
                .map(|(partition, len)| {
                    let key = (
                        subscription.group_id.clone(),
                        subscription.topic.clone(),
                        i32::try_from(partition).unwrap(),
                    );
                    state.committed.get(&key).copied().unwrap_or(match subscription.start {
                        StartOffset::Earliest => 0,
                        StartOffset::Latest => i64::try_from(*len).unwrap(),
                    })
                })
                .collect();

            let consumer: Box<dyn LogConsumer> = Box::new(InMemoryConsumer {
                shared: Arc::clone(&self.shared),
                subscription,
                positions,
                next_partition: 0,
            });
            Ok(consumer)
        })
    }
}

impl TopicAdmin for InMemoryLog {
    fn topic_exists<'a>(&'a self, topic: &'a str) -> BoxFuture<'a, Result<bool, TransportError>> {
        Box::pin(async move { Ok(self.shared.state.lock().unwrap().topics.contains_key(topic)) })
    }

    fn create_topic<'a>(
        &'a self,
        topic: &'a str,
        settings: &'a TopicSettings,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let mut state = self.shared.state.lock().unwrap();
            state.create_calls += 1;
            if state.topics.contains_key(topic) {
                return Err(TransportError::TopicAlreadyExists(topic.to_string()));
            }
            state.topics.insert(
                topic.to_string(),
                Topic::new(settings.partitions, Some(settings.clone())),
            );
            Ok(())
        })
    }
}

struct InMemoryConsumer {
    shared: Arc<Shared>,
    subscription: Subscription,
    positions: Vec<i64>,
    next_partition: usize,
}

impl InMemoryConsumer {
    fn try_next(&mut self) -> Result<Option<LogRecord>, TransportError> {
        let mut state = self.shared.state.lock().unwrap();

        if state.faults.fatal_polls {
            return Err(TransportError::Fatal("injected fatal poll failure".to_string()));
        }
        if state.faults.polls > 0 {
            state.faults.polls -= 1;
            return Err(TransportError::PollFailed("injected poll failure".to_string()));
        }

        let topic = state.topic_mut(&self.subscription.topic);
        if self.positions.len() < topic.partitions.len() {
            self.positions.resize(topic.partitions.len(), 0);
        }

        let count = topic.partitions.len();
        for step in 0..count {
            let partition = (self.next_partition + step) % count;
            let position = self.positions[partition];
            let Some(stored) = usize::try_from(position)
                .ok()
                .and_then(|index| topic.partitions[partition].get(index))
            else {
                continue;
            };

            self.positions[partition] = position + 1;
            self.next_partition = (partition + 1) % count;
            return Ok(Some(LogRecord {
                topic: self.subscription.topic.clone(),
                partition: i32::try_from(partition).unwrap(),
                offset: position,
                key: stored.key.clone(),
                payload: Some(stored.payload.clone()),
            }));
        }

        Ok(None)
    }
}

impl LogConsumer for InMemoryConsumer {
    fn poll(&mut self, timeout: Duration) -> BoxFuture<'_, Result<Option<LogRecord>, TransportError>> {
        Box::pin(async move {
            let deadline = tokio::time::Instant::now() + timeout;
            let shared = Arc::clone(&self.shared);

            loop {
                let notified = shared.published.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if let Some(record) = self.try_next()? {
                    return Ok(Some(record));
                }

                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    return Ok(None);
                }
            }
        })
    }

    fn commit(&mut self, record: &LogRecord) -> Result<(), TransportError> {
        let mut state = self.shared.state.lock().unwrap();
        let key = (
            self.subscription.group_id.clone(),
            record.topic.clone(),
            record.partition,
        );
        let next = record.offset + 1;
        let entry = state.committed.entry(key).or_insert(next);
        *entry = (*entry).max(next);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(topic: &str, group: &str, start: StartOffset) -> Subscription {
        Subscription::new(topic, group, start)
    }

    #[tokio::test]
    async fn latest_start_skips_existing_records() {
        let log = InMemoryLog::new();
        log.publish("t", "k", b"old").await.unwrap();

        let mut consumer = log.subscribe(sub("t", "g", StartOffset::Latest)).await.unwrap();
        assert!(consumer.poll(Duration::from_millis(10)).await.unwrap().is_none());

        log.publish("t", "k", b"new").await.unwrap();
        let record = consumer.poll(Duration::from_millis(100)).await.unwrap().unwrap();
        assert_eq!(record.body(), b"new");
    }

    #[tokio::test]
    async fn group_resumes_after_committed_offset() {
        let log = InMemoryLog::new();
        for body in [b"a", b"b", b"c"] {
            log.publish("t", "same-key", body).await.unwrap();
        }

        let mut first = log.subscribe(sub("t", "g", StartOffset::Earliest)).await.unwrap();
        let a = first.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        first.commit(&a).unwrap();
        let _b_uncommitted = first.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        drop(first);

        let mut second = log.subscribe(sub("t", "g", StartOffset::Earliest)).await.unwrap();
        let redelivered = second.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(redelivered.body(), b"b");
    }

    #[tokio::test]
    async fn poll_wakes_on_publish() {
        let log = InMemoryLog::new();
        let mut consumer = log.subscribe(sub("t", "g", StartOffset::Earliest)).await.unwrap();

        let publisher = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("t", "k", b"hello").await.unwrap();
        });

        let record = consumer.poll(Duration::from_secs(5)).await.unwrap();
        assert!(record.is_some());
    }

    #[tokio::test]
    async fn injected_faults_are_consumed() {
        let log = InMemoryLog::new();
        log.fail_publishes_to("t", 1);
        assert!(log.publish("t", "k", b"x").await.is_err());
        assert!(log.publish("t", "k", b"x").await.is_ok());

        let mut consumer = log.subscribe(sub("t", "g", StartOffset::Earliest)).await.unwrap();
        log.fail_next_polls(1);
        assert!(matches!(
            consumer.poll(Duration::from_millis(10)).await,
            Err(TransportError::PollFailed(_))
        ));
        assert!(consumer.poll(Duration::from_millis(10)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn create_topic_reports_existing() {
        let log = InMemoryLog::new();
        let settings = TopicSettings::default();
        log.create_topic("t", &settings).await.unwrap();

        assert!(log.topic_exists("t").await.unwrap());
        assert_eq!(
            log.create_topic("t", &settings).await,
            Err(TransportError::TopicAlreadyExists("t".to_string()))
        );
        assert_eq!(log.topic_settings("t").unwrap().partitions, 3);
    }
}
