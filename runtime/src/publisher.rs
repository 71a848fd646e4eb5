//! Lazy topic provisioning and the publish path shared by every component.
//!
//! [`TopicProvisioner::ensure`] checks cluster metadata once per topic name and
//! creates missing topics with [`TopicSettings`]. The check-then-create runs
//! under an async mutex so concurrent first publishes to the same topic cannot
//! race each other into duplicate creation attempts.
//!
//! [`Publisher`] is what requesters, processors and the dead-letter router
//! publish through: ensure the topic, then hand the record to the transport.

use entity_bridge_core::{LogTransport, TopicAdmin, TopicSettings, TransportError};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Ensures topics exist before their first use.
pub struct TopicProvisioner {
    admin: Arc<dyn TopicAdmin>,
    settings: TopicSettings,
    ensured: Mutex<HashSet<String>>,
}

impl TopicProvisioner {
    /// Create a provisioner using [`TopicSettings::default`].
    #[must_use]
    pub fn new(admin: Arc<dyn TopicAdmin>) -> Self {
        Self::with_settings(admin, TopicSettings::default())
    }

    /// Create a provisioner with explicit settings for created topics.
    #[must_use]
    pub fn with_settings(admin: Arc<dyn TopicAdmin>, settings: TopicSettings) -> Self {
        Self {
            admin,
            settings,
            ensured: Mutex::new(HashSet::new()),
        }
    }

    /// Make sure `topic` exists, creating it if the metadata lookup says it
    /// does not.
    ///
    /// Only the first successful call per topic touches the cluster; later calls
    /// return immediately. A failed attempt is not memoized.
    ///
    /// # Errors
    ///
    /// Returns the transport error if metadata lookup fails or creation fails
    /// for any reason other than the topic already existing.
    pub async fn ensure(&self, topic: &str) -> Result<(), TransportError> {
        let mut ensured = self.ensured.lock().await;
        if ensured.contains(topic) {
            return Ok(());
        }

        if self.admin.topic_exists(topic).await? {
            tracing::debug!(topic = %topic, "Topic already present in metadata");
        } else {
            match self.admin.create_topic(topic, &self.settings).await {
                Ok(()) => {
                    tracing::info!(
                        topic = %topic,
                        partitions = self.settings.partitions,
                        replication = self.settings.replication,
                        "Topic created"
                    );
                }
                Err(TransportError::TopicAlreadyExists(_)) => {
                    tracing::debug!(topic = %topic, "Topic created concurrently by another client");
                }
                Err(e) => {
                    tracing::error!(topic = %topic, error = %e, "Failed to create topic");
                    return Err(e);
                }
            }
        }

        ensured.insert(topic.to_string());
        Ok(())
    }
}

/// Publishes records, provisioning their topic on first use.
#[derive(Clone)]
pub struct Publisher {
    transport: Arc<dyn LogTransport>,
    provisioner: Arc<TopicProvisioner>,
}

impl Publisher {
    /// Create a publisher.
    #[must_use]
    pub fn new(transport: Arc<dyn LogTransport>, provisioner: Arc<TopicProvisioner>) -> Self {
        Self {
            transport,
            provisioner,
        }
    }

    /// The underlying transport, for opening consumers.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn LogTransport> {
        &self.transport
    }

    /// The provisioner used before each publish.
    #[must_use]
    pub fn provisioner(&self) -> &Arc<TopicProvisioner> {
        &self.provisioner
    }

    /// Ensure `topic` exists, then publish `payload` under `key`.
    ///
    /// # Errors
    ///
    /// Returns the provisioning or publish error.
    pub async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.provisioner.ensure(topic).await?;
        self.transport.publish(topic, key, payload).await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use entity_bridge_core::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingAdmin {
        exists: bool,
        lookups: AtomicUsize,
        creates: AtomicUsize,
        create_error: Option<TransportError>,
    }

    impl TopicAdmin for CountingAdmin {
        fn topic_exists<'a>(&'a self, _topic: &'a str) -> BoxFuture<'a, Result<bool, TransportError>> {
            Box::pin(async move {
                self.lookups.fetch_add(1, Ordering::SeqCst);
                Ok(self.exists)
            })
        }

        fn create_topic<'a>(
            &'a self,
            _topic: &'a str,
            _settings: &'a TopicSettings,
        ) -> BoxFuture<'a, Result<(), TransportError>> {
            Box::pin(async move {
                // Widen the window in which a racing caller could slip in.
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.creates.fetch_add(1, Ordering::SeqCst);
                self.create_error.clone().map_or(Ok(()), Err)
            })
        }
    }

    #[tokio::test]
    async fn concurrent_first_use_creates_once() {
        let admin = Arc::new(CountingAdmin::default());
        let provisioner = Arc::new(TopicProvisioner::new(admin.clone()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let p = Arc::clone(&provisioner);
                tokio::spawn(async move { p.ensure("order-payment-order").await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(admin.creates.load(Ordering::SeqCst), 1);
        assert_eq!(admin.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn existing_topic_is_not_created() {
        let admin = Arc::new(CountingAdmin {
            exists: true,
            ..CountingAdmin::default()
        });
        let provisioner = TopicProvisioner::new(admin.clone());

        provisioner.ensure("a-b-order").await.unwrap();
        provisioner.ensure("a-b-order").await.unwrap();

        assert_eq!(admin.creates.load(Ordering::SeqCst), 0);
        assert_eq!(admin.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn already_exists_on_create_counts_as_success() {
        let admin = Arc::new(CountingAdmin {
            create_error: Some(TransportError::TopicAlreadyExists("a-b-order".to_string())),
            ..CountingAdmin::default()
        });
        let provisioner = TopicProvisioner::new(admin);

        assert!(provisioner.ensure("a-b-order").await.is_ok());
    }

    #[tokio::test]
    async fn other_create_failures_propagate_and_are_retried_later() {
        let admin = Arc::new(CountingAdmin {
            create_error: Some(TransportError::AdminFailed {
                topic: "a-b-order".to_string(),
                reason: "not authorized".to_string(),
            }),
            ..CountingAdmin::default()
        });
        let provisioner = TopicProvisioner::new(admin.clone());

        assert!(provisioner.ensure("a-b-order").await.is_err());
        assert!(provisioner.ensure("a-b-order").await.is_err());
        assert_eq!(admin.creates.load(Ordering::SeqCst), 2);
    }
}
