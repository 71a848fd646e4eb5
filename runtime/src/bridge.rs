//! Process-level wiring: one publisher, one correlator, any number of clients
//! and command processors.
//!
//! # Example
//!
//! ```rust,ignore
//! let config = BridgeConfig::from_env()?;
//! let transport = Arc::new(RedpandaTransport::builder().brokers(&config.brokers).build()?);
//! let bridge = Bridge::builder(config, transport.clone(), transport).build();
//!
//! bridge.serve::<Order>(store);                  // answer commands from every source service
//! let users = bridge.client::<User>("utility");  // call another service
//!
//! bridge.shutdown().await;
//! ```

use crate::client::EntityClient;
use crate::correlator::ResponseCorrelator;
use crate::lifecycle::{LoopHandle, LoopState};
use crate::processor::{CommandProcessor, ProcessedIds, ProcessorBinding};
use crate::publisher::{Publisher, TopicProvisioner};
use crate::retry::RetryPolicy;
use entity_bridge_core::{
    BridgeConfig, Clock, Entity, EntityStore, LogTransport, SystemClock, TopicAdmin, TopicSettings,
};
use std::sync::{Arc, Mutex, PoisonError};

/// Builder for [`Bridge`].
#[must_use]
pub struct BridgeBuilder {
    config: BridgeConfig,
    transport: Arc<dyn LogTransport>,
    admin: Arc<dyn TopicAdmin>,
    clock: Arc<dyn Clock>,
    settings: TopicSettings,
    retry: RetryPolicy,
}

impl BridgeBuilder {
    /// Use `clock` for envelope and dead-letter timestamps.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use `settings` when creating topics.
    pub fn topic_settings(mut self, settings: TopicSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Use `policy` for subscription retries and poll backoff.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Build the bridge. Nothing touches the broker until first use.
    #[must_use]
    pub fn build(self) -> Bridge {
        let provisioner = Arc::new(TopicProvisioner::with_settings(self.admin, self.settings));
        let publisher = Publisher::new(self.transport, provisioner);
        let correlator = ResponseCorrelator::new(publisher.clone(), &self.config.service_name)
            .with_poll_timeout(self.config.poll_timeout)
            .with_retry_policy(self.retry.clone());

        Bridge {
            config: self.config,
            publisher,
            correlator: Arc::new(correlator),
            clock: self.clock,
            retry: self.retry,
            processed: ProcessedIds::new(),
            processors: Mutex::new(Vec::new()),
        }
    }
}

/// Everything one service needs to call and serve entities over the log.
pub struct Bridge {
    config: BridgeConfig,
    publisher: Publisher,
    correlator: Arc<ResponseCorrelator>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    processed: ProcessedIds,
    processors: Mutex<Vec<LoopHandle>>,
}

impl Bridge {
    /// Start building a bridge for `config`.
    pub fn builder(
        config: BridgeConfig,
        transport: Arc<dyn LogTransport>,
        admin: Arc<dyn TopicAdmin>,
    ) -> BridgeBuilder {
        BridgeBuilder {
            config,
            transport,
            admin,
            clock: Arc::new(SystemClock),
            settings: TopicSettings::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// The configuration this bridge was built from.
    #[must_use]
    pub const fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// The shared publisher.
    #[must_use]
    pub const fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// The shared response correlator.
    #[must_use]
    pub const fn correlator(&self) -> &Arc<ResponseCorrelator> {
        &self.correlator
    }

    /// A client for entity `E` owned by `destination_service`.
    #[must_use]
    pub fn client<E: Entity>(&self, destination_service: &str) -> EntityClient<E> {
        EntityClient::new(
            &self.config.service_name,
            destination_service,
            self.publisher.clone(),
            Arc::clone(&self.correlator),
            Arc::clone(&self.clock),
        )
        .with_timeout(self.config.request_timeout)
    }

    /// Serve commands about `E` from every configured source service.
    ///
    /// Starts one command processor per source service; all of them share one
    /// processed-id table. Returns their bindings.
    pub fn serve<E: Entity>(&self, store: Arc<dyn EntityStore<E>>) -> Vec<ProcessorBinding> {
        if self.config.source_services.is_empty() {
            tracing::warn!(model_type = E::MODEL_TYPE, "No source services configured, nothing to serve");
        }

        let mut bindings = Vec::with_capacity(self.config.source_services.len());
        let mut handles = Vec::with_capacity(self.config.source_services.len());

        for source in &self.config.source_services {
            let processor = CommandProcessor::new(
                &self.config.service_name,
                source,
                Arc::clone(&store),
                self.publisher.clone(),
                Arc::clone(&self.clock),
            )
            .with_processed_ids(self.processed.clone())
            .with_poll_timeout(self.config.poll_timeout)
            .with_retry_policy(self.retry.clone());

            bindings.push(processor.binding().clone());
            handles.push(Arc::new(processor).start());
        }

        self.processors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);
        bindings
    }

    /// Name and state of every running command processor loop.
    #[must_use]
    pub fn processor_states(&self) -> Vec<(String, LoopState)> {
        self.processors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|handle| (handle.name().to_string(), handle.state()))
            .collect()
    }

    /// Stop every processor, draining in-flight commands, then the correlator.
    pub async fn shutdown(&self) {
        let handles: Vec<LoopHandle> = std::mem::take(
            &mut *self.processors.lock().unwrap_or_else(PoisonError::into_inner),
        );

        let stopped = futures::future::join_all(handles.into_iter().map(|handle| async move {
            let name = handle.name().to_string();
            (name, handle.stop().await)
        }))
        .await;
        for (name, state) in stopped {
            tracing::info!(topic = %name, state = ?state, "Command processor stopped");
        }

        self.correlator.shutdown().await;
        tracing::info!(service = %self.config.service_name, "Bridge shut down");
    }
}
