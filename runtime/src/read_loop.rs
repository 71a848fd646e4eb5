//! The poll/handle/commit loop shared by the correlator and command processors.
//!
//! 1. ensure the topic exists and open a consumer, retrying transient failures
//! 2. poll with a bounded wait; after an empty poll sleep briefly
//! 3. hand each record to a [`RecordSink`], then commit its offset
//! 4. on a poll failure back off exponentially and notify the sink; commit nothing
//!
//! A fatal transport error, or exhausted subscription retries, ends the loop as
//! [`LoopState::Faulted`].

use crate::lifecycle::{LoopControl, LoopHandle, LoopState};
use crate::metrics::RetryMetrics;
use crate::publisher::{Publisher, TopicProvisioner};
use crate::retry::{RetryPolicy, retry_transient};
use entity_bridge_core::config::DEFAULT_POLL_TIMEOUT;
use entity_bridge_core::{LogConsumer, LogRecord, LogTransport, Subscription, TransportError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Pause after a poll that returned nothing.
pub const IDLE_DELAY: Duration = Duration::from_millis(100);

/// Per-record behaviour plugged into a read loop.
pub(crate) trait RecordSink: Send + 'static {
    /// Handle one record. Must not fail: the offset is committed afterwards.
    fn handle(&mut self, record: &LogRecord) -> impl Future<Output = ()> + Send;

    /// Called once per failed poll, before backing off.
    fn poll_failed(&mut self, _error: &TransportError) {}
}

/// A configured, not yet started, read loop.
pub(crate) struct ReadLoop {
    transport: Arc<dyn LogTransport>,
    provisioner: Arc<TopicProvisioner>,
    subscription: Subscription,
    poll_timeout: Duration,
    idle_delay: Duration,
    retry: RetryPolicy,
}

impl ReadLoop {
    pub(crate) fn new(publisher: &Publisher, subscription: Subscription) -> Self {
        Self {
            transport: Arc::clone(publisher.transport()),
            provisioner: Arc::clone(publisher.provisioner()),
            subscription,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            idle_delay: IDLE_DELAY,
            retry: RetryPolicy::default(),
        }
    }

    pub(crate) const fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub(crate) fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub(crate) fn spawn<S: RecordSink>(self, sink: S) -> LoopHandle {
        let name = self.subscription.topic.clone();
        LoopHandle::spawn(name, move |control| self.run(control, sink))
    }

    async fn open(&self) -> Result<Box<dyn LogConsumer>, TransportError> {
        let transport = &self.transport;
        let provisioner = &self.provisioner;
        let subscription = &self.subscription;

        retry_transient(&self.retry, || async move {
            provisioner.ensure(&subscription.topic).await?;
            transport.subscribe(subscription.clone()).await
        })
        .await
    }

    async fn run<S: RecordSink>(self, mut control: LoopControl, mut sink: S) {
        let topic = self.subscription.topic.clone();

        let mut consumer = match self.open().await {
            Ok(consumer) => consumer,
            Err(e) => {
                tracing::error!(topic = %topic, error = %e, "Could not open consumer, read loop faulted");
                control.fault(e.to_string());
                return;
            }
        };

        control.set(LoopState::Subscribed);
        tracing::info!(
            topic = %topic,
            group_id = %self.subscription.group_id,
            start = self.subscription.start.as_str(),
            "Read loop subscribed"
        );

        let mut failures = 0usize;
        while !control.stop_requested() {
            control.set(LoopState::Idle);

            match consumer.poll(self.poll_timeout).await {
                Ok(Some(record)) => {
                    failures = 0;
                    control.set(LoopState::Processing);
                    tracing::debug!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        "Record received"
                    );

                    sink.handle(&record).await;

                    if let Err(e) = consumer.commit(&record) {
                        if e.is_fatal() {
                            tracing::error!(topic = %topic, error = %e, "Fatal commit failure, read loop faulted");
                            control.fault(e.to_string());
                            return;
                        }
                        tracing::warn!(
                            topic = %topic,
                            partition = record.partition,
                            offset = record.offset,
                            error = %e,
                            "Failed to commit offset"
                        );
                    }
                }
                Ok(None) => {
                    if control.sleep(self.idle_delay).await {
                        break;
                    }
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!(topic = %topic, error = %e, "Fatal poll failure, read loop faulted");
                    control.fault(e.to_string());
                    return;
                }
                Err(e) => {
                    let delay = self.retry.delay_for_attempt(failures);
                    failures = failures.saturating_add(1);
                    RetryMetrics::record_attempt();
                    tracing::warn!(
                        topic = %topic,
                        consecutive_failures = failures,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Poll failed, backing off"
                    );

                    sink.poll_failed(&e);

                    if control.sleep(delay).await {
                        break;
                    }
                }
            }
        }

        control.finish();
        tracing::info!(topic = %topic, "Read loop stopped");
    }
}
