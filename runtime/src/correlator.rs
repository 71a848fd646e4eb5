//! Response correlation: turns replies on a response topic back into the
//! completion of the call that sent the command.
//!
//! # How it works
//!
//! - A caller [`register`](ResponseCorrelator::register)s its correlation id
//!   **before** publishing the command, getting a [`PendingReply`].
//! - The first registration for a response topic starts one read loop for it,
//!   with its own table of waiters: correlation ids are scoped to the topic.
//!   The loop reads from the latest offset in a consumer group unique to this
//!   correlator, so concurrent instances of a service each see every reply.
//! - Each reply is matched by correlation id. No waiter means the reply is late,
//!   duplicated, or meant for another instance: it is discarded.
//! - [`PendingReply::wait`] races the reply against a timer. On timeout, or when
//!   the `PendingReply` is dropped, the waiter is removed.
//!
//! ```text
//! register("c1") ─► waiters{c1} ─► publish CREATE ─► ... ─► CREATED_RESPONSE(c1)
//!                                                                 │
//!              PendingReply::wait ◄──── oneshot ◄── waiters.take(c1)
//! ```

use crate::error::{RemoteFailure, RequestError};
use crate::lifecycle::{LoopHandle, LoopState};
use crate::metrics::RequestMetrics;
use crate::publisher::Publisher;
use crate::read_loop::{ReadLoop, RecordSink};
use crate::retry::RetryPolicy;
use entity_bridge_core::config::DEFAULT_POLL_TIMEOUT;
use entity_bridge_core::envelope::payload_text;
use entity_bridge_core::{
    Envelope, EventType, LogRecord, StartOffset, Subscription, TransportError,
};
use serde_json::Value;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;

/// A successful reply, payload not yet interpreted.
#[derive(Debug, Clone, PartialEq)]
pub struct RawReply {
    /// Reply kind.
    pub event_type: EventType,
    /// Reply payload as received.
    pub payload: Value,
}

type Delivery = Result<RawReply, RemoteFailure>;

struct Slot {
    token: u64,
    sender: oneshot::Sender<Delivery>,
}

#[derive(Default)]
struct Waiters {
    next_token: AtomicU64,
    slots: Mutex<HashMap<String, Slot>>,
}

impl Waiters {
    fn insert(&self, correlation_id: &str) -> Result<(u64, oneshot::Receiver<Delivery>), RequestError> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.contains_key(correlation_id) {
            return Err(RequestError::DuplicateCorrelationId(correlation_id.to_string()));
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        slots.insert(correlation_id.to_string(), Slot { token, sender });
        Ok((token, receiver))
    }

    fn take(&self, correlation_id: &str) -> Option<oneshot::Sender<Delivery>> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(correlation_id)
            .map(|slot| slot.sender)
    }

    /// Remove the waiter only if it is still the one registered under `token`.
    fn remove(&self, correlation_id: &str, token: u64) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.get(correlation_id).is_some_and(|slot| slot.token == token) {
            slots.remove(correlation_id);
            true
        } else {
            false
        }
    }

    fn clear(&self) -> usize {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let count = slots.len();
        slots.clear();
        count
    }

    fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// One response topic's read loop and the callers waiting on it.
struct Listener {
    handle: LoopHandle,
    waiters: Arc<Waiters>,
}

/// Matches replies to registered callers.
///
/// Construct one per process (or per test), share it through an `Arc`, and call
/// [`shutdown`](Self::shutdown) when done.
pub struct ResponseCorrelator {
    publisher: Publisher,
    group_id: String,
    poll_timeout: Duration,
    retry: RetryPolicy,
    listeners: Mutex<HashMap<String, Listener>>,
    closed: AtomicBool,
}

impl ResponseCorrelator {
    /// Create a correlator for `service_name`.
    ///
    /// The consumer group is `{service_name}-responses-{uuid}`.
    #[must_use]
    pub fn new(publisher: Publisher, service_name: &str) -> Self {
        Self {
            publisher,
            group_id: format!("{service_name}-responses-{}", uuid::Uuid::new_v4()),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            retry: RetryPolicy::default(),
            listeners: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Set the bounded wait of each poll.
    #[must_use]
    pub const fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Set the retry policy for opening consumers and backing off after poll
    /// failures.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Consumer group used for every response topic.
    #[must_use]
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Number of callers currently waiting, across all response topics.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock_listeners()
            .values()
            .map(|listener| listener.waiters.len())
            .sum()
    }

    /// State of the read loop for `response_topic`, if one was started.
    #[must_use]
    pub fn listener_state(&self, response_topic: &str) -> Option<LoopState> {
        self.lock_listeners()
            .get(response_topic)
            .map(|listener| listener.handle.state())
    }

    /// Register a waiter for `correlation_id` on `response_topic`.
    ///
    /// Starts the topic's read loop on first use and returns once it is
    /// subscribed. Call this before publishing the command. Correlation ids
    /// are scoped to their response topic.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Shutdown`] after [`shutdown`](Self::shutdown)
    /// - [`RequestError::DuplicateCorrelationId`] if the id is already waiting
    ///   on this topic
    /// - [`RequestError::Transport`] if the read loop cannot subscribe
    pub async fn register(
        &self,
        response_topic: &str,
        correlation_id: &str,
    ) -> Result<PendingReply, RequestError> {
        let (pending, mut state) = {
            let mut listeners = self.lock_listeners();
            if self.closed.load(Ordering::Acquire) {
                return Err(RequestError::Shutdown);
            }

            let listener = self.listener(&mut listeners, response_topic);
            let (token, receiver) = listener.waiters.insert(correlation_id)?;
            let pending = PendingReply {
                correlation_id: correlation_id.to_string(),
                token,
                waiters: Arc::clone(&listener.waiters),
                receiver,
            };
            (pending, listener.handle.watch_state())
        };

        // Concurrent first callers on a topic all wait on the same start.
        let observed = state
            .wait_for(|s| *s != LoopState::Starting)
            .await
            .map(|s| s.clone());
        let started = observed.unwrap_or_else(|_| state.borrow().clone());
        if let LoopState::Faulted(reason) = started {
            self.discard_listener(response_topic, &state);
            return Err(RequestError::Transport(TransportError::SubscriptionFailed {
                topic: response_topic.to_string(),
                reason,
            }));
        }

        Ok(pending)
    }

    fn lock_listeners(&self) -> MutexGuard<'_, HashMap<String, Listener>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The running listener for `response_topic`, spawned (or respawned after
    /// a fault) if needed. Waiters survive a respawn.
    fn listener<'a>(
        &self,
        listeners: &'a mut HashMap<String, Listener>,
        response_topic: &str,
    ) -> &'a Listener {
        match listeners.entry(response_topic.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().handle.state().is_terminal() {
                    tracing::warn!(
                        topic = %response_topic,
                        state = ?entry.get().handle.state(),
                        "Restarting response listener"
                    );
                    let waiters = Arc::clone(&entry.get().waiters);
                    let handle = self.spawn_listener(response_topic, &waiters);
                    entry.insert(Listener { handle, waiters });
                }
                entry.into_mut()
            }
            Entry::Vacant(entry) => {
                let waiters = Arc::new(Waiters::default());
                let handle = self.spawn_listener(response_topic, &waiters);
                entry.insert(Listener { handle, waiters })
            }
        }
    }

    fn spawn_listener(&self, response_topic: &str, waiters: &Arc<Waiters>) -> LoopHandle {
        tracing::info!(topic = %response_topic, group_id = %self.group_id, "Starting response listener");
        let subscription = Subscription::new(response_topic, &self.group_id, StartOffset::Latest);
        ReadLoop::new(&self.publisher, subscription)
            .poll_timeout(self.poll_timeout)
            .retry_policy(self.retry.clone())
            .spawn(ReplyRouter {
                waiters: Arc::clone(waiters),
            })
    }

    /// Forget a listener that failed to start, unless it was already replaced.
    fn discard_listener(&self, response_topic: &str, started: &watch::Receiver<LoopState>) {
        let mut listeners = self.lock_listeners();
        let same = listeners
            .get(response_topic)
            .is_some_and(|listener| listener.handle.watch_state().same_channel(started));
        if same {
            listeners.remove(response_topic);
        }
    }

    /// Stop every read loop and fail all pending waiters with
    /// [`RequestError::Shutdown`]. Idempotent.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let drained: Vec<Listener> = self.lock_listeners().drain().map(|(_, l)| l).collect();
        let stopped = futures::future::join_all(drained.into_iter().map(|listener| async move {
            let topic = listener.handle.name().to_string();
            let state = listener.handle.stop().await;
            (topic, state, listener.waiters.clear())
        }))
        .await;

        let mut abandoned = 0;
        for (topic, state, cleared) in stopped {
            tracing::debug!(topic = %topic, state = ?state, "Response listener stopped");
            abandoned += cleared;
        }
        tracing::info!(abandoned, "Response correlator shut down");
    }
}

/// A registered waiter. Dropping it withdraws the registration.
pub struct PendingReply {
    correlation_id: String,
    token: u64,
    waiters: Arc<Waiters>,
    receiver: oneshot::Receiver<Delivery>,
}

impl PendingReply {
    /// Correlation id this waiter answers to.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Wait up to `timeout` for the reply.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Remote`] for an `ERROR_RESPONSE` reply
    /// - [`RequestError::Timeout`] if nothing arrived in time
    /// - [`RequestError::Shutdown`] if the correlator stopped first
    pub async fn wait(self, timeout: Duration) -> Result<RawReply, RequestError> {
        self.wait_until(Instant::now() + timeout, timeout).await
    }

    /// Wait until `deadline` for the reply. `timeout` is the request's whole
    /// budget and is what a [`RequestError::Timeout`] reports.
    ///
    /// # Errors
    ///
    /// See [`wait`](Self::wait).
    pub async fn wait_until(
        mut self,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<RawReply, RequestError> {
        let delivery = match tokio::time::timeout_at(deadline, &mut self.receiver).await {
            Ok(Ok(delivery)) => delivery,
            Ok(Err(_)) => return Err(RequestError::Shutdown),
            Err(_) => {
                if self.waiters.remove(&self.correlation_id, self.token) {
                    RequestMetrics::record_timeout();
                    tracing::warn!(
                        correlation_id = %self.correlation_id,
                        timeout_ms = timeout.as_millis(),
                        "Request timed out"
                    );
                    return Err(RequestError::Timeout {
                        correlation_id: self.correlation_id.clone(),
                        timeout,
                    });
                }
                // Resolved between the timer firing and the removal.
                match self.receiver.try_recv() {
                    Ok(delivery) => delivery,
                    Err(_) => return Err(RequestError::Shutdown),
                }
            }
        };

        delivery.map_err(|failure| {
            RequestMetrics::record_remote_error();
            RequestError::Remote(failure)
        })
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.waiters.remove(&self.correlation_id, self.token);
    }
}

struct ReplyRouter {
    waiters: Arc<Waiters>,
}

impl ReplyRouter {
    fn route(&self, record: &LogRecord) {
        let envelope = match Envelope::from_slice(record.body()) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(topic = %record.topic, offset = record.offset, error = %e, "Undecodable reply skipped");
                return;
            }
        };

        let Some(correlation_id) = envelope.correlation() else {
            tracing::warn!(topic = %record.topic, offset = record.offset, "Reply without correlation id skipped");
            return;
        };

        let Some(sender) = self.waiters.take(correlation_id) else {
            RequestMetrics::record_discarded();
            tracing::debug!(
                topic = %record.topic,
                correlation_id = %correlation_id,
                event_type = %envelope.event_type,
                "No waiter for reply, discarded"
            );
            return;
        };

        let delivery = if envelope.event_type == EventType::ErrorResponse {
            Err(RemoteFailure(payload_text(&envelope.payload)))
        } else {
            Ok(RawReply {
                event_type: envelope.event_type,
                payload: envelope.payload.clone(),
            })
        };

        tracing::debug!(
            correlation_id = %correlation_id,
            event_type = %envelope.event_type,
            "Reply matched"
        );
        if sender.send(delivery).is_err() {
            tracing::debug!(correlation_id = %correlation_id, "Caller gone before reply was delivered");
        }
    }
}

impl RecordSink for ReplyRouter {
    async fn handle(&mut self, record: &LogRecord) {
        self.route(record);
    }
}
