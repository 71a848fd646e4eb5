//! Request-style access to entities owned by another service.
//!
//! ```rust,ignore
//! let orders: EntityClient<Order> = bridge.client("order");
//!
//! let created = orders.create(Order { id: 0, amount: 1000 }).await?;
//! let found = orders.get_by_id(created.id).await?;
//! ```
//!
//! Every call registers a waiter, publishes one command keyed by its
//! correlation id, and waits for the matching reply or the timeout.

use crate::correlator::{RawReply, ResponseCorrelator};
use crate::error::RequestError;
use crate::metrics::RequestMetrics;
use crate::publisher::Publisher;
use entity_bridge_core::config::DEFAULT_REQUEST_TIMEOUT;
use entity_bridge_core::entity::parse_id;
use entity_bridge_core::envelope::new_message_id;
use entity_bridge_core::{Clock, Entity, Envelope, EventType, TopicRoute};
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// A command for entity `E`.
#[derive(Debug, Clone)]
pub enum Command<E: Entity> {
    /// Create `E`; storage may assign its id.
    Create(E),
    /// Overwrite every field but the id of the stored record with the same id.
    Update(E),
    /// Delete by id.
    Delete(E::Id),
    /// Fetch every record.
    GetAll,
    /// Fetch one record by id.
    GetById(E::Id),
}

impl<E: Entity> Command<E> {
    /// Wire kind of this command.
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        match self {
            Self::Create(_) => EventType::Create,
            Self::Update(_) => EventType::Update,
            Self::Delete(_) => EventType::Delete,
            Self::GetAll => EventType::GetAll,
            Self::GetById(_) => EventType::GetById,
        }
    }

    fn payload(&self) -> Result<Value, RequestError> {
        let encoded = match self {
            Self::Create(entity) | Self::Update(entity) => serde_json::to_value(entity),
            Self::Delete(id) | Self::GetById(id) => serde_json::to_value(id),
            Self::GetAll => Ok(Value::Null),
        };
        encoded.map_err(|e| RequestError::Decode(e.to_string()))
    }
}

/// A decoded successful reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply<E: Entity> {
    /// The stored entity, with any assigned id.
    Created(E),
    /// The entity after the merge.
    Updated(E),
    /// The deleted id.
    Deleted(E::Id),
    /// The whole collection.
    All(Vec<E>),
    /// The entity, or `None` if the owner has no record with that id.
    Found(Option<E>),
}

impl<E: Entity> Reply<E> {
    /// Wire kind this reply was decoded from.
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        match self {
            Self::Created(_) => EventType::CreatedResponse,
            Self::Updated(_) => EventType::UpdatedResponse,
            Self::Deleted(_) => EventType::DeletedResponse,
            Self::All(_) => EventType::GetAllResponse,
            Self::Found(_) => EventType::GetByIdResponse,
        }
    }
}

/// Per-call overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Correlation id to use instead of a fresh one.
    pub correlation_id: Option<String>,
    /// Timeout to use instead of the client's.
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    /// Use `correlation_id` for this call.
    #[must_use]
    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Wait at most `timeout` for this call.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Sends commands about `E` from this service to the service that owns `E`.
pub struct EntityClient<E: Entity> {
    route: TopicRoute,
    publisher: Publisher,
    correlator: Arc<ResponseCorrelator>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Clone for EntityClient<E> {
    fn clone(&self) -> Self {
        Self {
            route: self.route.clone(),
            publisher: self.publisher.clone(),
            correlator: Arc::clone(&self.correlator),
            clock: Arc::clone(&self.clock),
            timeout: self.timeout,
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> EntityClient<E> {
    /// Create a client from `current_service` to `destination_service`.
    #[must_use]
    pub fn new(
        current_service: &str,
        destination_service: &str,
        publisher: Publisher,
        correlator: Arc<ResponseCorrelator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            route: TopicRoute::between(current_service, destination_service, E::MODEL_TYPE),
            publisher,
            correlator,
            clock,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            _entity: PhantomData,
        }
    }

    /// Set the default timeout of every call.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Command and response topics of this client.
    #[must_use]
    pub const fn route(&self) -> &TopicRoute {
        &self.route
    }

    /// Create `entity` remotely and return it as stored.
    ///
    /// # Errors
    ///
    /// See [`EntityClient::request`].
    pub async fn create(&self, entity: E) -> Result<E, RequestError> {
        match self.request(Command::Create(entity), RequestOptions::default()).await? {
            Reply::Created(stored) => Ok(stored),
            other => Err(unexpected(EventType::Create, &other)),
        }
    }

    /// Update `entity` remotely and return the merged result.
    ///
    /// # Errors
    ///
    /// [`RequestError::Remote`] with `"Entity with ID {id} not found."` if the
    /// owner has no such record; otherwise see [`EntityClient::request`].
    pub async fn update(&self, entity: E) -> Result<E, RequestError> {
        match self.request(Command::Update(entity), RequestOptions::default()).await? {
            Reply::Updated(stored) => Ok(stored),
            other => Err(unexpected(EventType::Update, &other)),
        }
    }

    /// Delete by id and return the deleted id.
    ///
    /// # Errors
    ///
    /// [`RequestError::Remote`] if the owner has no such record; otherwise see
    /// [`EntityClient::request`].
    pub async fn delete(&self, id: E::Id) -> Result<E::Id, RequestError> {
        match self.request(Command::Delete(id), RequestOptions::default()).await? {
            Reply::Deleted(id) => Ok(id),
            other => Err(unexpected(EventType::Delete, &other)),
        }
    }

    /// Fetch every record.
    ///
    /// # Errors
    ///
    /// See [`EntityClient::request`].
    pub async fn get_all(&self) -> Result<Vec<E>, RequestError> {
        match self.request(Command::GetAll, RequestOptions::default()).await? {
            Reply::All(all) => Ok(all),
            other => Err(unexpected(EventType::GetAll, &other)),
        }
    }

    /// Fetch one record; `Ok(None)` if it does not exist.
    ///
    /// # Errors
    ///
    /// See [`EntityClient::request`].
    pub async fn get_by_id(&self, id: E::Id) -> Result<Option<E>, RequestError> {
        match self.request(Command::GetById(id), RequestOptions::default()).await? {
            Reply::Found(found) => Ok(found),
            other => Err(unexpected(EventType::GetById, &other)),
        }
    }

    /// Send `command` and wait for its reply.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Timeout`] if no reply arrived in time
    /// - [`RequestError::Remote`] if the owner answered `ERROR_RESPONSE`
    /// - [`RequestError::Transport`] if the command could not be published
    /// - [`RequestError::Decode`] / [`RequestError::UnexpectedReply`] for a
    ///   reply that does not fit the command
    /// - [`RequestError::DuplicateCorrelationId`] / [`RequestError::Shutdown`]
    ///   from the correlator
    pub async fn request(
        &self,
        command: Command<E>,
        options: RequestOptions,
    ) -> Result<Reply<E>, RequestError> {
        let correlation_id = options.correlation_id.unwrap_or_else(new_message_id);
        let timeout = options.timeout.unwrap_or(self.timeout);
        let kind = command.event_type();
        let payload = command.payload()?;

        // One deadline covers listener start, publish and the wait for the reply.
        let deadline = Instant::now() + timeout;
        let sent = tokio::time::timeout_at(deadline, async {
            let pending = self
                .correlator
                .register(&self.route.response_topic, &correlation_id)
                .await?;

            let envelope = Envelope::new(kind, E::MODEL_TYPE, payload, &correlation_id, self.clock.now());
            let body = envelope.to_bytes()?;
            self.publisher
                .publish(&self.route.command_topic, &correlation_id, &body)
                .await?;
            Ok::<_, RequestError>(pending)
        })
        .await;

        let Ok(sent) = sent else {
            RequestMetrics::record_timeout();
            tracing::warn!(
                topic = %self.route.command_topic,
                correlation_id = %correlation_id,
                timeout_ms = timeout.as_millis(),
                "Request timed out before the command was sent"
            );
            return Err(RequestError::Timeout {
                correlation_id,
                timeout,
            });
        };
        let pending = sent?;

        RequestMetrics::record_sent(E::MODEL_TYPE);
        tracing::debug!(
            topic = %self.route.command_topic,
            correlation_id = %correlation_id,
            event_type = %kind,
            "Command sent"
        );

        let reply = pending.wait_until(deadline, timeout).await?;
        decode_reply(kind, reply)
    }
}

fn unexpected<E: Entity>(command: EventType, reply: &Reply<E>) -> RequestError {
    RequestError::UnexpectedReply {
        command,
        actual: reply.event_type(),
    }
}

fn decode_reply<E: Entity>(command: EventType, reply: RawReply) -> Result<Reply<E>, RequestError> {
    if command.success_reply() != Some(reply.event_type) {
        return Err(RequestError::UnexpectedReply {
            command,
            actual: reply.event_type,
        });
    }

    let decoded = match reply.event_type {
        EventType::CreatedResponse => Reply::Created(entity_from(reply.payload)?),
        EventType::UpdatedResponse => Reply::Updated(entity_from(reply.payload)?),
        EventType::DeletedResponse => Reply::Deleted(parse_id::<E>(&reply.payload).ok_or_else(
            || RequestError::Decode(format!("{} is not a valid id", reply.payload)),
        )?),
        EventType::GetAllResponse => Reply::All(entity_from(reply.payload)?),
        EventType::GetByIdResponse => Reply::Found(entity_from(reply.payload)?),
        other => {
            return Err(RequestError::UnexpectedReply {
                command,
                actual: other,
            });
        }
    };
    Ok(decoded)
}

fn entity_from<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, RequestError> {
    serde_json::from_value(payload).map_err(|e| RequestError::Decode(e.to_string()))
}
