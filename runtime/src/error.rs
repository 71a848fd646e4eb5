//! Caller-visible request failures.

use entity_bridge_core::{CodecError, EventType, TransportError};
use std::time::Duration;
use thiserror::Error;

/// Text carried by an `ERROR_RESPONSE` reply.
///
/// Kept apart from success payloads; never decoded as an entity.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct RemoteFailure(pub String);

/// Errors a requester can see.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// No reply arrived within the timeout.
    #[error("Request {correlation_id} timed out after {timeout:?}")]
    Timeout {
        /// The call's correlation id
        correlation_id: String,
        /// The timeout that elapsed
        timeout: Duration,
    },

    /// The owning service answered with `ERROR_RESPONSE`.
    #[error("Remote error: {0}")]
    Remote(RemoteFailure),

    /// The command could not be published or the reply topic not read.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The command could not be encoded, or the reply payload did not have the
    /// expected shape.
    #[error("Decode error: {0}")]
    Decode(String),

    /// The reply kind does not answer the command that was sent.
    #[error("Unexpected reply {actual} to {command}")]
    UnexpectedReply {
        /// Command that was sent
        command: EventType,
        /// Reply kind received
        actual: EventType,
    },

    /// Another call with the same correlation id is still waiting.
    #[error("Correlation id {0} is already awaiting a reply")]
    DuplicateCorrelationId(String),

    /// The correlator stopped before a reply arrived.
    #[error("Response correlator shut down")]
    Shutdown,
}

impl From<CodecError> for RequestError {
    fn from(error: CodecError) -> Self {
        Self::Decode(error.to_string())
    }
}

impl From<RemoteFailure> for RequestError {
    fn from(failure: RemoteFailure) -> Self {
        Self::Remote(failure)
    }
}

impl RequestError {
    /// The remote error text, for `Remote` failures.
    #[must_use]
    pub fn remote_message(&self) -> Option<&str> {
        match self {
            Self::Remote(RemoteFailure(message)) => Some(message),
            _ => None,
        }
    }
}
