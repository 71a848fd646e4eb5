//! The command/response envelope and its JSON codec.
//!
//! Every message exchanged over the log, in either direction, is an [`Envelope`].
//! A command and its single reply share a `correlationId`; every physical message
//! gets its own `eventId`.
//!
//! # Wire format
//!
//! ```json
//! {
//!   "eventId": "9b0c…",
//!   "eventType": "CREATE",
//!   "modelType": "Order",
//!   "payload": { "id": 0, "amount": 1000 },
//!   "correlationId": "c1",
//!   "timestamp": "2025-01-01T00:00:00Z"
//! }
//! ```
//!
//! Field names are written in camelCase. On read they are matched
//! case-insensitively and unknown fields are ignored, so peers written against
//! older or newer envelope revisions keep interoperating.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced while decoding or encoding an [`Envelope`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The message body was absent or blank.
    #[error("Message body is empty")]
    EmptyBody,

    /// The body was not a JSON object.
    #[error("Invalid envelope JSON: {0}")]
    InvalidJson(String),

    /// A required field was missing or had the wrong JSON type.
    #[error("Envelope field '{0}' is missing or invalid")]
    InvalidField(&'static str),

    /// `eventType` named a kind this bridge does not know.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// Encoding failed.
    #[error("Failed to encode envelope: {0}")]
    Encode(String),
}

/// Kind of an envelope: one of five commands or one of six responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// Create an entity.
    Create,
    /// Update an existing entity.
    Update,
    /// Delete an entity by id.
    Delete,
    /// Fetch the whole collection.
    GetAll,
    /// Fetch one entity by id.
    GetById,
    /// Reply to [`EventType::Create`].
    CreatedResponse,
    /// Reply to [`EventType::Update`].
    UpdatedResponse,
    /// Reply to [`EventType::Delete`].
    DeletedResponse,
    /// Reply to [`EventType::GetAll`].
    GetAllResponse,
    /// Reply to [`EventType::GetById`].
    GetByIdResponse,
    /// Failure reply to any command; the payload is the error text.
    ErrorResponse,
}

impl EventType {
    /// All kinds, commands first.
    pub const ALL: [Self; 11] = [
        Self::Create,
        Self::Update,
        Self::Delete,
        Self::GetAll,
        Self::GetById,
        Self::CreatedResponse,
        Self::UpdatedResponse,
        Self::DeletedResponse,
        Self::GetAllResponse,
        Self::GetByIdResponse,
        Self::ErrorResponse,
    ];

    /// Wire name, e.g. `"GET_BY_ID_RESPONSE"`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::GetAll => "GET_ALL",
            Self::GetById => "GET_BY_ID",
            Self::CreatedResponse => "CREATED_RESPONSE",
            Self::UpdatedResponse => "UPDATED_RESPONSE",
            Self::DeletedResponse => "DELETED_RESPONSE",
            Self::GetAllResponse => "GET_ALL_RESPONSE",
            Self::GetByIdResponse => "GET_BY_ID_RESPONSE",
            Self::ErrorResponse => "ERROR_RESPONSE",
        }
    }

    /// `true` for the five command kinds.
    #[must_use]
    pub const fn is_command(self) -> bool {
        matches!(
            self,
            Self::Create | Self::Update | Self::Delete | Self::GetAll | Self::GetById
        )
    }

    /// The success reply kind for a command, `None` for response kinds.
    #[must_use]
    pub const fn success_reply(self) -> Option<Self> {
        match self {
            Self::Create => Some(Self::CreatedResponse),
            Self::Update => Some(Self::UpdatedResponse),
            Self::Delete => Some(Self::DeletedResponse),
            Self::GetAll => Some(Self::GetAllResponse),
            Self::GetById => Some(Self::GetByIdResponse),
            Self::CreatedResponse
            | Self::UpdatedResponse
            | Self::DeletedResponse
            | Self::GetAllResponse
            | Self::GetByIdResponse
            | Self::ErrorResponse => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| CodecError::UnknownEventType(s.to_string()))
    }
}

/// The single wire structure carrying a command or a response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Identifies this physical message.
    pub event_id: String,
    /// Command or response kind.
    pub event_type: EventType,
    /// Name of the entity type this envelope concerns.
    pub model_type: String,
    /// Command argument or response value.
    pub payload: Value,
    /// Logical request id shared by a command and its reply.
    pub correlation_id: Option<String>,
    /// Creation time, informational only.
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Create an envelope with a fresh `eventId`.
    #[must_use]
    pub fn new(
        event_type: EventType,
        model_type: impl Into<String>,
        payload: Value,
        correlation_id: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: new_message_id(),
            event_type,
            model_type: model_type.into(),
            payload,
            correlation_id: Some(correlation_id.into()),
            timestamp,
        }
    }

    /// Build the reply to this envelope, keeping its correlation id and model type.
    #[must_use]
    pub fn reply(&self, event_type: EventType, payload: Value, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_id: new_message_id(),
            event_type,
            model_type: self.model_type.clone(),
            payload,
            correlation_id: self.correlation_id.clone(),
            timestamp,
        }
    }

    /// Correlation id if present and non-empty.
    #[must_use]
    pub fn correlation(&self) -> Option<&str> {
        self.correlation_id.as_deref().filter(|id| !id.is_empty())
    }

    /// Serialize to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Decode an envelope, matching field names case-insensitively.
    ///
    /// `eventId` and `timestamp` are optional on read; a missing `eventId` is
    /// replaced with a fresh one and a missing `timestamp` with the Unix epoch.
    /// A missing `payload` decodes as `null`.
    ///
    /// # Errors
    ///
    /// - [`CodecError::EmptyBody`] for an empty or whitespace-only body
    /// - [`CodecError::InvalidJson`] if the body is not a JSON object
    /// - [`CodecError::InvalidField`] if `eventType` or `modelType` is missing
    /// - [`CodecError::UnknownEventType`] for an unrecognised `eventType`
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(CodecError::EmptyBody);
        }

        let object: Map<String, Value> =
            serde_json::from_slice(bytes).map_err(|e| CodecError::InvalidJson(e.to_string()))?;
        let mut fields = Fields(object);

        let event_type = match fields.take("eventType") {
            Some(Value::String(kind)) => kind.parse()?,
            _ => return Err(CodecError::InvalidField("eventType")),
        };
        let model_type = match fields.take("modelType") {
            Some(Value::String(model)) => model,
            _ => return Err(CodecError::InvalidField("modelType")),
        };
        let correlation_id = match fields.take("correlationId") {
            Some(Value::String(id)) => Some(id),
            Some(Value::Null) | None => None,
            Some(_) => return Err(CodecError::InvalidField("correlationId")),
        };
        let event_id = match fields.take("eventId") {
            Some(Value::String(id)) => id,
            Some(Value::Null) | None => new_message_id(),
            Some(_) => return Err(CodecError::InvalidField("eventId")),
        };
        let timestamp = match fields.take("timestamp") {
            Some(Value::String(raw)) => DateTime::parse_from_rfc3339(&raw)
                .map_err(|_| CodecError::InvalidField("timestamp"))?
                .with_timezone(&Utc),
            Some(Value::Null) | None => DateTime::<Utc>::default(),
            Some(_) => return Err(CodecError::InvalidField("timestamp")),
        };
        let payload = fields.take("payload").unwrap_or(Value::Null);

        Ok(Self {
            event_id,
            event_type,
            model_type,
            payload,
            correlation_id,
            timestamp,
        })
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Envelope {{ type: {}, model: {}, correlation: {} }}",
            self.event_type,
            self.model_type,
            self.correlation().unwrap_or("<none>")
        )
    }
}

struct Fields(Map<String, Value>);

impl Fields {
    fn take(&mut self, name: &str) -> Option<Value> {
        let key = self
            .0
            .keys()
            .find(|key| key.eq_ignore_ascii_case(name))?
            .clone();
        self.0.remove(&key)
    }
}

/// A fresh opaque id for a message or a logical call.
#[must_use]
pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Render a payload as human-readable error text.
///
/// String payloads are returned verbatim; anything else is rendered as JSON.
#[must_use]
pub fn payload_text(payload: &Value) -> String {
    match payload {
        Value::String(text) => text.clone(),
        Value::Null => "Unknown error".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn ts() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn encodes_camel_case_fields_and_wire_event_names() {
        let envelope = Envelope::new(
            EventType::GetById,
            "Order",
            json!("42"),
            "corr-1",
            ts(),
        );
        let value: Value = serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();

        assert_eq!(value["eventType"], "GET_BY_ID");
        assert_eq!(value["modelType"], "Order");
        assert_eq!(value["correlationId"], "corr-1");
        assert_eq!(value["payload"], "42");
        assert!(value["eventId"].is_string());
        assert_eq!(value["timestamp"], "2025-01-01T00:00:00Z");
    }

    #[test]
    fn decodes_pascal_case_fields_from_other_services() {
        let body = br#"{
            "EventType": "CREATED_RESPONSE",
            "ModelType": "Order",
            "Payload": {"id": 42, "amount": 1000},
            "CorrelationId": "c1",
            "EventId": "e1",
            "Timestamp": "2025-01-01T00:00:00Z",
            "SomethingNew": true
        }"#;

        let envelope = Envelope::from_slice(body).unwrap();
        assert_eq!(envelope.event_type, EventType::CreatedResponse);
        assert_eq!(envelope.event_id, "e1");
        assert_eq!(envelope.correlation(), Some("c1"));
        assert_eq!(envelope.payload["id"], 42);
        assert_eq!(envelope.timestamp, ts());
    }

    #[test]
    fn missing_optional_fields_get_defaults() {
        let envelope =
            Envelope::from_slice(br#"{"eventType":"GET_ALL","modelType":"Order"}"#).unwrap();
        assert_eq!(envelope.payload, Value::Null);
        assert_eq!(envelope.correlation(), None);
        assert!(!envelope.event_id.is_empty());
    }

    #[test]
    fn empty_correlation_id_counts_as_absent() {
        let envelope = Envelope::from_slice(
            br#"{"eventType":"GET_ALL","modelType":"Order","correlationId":""}"#,
        )
        .unwrap();
        assert_eq!(envelope.correlation(), None);
    }

    #[test]
    fn rejects_blank_and_malformed_bodies() {
        assert_eq!(Envelope::from_slice(b"  \n"), Err(CodecError::EmptyBody));
        assert!(matches!(
            Envelope::from_slice(b"not json"),
            Err(CodecError::InvalidJson(_))
        ));
        assert!(matches!(
            Envelope::from_slice(b"[1,2,3]"),
            Err(CodecError::InvalidJson(_))
        ));
        assert_eq!(
            Envelope::from_slice(br#"{"modelType":"Order"}"#),
            Err(CodecError::InvalidField("eventType"))
        );
    }

    #[test]
    fn unknown_event_type_is_reported_by_name() {
        let err = Envelope::from_slice(br#"{"eventType":"ARCHIVE","modelType":"Order"}"#)
            .unwrap_err();
        assert_eq!(err, CodecError::UnknownEventType("ARCHIVE".to_string()));
    }

    #[test]
    fn reply_keeps_correlation_and_model() {
        let command = Envelope::new(EventType::Delete, "Order", json!("7"), "c9", ts());
        let reply = command.reply(EventType::DeletedResponse, json!("7"), ts());

        assert_eq!(reply.correlation(), Some("c9"));
        assert_eq!(reply.model_type, "Order");
        assert_ne!(reply.event_id, command.event_id);
    }

    #[test]
    fn success_reply_pairs_commands_only() {
        assert_eq!(
            EventType::GetAll.success_reply(),
            Some(EventType::GetAllResponse)
        );
        assert_eq!(EventType::ErrorResponse.success_reply(), None);
        assert!(EventType::ALL
            .iter()
            .filter(|kind| kind.is_command())
            .all(|kind| kind.success_reply().is_some()));
    }

    #[test]
    fn payload_text_prefers_plain_strings() {
        assert_eq!(payload_text(&json!("boom")), "boom");
        assert_eq!(payload_text(&json!({"code": 3})), r#"{"code":3}"#);
    }

    fn flip_case(name: &str, mask: &[bool]) -> String {
        name.chars()
            .zip(mask.iter().cycle())
            .map(|(c, upper)| {
                if *upper {
                    c.to_ascii_uppercase()
                } else {
                    c.to_ascii_lowercase()
                }
            })
            .collect()
    }

    proptest! {
        #[test]
        fn field_names_match_in_any_case(mask in proptest::collection::vec(any::<bool>(), 1..16)) {
            let body = json!({
                flip_case("eventType", &mask): "UPDATE",
                flip_case("modelType", &mask): "Order",
                flip_case("correlationId", &mask): "abc",
                flip_case("payload", &mask): {"id": 1},
            });
            let envelope = Envelope::from_slice(body.to_string().as_bytes()).unwrap();
            prop_assert_eq!(envelope.event_type, EventType::Update);
            prop_assert_eq!(envelope.correlation(), Some("abc"));
            prop_assert_eq!(&envelope.payload["id"], &json!(1));
        }
    }
}
