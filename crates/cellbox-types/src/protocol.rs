//! Host ⇄ context wire protocol.
//!
//! Every message between the host and an execution context is an
//! [`Envelope`]: `{ requestId, type, payload }`, JSON-serializable, with
//! `type` drawn from a fixed enum. Malformed or unrecognized messages are
//! dropped and audited by the broker, never acted upon.
//!
//! The `ready` type flows both ways: the host sends a `ready` probe after
//! allocating a context (fresh or pooled), and the context answers with a
//! `ready` ack. The execution payload is dispatched only after the ack, so
//! the host never races an unbooted context.

use crate::id::RequestId;
use crate::result::LogEntry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Fixed message-type vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Host → context: run the payload.
    Execute,
    /// Context → host: well-formed success reply.
    Result,
    /// Context → host: one log line.
    Log,
    /// Liveness handshake, both directions.
    Ready,
    /// Context → host: well-formed error reply.
    Error,
}

impl MessageType {
    /// Wire spelling.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Execute => "execute",
            MessageType::Result => "result",
            MessageType::Log => "log",
            MessageType::Ready => "ready",
            MessageType::Error => "error",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "execute" => Ok(MessageType::Execute),
            "result" => Ok(MessageType::Result),
            "log" => Ok(MessageType::Log),
            "ready" => Ok(MessageType::Ready),
            "error" => Ok(MessageType::Error),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

/// Protocol violations detected while validating an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The message was not a JSON object.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(&'static str),

    /// A required field was absent.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// `requestId` was present but not a valid id.
    #[error("invalid request id: {0}")]
    InvalidRequestId(String),

    /// `type` was outside the fixed vocabulary.
    #[error("unrecognized message type: {0}")]
    UnknownType(String),
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Correlates the message to its originating request.
    pub request_id: RequestId,
    /// Message type tag.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Arbitrary JSON payload; meaning depends on `kind`.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Host → context execution dispatch.
    #[must_use]
    pub fn execute(request_id: RequestId, payload: serde_json::Value) -> Self {
        Self {
            request_id,
            kind: MessageType::Execute,
            payload,
        }
    }

    /// Context → host success reply.
    #[must_use]
    pub fn result(request_id: RequestId, payload: serde_json::Value) -> Self {
        Self {
            request_id,
            kind: MessageType::Result,
            payload,
        }
    }

    /// Context → host log line.
    #[must_use]
    pub fn log(request_id: RequestId, entry: &LogEntry) -> Self {
        Self {
            request_id,
            kind: MessageType::Log,
            payload: serde_json::to_value(entry).unwrap_or(serde_json::Value::Null),
        }
    }

    /// Liveness handshake message.
    #[must_use]
    pub fn ready(request_id: RequestId) -> Self {
        Self {
            request_id,
            kind: MessageType::Ready,
            payload: serde_json::Value::Null,
        }
    }

    /// Context → host error reply.
    #[must_use]
    pub fn error(request_id: RequestId, message: impl Into<String>) -> Self {
        Self {
            request_id,
            kind: MessageType::Error,
            payload: serde_json::Value::String(message.into()),
        }
    }

    /// Validate a raw JSON value field by field.
    ///
    /// Unlike a plain serde deserialize, this names the exact violation so
    /// the broker can audit dropped messages precisely.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ProtocolError> {
        let obj = value
            .as_object()
            .ok_or(ProtocolError::MalformedEnvelope("not a JSON object"))?;

        let raw_id = obj
            .get("requestId")
            .and_then(serde_json::Value::as_str)
            .ok_or(ProtocolError::MissingField("requestId"))?;
        let request_id = raw_id
            .parse::<Uuid>()
            .map(RequestId)
            .map_err(|_| ProtocolError::InvalidRequestId(raw_id.to_string()))?;

        let kind = obj
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or(ProtocolError::MissingField("type"))?
            .parse()?;

        let payload = obj.get("payload").cloned().unwrap_or(serde_json::Value::Null);

        Ok(Self {
            request_id,
            kind,
            payload,
        })
    }

    /// Serialized size of the payload in bytes; counts toward the output cap.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        serde_json::to_string(&self.payload).map_or(0, |s| s.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn envelope_serializes_with_wire_field_names() {
        let id = RequestId::new();
        let env = Envelope::execute(id, json!({"x": 1}));
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["type"], "execute");
        assert_eq!(value["requestId"], id.0.to_string());
        assert_eq!(value["payload"]["x"], 1);
    }

    #[test]
    fn from_value_round_trips() {
        let env = Envelope::result(RequestId::new(), json!([1, 2, 3]));
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(Envelope::from_value(value).unwrap(), env);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let value = json!({
            "requestId": Uuid::new_v4().to_string(),
            "type": "teleport",
            "payload": null,
        });
        assert_eq!(
            Envelope::from_value(value),
            Err(ProtocolError::UnknownType("teleport".to_string()))
        );
    }

    #[test]
    fn missing_request_id_is_rejected() {
        let value = json!({ "type": "result" });
        assert_eq!(
            Envelope::from_value(value),
            Err(ProtocolError::MissingField("requestId"))
        );
    }

    #[test]
    fn garbage_request_id_is_rejected() {
        let value = json!({ "requestId": "not-a-uuid", "type": "result" });
        assert!(matches!(
            Envelope::from_value(value),
            Err(ProtocolError::InvalidRequestId(_))
        ));
    }

    #[test]
    fn non_object_is_rejected() {
        assert!(matches!(
            Envelope::from_value(json!("hello")),
            Err(ProtocolError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn missing_payload_defaults_to_null() {
        let value = json!({
            "requestId": Uuid::new_v4().to_string(),
            "type": "ready",
        });
        let env = Envelope::from_value(value).unwrap();
        assert_eq!(env.payload, serde_json::Value::Null);
    }

    #[test]
    fn payload_size_counts_serialized_bytes() {
        let env = Envelope::result(RequestId::new(), json!("abcd"));
        // "abcd" serializes with quotes
        assert_eq!(env.payload_size(), 6);
    }
}
