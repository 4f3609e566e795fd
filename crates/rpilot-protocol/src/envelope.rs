//! The wire envelope and its codec.
//!
//! Every message on every channel is a single UTF-8 JSON object:
//!
//! ```json
//! {"key": "START", "target": "pilot_1", "value": {...}, "id": "7", "ttl": 4}
//! ```
//!
//! `key` and `value` are mandatory. `id` is present on commands that take
//! part in reliable delivery and `ttl` only once a command has been re-sent.
//! Some senders JSON-encode an already encoded envelope, so `decode` unwraps
//! string layers until it reaches an object.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::MAX_DECODE_DEPTH;
use crate::keys::MessageKey;
use crate::types::Address;
use crate::ProtocolError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Selects the handler on the receiving node.
    pub key: String,
    /// Destination Pilot, the broadcast address, or the Terminal observer.
    #[serde(default = "Address::broadcast")]
    pub target: Address,
    /// Handler-specific payload, opaque to the transport.
    pub value: Value,
    /// Acknowledgment id for reliable commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Remaining retry attempts, set from the first re-send onward.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
}

impl Envelope {
    pub fn new(key: MessageKey, target: Address, value: Value) -> Self {
        Self {
            key: key.as_str().to_string(),
            target,
            value,
            id: None,
            ttl: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Parse `key` into a known message kind.
    pub fn kind(&self) -> Result<MessageKey, ProtocolError> {
        self.key.parse()
    }

    /// Whether the envelope takes part in the acknowledgment protocol.
    pub fn is_reliable(&self) -> bool {
        self.id.is_some()
    }

    fn from_object(map: Map<String, Value>) -> Result<Self, ProtocolError> {
        match map.get("key") {
            Some(Value::String(_)) => {}
            Some(other) => {
                return Err(ProtocolError::MalformedMessage(format!(
                    "key must be a string, found {other}"
                )))
            }
            None => return Err(ProtocolError::MalformedMessage("missing key".into())),
        }
        if !map.contains_key("value") {
            return Err(ProtocolError::MalformedMessage("missing value".into()));
        }
        serde_json::from_value(Value::Object(map))
            .map_err(|e| ProtocolError::MalformedMessage(e.to_string()))
    }
}

/// Encode an envelope as compact JSON. The output never contains a raw
/// newline, so it is safe to frame by lines.
///
/// Every field serializes infallibly (strings, integers and a `Value`, whose
/// maps only have string keys), so the error arm is unreachable in practice;
/// it logs and yields an empty frame, which every receiver drops as
/// malformed.
pub fn encode(envelope: &Envelope) -> Bytes {
    match serde_json::to_vec(envelope) {
        Ok(bytes) => Bytes::from(bytes),
        Err(e) => {
            tracing::error!(key = %envelope.key, error = %e, "Envelope serialization failed");
            Bytes::new()
        }
    }
}

/// Decode a payload, unwrapping up to [`MAX_DECODE_DEPTH`] string-encoded
/// layers.
pub fn decode(payload: &[u8]) -> Result<Envelope, ProtocolError> {
    let mut value: Value = serde_json::from_slice(payload)
        .map_err(|e| ProtocolError::MalformedMessage(format!("unparseable payload: {e}")))?;

    for _ in 0..=MAX_DECODE_DEPTH {
        match value {
            Value::String(inner) => {
                value = serde_json::from_str(&inner).map_err(|e| {
                    ProtocolError::MalformedMessage(format!("unparseable inner layer: {e}"))
                })?;
            }
            Value::Object(map) => return Envelope::from_object(map),
            other => {
                return Err(ProtocolError::MalformedMessage(format!(
                    "expected an object, found {other}"
                )))
            }
        }
    }

    Err(ProtocolError::MalformedMessage(format!(
        "still string-encoded after {MAX_DECODE_DEPTH} layers"
    )))
}
