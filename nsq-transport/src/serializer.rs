//! Envelope serialization
//!
//! A [`Serializer`] turns an envelope into a string-keyed mapping and back.
//! The mapping travels over NSQ as a JSON object.

use crate::envelope::Envelope;
use crate::{Error, Result};
use bytes::Bytes;
use serde_json::{Map, Value};

/// Serializer-neutral form of an envelope
pub type EncodedEnvelope = Map<String, Value>;

const BODY_KEY: &str = "body";

/// Pluggable envelope serializer
pub trait Serializer: Send + Sync {
    /// Encode an envelope for the wire
    fn encode(&self, envelope: &Envelope) -> Result<EncodedEnvelope>;

    /// Rebuild an envelope; fails with [`Error::DecodingFailed`] on unknown shapes
    fn decode(&self, encoded: EncodedEnvelope) -> Result<Envelope>;
}

/// Default serializer: `{"body": <message>}`
///
/// Stamps are local metadata and never encoded.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn encode(&self, envelope: &Envelope) -> Result<EncodedEnvelope> {
        let mut encoded = Map::new();
        encoded.insert(BODY_KEY.to_string(), envelope.message().clone());
        Ok(encoded)
    }

    fn decode(&self, mut encoded: EncodedEnvelope) -> Result<Envelope> {
        let body = encoded
            .remove(BODY_KEY)
            .ok_or_else(|| Error::DecodingFailed("Encoded envelope is missing \"body\"".to_string()))?;

        Ok(Envelope::new(body))
    }
}

/// Wire bytes of an encoded envelope
pub(crate) fn to_wire(encoded: &EncodedEnvelope) -> Result<Bytes> {
    serde_json::to_vec(encoded)
        .map(Bytes::from)
        .map_err(|e| Error::EncodingFailed(e.to_string()))
}

/// Parse wire bytes into a mapping; anything but a JSON object is malformed
pub(crate) fn from_wire(body: &[u8]) -> Result<EncodedEnvelope> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(Error::DecodingFailed(format!(
            "Expected a JSON object, got {}",
            json_kind(&other)
        ))),
        Err(e) => Err(Error::DecodingFailed(e.to_string())),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
