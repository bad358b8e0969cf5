//! JSON codec using `serde_json`.
//!
//! Inbound text must decode to a JSON object; anything else (invalid JSON,
//! arrays, scalars) is a decode failure. The failure message is what the
//! client sees in its `{"error": ...}` reply.

use serde_json::Value;

use crate::error::{DataserverError, Result};
use crate::protocol::RequestEnvelope;

/// JSON codec for envelopes.
pub struct JsonCodec;

impl JsonCodec {
    /// Decode a text frame into a request envelope.
    ///
    /// # Errors
    ///
    /// Returns [`DataserverError::Decode`] if the text is not a JSON object.
    pub fn decode(text: &str) -> Result<RequestEnvelope> {
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => Ok(RequestEnvelope::from_map(map)),
            Ok(other) => Err(DataserverError::Decode(format!(
                "expected a JSON object, got {}",
                kind_of(&other)
            ))),
            Err(e) => Err(DataserverError::Decode(e.to_string())),
        }
    }

    /// Encode a value to a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<String> {
        Ok(serde_json::to_string(value)?)
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
