//! JSON message codec (`application/json`)

use bytes::Bytes;
use serde_json::Value;

use super::value::{normalize, UnknownFields};
use super::{Codec, CodecError};
use crate::schema::Schema;

/// Validates values against the schema and ships them as JSON
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, value: &Value, schema: Schema<'_>) -> Result<Bytes, CodecError> {
        let canonical = normalize(value, schema, UnknownFields::Reject)?;
        Ok(Bytes::from(serde_json::to_vec(&canonical)?))
    }

    fn decode(&self, bytes: &[u8], schema: Schema<'_>) -> Result<Value, CodecError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Object(Default::default()));
        }
        let raw: Value = serde_json::from_slice(bytes)?;
        // Peers may run a newer schema
        normalize(&raw, schema, UnknownFields::Ignore)
    }
}
