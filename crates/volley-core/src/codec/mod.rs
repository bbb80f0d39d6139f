//! Schema-driven message codecs
//!
//! Messages cross the stream as JSON-shaped [`Value`]s. A codec maps such a
//! value onto a runtime [`Schema`] and back, so arbitrary message types can be
//! carried without generated code.
//!
//! The opaque representation is the same for every codec: objects keyed by
//! JSON field names, 64-bit integers as numbers, enums by value name, bytes as
//! standard base64 and `null` meaning "absent".

mod json;
mod proto;
mod value;

pub use json::JsonCodec;
pub use proto::ProtoCodec;
pub use value::UnknownFields;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use bytes::Bytes;
use serde_json::Value;

use crate::schema::Schema;

/// Maximum message nesting accepted by the codecs
pub const MAX_DEPTH: usize = 100;

/// Encode/decode failures
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unknown field {field:?} in message {message}")]
    UnknownField { message: String, field: String },

    #[error("invalid value for field {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("expected an object for message {message}, got {found}")]
    NotAnObject {
        message: String,
        found: &'static str,
    },

    #[error("type {0:?} is not defined")]
    UnknownType(String),

    #[error("malformed wire data: {0}")]
    Malformed(String),

    #[error("message nesting exceeds 100 levels")]
    TooDeep,

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Translates opaque values to and from a schema-described wire form
pub trait Codec: Send + Sync {
    /// Content-type suffix, e.g. `json` or `proto`
    fn name(&self) -> &'static str;

    /// Encode `value` as a message of `schema`. `null` encodes the empty message.
    fn encode(&self, value: &Value, schema: Schema<'_>) -> Result<Bytes, CodecError>;

    /// Decode wire bytes of `schema` into the opaque representation
    fn decode(&self, bytes: &[u8], schema: Schema<'_>) -> Result<Value, CodecError>;
}

/// Standard padded base64
pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Accepts standard or URL-safe alphabets, padded or not
pub fn decode_base64(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let trimmed = input.trim_end_matches('=');
    if trimmed.contains(['-', '_']) {
        URL_SAFE_NO_PAD.decode(trimmed)
    } else {
        STANDARD_NO_PAD.decode(trimmed)
    }
}

fn type_name_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Shapes shared by codec and stream tests

    use crate::schema::{
        DescriptorPool, EnumShape, EnumValue, FieldDescriptor, FieldKind, MessageShape,
    };

    pub fn pool() -> DescriptorPool {
        let mut pool = DescriptorPool::new();
        pool.add_message(MessageShape::new(
            "test.CumSumRequest",
            vec![FieldDescriptor::new("number", 1, FieldKind::Int64)],
        ));
        pool.add_message(MessageShape::new(
            "test.CumSumResponse",
            vec![FieldDescriptor::new("sum", 1, FieldKind::Int64)],
        ));
        pool.add_message(MessageShape::new(
            "test.CountUpRequest",
            vec![FieldDescriptor::new("number", 1, FieldKind::Int64)],
        ));
        pool.add_message(MessageShape::new(
            "test.CountUpResponse",
            vec![FieldDescriptor::new("number", 1, FieldKind::Int64)],
        ));
        pool.add_message(MessageShape::new(
            "test.ErrorInfo",
            vec![FieldDescriptor::new("reason", 1, FieldKind::String)],
        ));
        pool.add_enum(EnumShape {
            full_name: "test.Color".into(),
            values: vec![
                EnumValue {
                    name: "COLOR_UNSPECIFIED".into(),
                    number: 0,
                },
                EnumValue {
                    name: "COLOR_RED".into(),
                    number: 1,
                },
            ],
        });
        let mut entry = MessageShape::new(
            "test.Everything.LabelsEntry",
            vec![
                FieldDescriptor::new("key", 1, FieldKind::String),
                FieldDescriptor::new("value", 2, FieldKind::Int32),
            ],
        );
        entry.map_entry = true;
        pool.add_message(entry);
        pool.add_message(MessageShape::new(
            "test.Everything",
            vec![
                FieldDescriptor::new("name", 1, FieldKind::String),
                FieldDescriptor::new("count", 2, FieldKind::Int32),
                FieldDescriptor::new("big", 3, FieldKind::Uint64),
                FieldDescriptor::new("delta", 4, FieldKind::Sint64),
                FieldDescriptor::new("ratio", 5, FieldKind::Double),
                FieldDescriptor::new("scale", 6, FieldKind::Float),
                FieldDescriptor::new("enabled", 7, FieldKind::Bool),
                FieldDescriptor::new("blob", 8, FieldKind::Bytes),
                FieldDescriptor::new("color", 9, FieldKind::Enum("test.Color".into())),
                FieldDescriptor::new("child", 10, FieldKind::Message("test.CumSumRequest".into())),
                FieldDescriptor::new("values", 11, FieldKind::Int32).repeated(),
                FieldDescriptor::new("tags", 12, FieldKind::String).repeated(),
                FieldDescriptor::new(
                    "labels",
                    13,
                    FieldKind::Message("test.Everything.LabelsEntry".into()),
                )
                .repeated(),
                FieldDescriptor::new("fixed", 14, FieldKind::Fixed32),
                FieldDescriptor::new("neg", 15, FieldKind::Sfixed64),
                FieldDescriptor::new("user_id", 16, FieldKind::Int64),
            ],
        ));
        pool
    }
}
