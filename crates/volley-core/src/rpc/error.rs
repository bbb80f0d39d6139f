//! Structured RPC errors
//!
//! Errors reported by the peer or the transport, with their detail entries,
//! and the conversion into the payload delivered to `error` listeners.

use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::code::Code;
use crate::codec::{decode_base64, encode_base64, Codec, ProtoCodec};
use crate::schema::DescriptorPool;

const TYPE_URL_PREFIX: &str = "type.googleapis.com/";

/// One structured detail attached to an RPC error
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorDetail {
    /// Fully-qualified message name of the detail
    pub type_name: String,
    /// Serialized detail message
    pub value: Bytes,
    /// Server-provided JSON rendering, when present
    pub debug: Option<Value>,
}

/// An RPC failure: code, message and optional details
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RpcError {
    code: Code,
    message: String,
    details: Vec<ErrorDetail>,
}

impl RpcError {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn with_details(mut self, details: Vec<ErrorDetail>) -> Self {
        self.details = details;
        self
    }

    pub fn canceled() -> Self {
        Self::new(Code::Canceled, "context canceled")
    }

    pub fn deadline_exceeded() -> Self {
        Self::new(Code::DeadlineExceeded, "context deadline exceeded")
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> &[ErrorDetail] {
        &self.details
    }

    /// Parse a Connect JSON error object (`{"code", "message", "details"}`).
    ///
    /// Returns `None` when the body is not a Connect error.
    pub fn from_connect_json(body: &[u8]) -> Option<Self> {
        let wire: WireError = serde_json::from_slice(body).ok()?;
        Some(wire.into_error())
    }

    /// Same as [`RpcError::from_connect_json`] for an already-parsed object
    pub fn from_connect_value(value: Value) -> Option<Self> {
        let wire: WireError = serde_json::from_value(value).ok()?;
        Some(wire.into_error())
    }

    /// Build an error from gRPC status fields (trailers or headers).
    ///
    /// Returns `None` for status `0`.
    pub fn from_grpc_status(status: &str, message: Option<&str>) -> Option<Self> {
        let value: u32 = status.trim().parse().ok()?;
        if value == 0 {
            return None;
        }
        let code = Code::from_u32(value).unwrap_or(Code::Unknown);
        let message = message.map(percent_decode).unwrap_or_default();
        Some(Self::new(code, message))
    }

    /// Payload handed to `error` listeners.
    ///
    /// `decode_detail` turns a detail's bytes into a JSON value when the
    /// detail type is known; undecodable details keep only their bytes.
    pub fn to_payload<F>(&self, decode_detail: F) -> Value
    where
        F: Fn(&ErrorDetail) -> Option<Value>,
    {
        let details: Vec<Value> = self
            .details
            .iter()
            .map(|detail| {
                let mut entry = Map::new();
                entry.insert("type".into(), Value::String(detail.type_name.clone()));
                if let Some(value) = decode_detail(detail).or_else(|| detail.debug.clone()) {
                    entry.insert("value".into(), value);
                }
                entry.insert("bytes".into(), Value::String(encode_base64(&detail.value)));
                Value::Object(entry)
            })
            .collect();

        json!({
            "code": self.code.as_str(),
            "message": self.to_string(),
            "details": details,
        })
    }

    /// [`to_payload`](Self::to_payload) decoding details whose type is in `pool`
    pub fn payload_with_pool(&self, pool: &DescriptorPool) -> Value {
        self.to_payload(|detail| {
            let schema = pool.schema(&detail.type_name)?;
            ProtoCodec.decode(&detail.value, schema).ok()
        })
    }
}

#[derive(Debug, Deserialize)]
struct WireError {
    code: Option<String>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    details: Vec<WireDetail>,
}

#[derive(Debug, Deserialize)]
struct WireDetail {
    #[serde(rename = "type", default)]
    type_name: String,
    #[serde(default)]
    value: String,
    #[serde(default)]
    debug: Option<Value>,
}

impl WireError {
    fn into_error(self) -> RpcError {
        let code = self
            .code
            .as_deref()
            .and_then(Code::from_name)
            .unwrap_or(Code::Unknown);
        let details = self
            .details
            .into_iter()
            .map(|d| ErrorDetail {
                type_name: d
                    .type_name
                    .strip_prefix(TYPE_URL_PREFIX)
                    .unwrap_or(&d.type_name)
                    .to_string(),
                value: decode_base64(&d.value).map(Bytes::from).unwrap_or_default(),
                debug: d.debug,
            })
            .collect();
        RpcError::new(code, self.message).with_details(details)
    }
}

/// gRPC percent-encodes `grpc-message`
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&input[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
