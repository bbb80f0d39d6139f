//! Length-prefixed message framing
//!
//! Format: 1 byte flags + 4 byte big-endian length + payload. Connect,
//! gRPC and gRPC-Web share it and differ only in the flag bits.

use std::collections::HashMap;

use bytes::{Buf, Bytes, BytesMut};
use serde_json::Value;

use crate::rpc::{Code, RpcError};

pub const HEADER_LEN: usize = 5;

/// Payload is compressed
pub const FLAG_COMPRESSED: u8 = 0x01;
/// Connect end-of-stream message
pub const FLAG_END_STREAM: u8 = 0x02;
/// gRPC-Web trailers frame
pub const FLAG_TRAILER: u8 = 0x80;

/// One framed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub flags: u8,
    pub payload: Bytes,
}

impl Envelope {
    pub fn is_end_stream(&self) -> bool {
        self.flags & FLAG_END_STREAM != 0
    }

    pub fn is_trailer(&self) -> bool {
        self.flags & FLAG_TRAILER != 0
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }
}

/// Frame `payload` with `flags`
pub fn encode(flags: u8, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&[flags]);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out.freeze()
}

/// Reassembles envelopes from arbitrarily split body chunks
#[derive(Debug, Default)]
pub struct EnvelopeBuffer {
    buf: BytesMut,
    /// `0` means no limit
    max_message_size: usize,
}

impl EnvelopeBuffer {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_message_size,
        }
    }

    /// Append data from the response body
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Drain one complete envelope, if buffered
    pub fn try_next(&mut self) -> Result<Option<Envelope>, RpcError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let flags = self.buf[0];
        let length =
            u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if self.max_message_size > 0 && length > self.max_message_size && flags & FLAG_TRAILER == 0
        {
            return Err(RpcError::new(
                Code::ResourceExhausted,
                format!(
                    "message size {length} exceeds configured maximum {}",
                    self.max_message_size
                ),
            ));
        }
        if self.buf.len() < HEADER_LEN + length {
            return Ok(None);
        }
        self.buf.advance(HEADER_LEN);
        let payload = self.buf.split_to(length).freeze();
        Ok(Some(Envelope { flags, payload }))
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Parsed Connect end-of-stream message
#[derive(Debug, Default)]
pub struct EndStream {
    pub error: Option<RpcError>,
    pub metadata: HashMap<String, Vec<String>>,
}

pub fn parse_end_stream(payload: &[u8]) -> Result<EndStream, RpcError> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(EndStream::default());
    }
    let value: Value = serde_json::from_slice(payload).map_err(|e| {
        RpcError::new(
            Code::Internal,
            format!("invalid end-of-stream message: {e}"),
        )
    })?;

    let mut end = EndStream::default();
    if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
        end.error = Some(
            RpcError::from_connect_value(error.clone())
                .unwrap_or_else(|| RpcError::new(Code::Unknown, "malformed end-of-stream error")),
        );
    }
    if let Some(Value::Object(metadata)) = value.get("metadata") {
        for (key, values) in metadata {
            let values = values
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            end.metadata.insert(key.to_ascii_lowercase(), values);
        }
    }
    Ok(end)
}

/// Parse a gRPC-Web trailers frame (`key: value\r\n` lines)
pub fn parse_trailers(payload: &[u8]) -> HashMap<String, String> {
    String::from_utf8_lossy(payload)
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            Some((key.trim().to_ascii_lowercase(), value.trim().to_string()))
        })
        .collect()
}

/// Status carried by gRPC trailers; `None` when the call succeeded
pub fn status_from_trailers(trailers: &HashMap<String, String>) -> Option<RpcError> {
    let status = trailers.get("grpc-status")?;
    RpcError::from_grpc_status(status, trailers.get("grpc-message").map(String::as_str))
}
