//! Connect and call options
//!
//! Options arrive as JSON-shaped objects, the same shape a script would pass.
//! Unknown keys are ignored; invalid values fail with [`ParamsError`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::codec::{Codec, JsonCodec, ProtoCodec};

#[derive(Debug, thiserror::Error)]
pub enum ParamsError {
    #[error("options must be an object")]
    NotAnObject,

    #[error("invalid timeout value: {0}")]
    Timeout(String),

    #[error("invalid protocol: {0}. Must be 'connect', 'grpc', or 'grpc-web'")]
    Protocol(String),

    #[error("invalid contentType: {0}. Must be 'application/json', 'application/proto', or 'application/protobuf'")]
    ContentType(String),

    #[error("invalid httpVersion: {0}. Must be '1.1', '2', or 'auto'")]
    HttpVersion(String),

    #[error("invalid connectionStrategy: {0}. Must be 'per-vu', 'per-iteration', or 'per-call'")]
    ConnectionStrategy(String),

    #[error("invalid {key} object: {reason}")]
    Metadata { key: String, reason: String },

    #[error("invalid tags object: {0}")]
    Tags(String),

    #[error("invalid {key}: {reason}")]
    Invalid { key: String, reason: String },
}

/// RPC protocol spoken over HTTP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Connect,
    Grpc,
    GrpcWeb,
}

impl Protocol {
    pub fn parse(value: &str) -> Result<Self, ParamsError> {
        match value {
            "connect" => Ok(Protocol::Connect),
            "grpc" => Ok(Protocol::Grpc),
            "grpc-web" => Ok(Protocol::GrpcWeb),
            other => Err(ParamsError::Protocol(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Connect => "connect",
            Protocol::Grpc => "grpc",
            Protocol::GrpcWeb => "grpc-web",
        }
    }

    /// `Content-Type` header for a call of this protocol
    pub fn content_type(&self, codec: ContentType, streaming: bool) -> String {
        let suffix = codec.suffix();
        match self {
            Protocol::Connect if streaming => format!("application/connect+{suffix}"),
            Protocol::Connect => format!("application/{suffix}"),
            Protocol::Grpc => format!("application/grpc+{suffix}"),
            Protocol::GrpcWeb => format!("application/grpc-web+{suffix}"),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentType {
    #[default]
    Json,
    Proto,
}

impl ContentType {
    pub fn parse(value: &str) -> Result<Self, ParamsError> {
        match value {
            "application/json" => Ok(ContentType::Json),
            "application/proto" | "application/protobuf" => Ok(ContentType::Proto),
            other => Err(ParamsError::ContentType(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::Proto => "application/proto",
        }
    }

    pub fn suffix(&self) -> &'static str {
        match self {
            ContentType::Json => "json",
            ContentType::Proto => "proto",
        }
    }

    pub fn codec(&self) -> Arc<dyn Codec> {
        match self {
            ContentType::Json => Arc::new(JsonCodec),
            ContentType::Proto => Arc::new(ProtoCodec),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpVersion {
    Http1,
    #[default]
    Http2,
    Auto,
}

impl HttpVersion {
    pub fn parse(value: &str) -> Result<Self, ParamsError> {
        match value {
            "1.1" => Ok(HttpVersion::Http1),
            "2" => Ok(HttpVersion::Http2),
            "auto" => Ok(HttpVersion::Auto),
            other => Err(ParamsError::HttpVersion(other.to_string())),
        }
    }
}

/// When HTTP clients are rebuilt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStrategy {
    /// One client for the lifetime of the virtual user
    #[default]
    PerVu,
    /// A fresh client whenever the iteration number changes
    PerIteration,
    /// A fresh client for every call and stream
    PerCall,
}

impl ConnectionStrategy {
    pub fn parse(value: &str) -> Result<Self, ParamsError> {
        match value {
            "per-vu" => Ok(ConnectionStrategy::PerVu),
            "per-iteration" => Ok(ConnectionStrategy::PerIteration),
            "per-call" => Ok(ConnectionStrategy::PerCall),
            other => Err(ParamsError::ConnectionStrategy(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStrategy::PerVu => "per-vu",
            ConnectionStrategy::PerIteration => "per-iteration",
            ConnectionStrategy::PerCall => "per-call",
        }
    }
}

/// TLS options for `connect`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TlsParams {
    pub insecure_skip_verify: bool,
    /// PEM client certificate
    pub cert: Option<String>,
    /// PEM client key
    pub key: Option<String>,
    pub password: Option<String>,
    /// PEM CA certificates to trust
    pub cacerts: Vec<String>,
}

/// Options for `connect`
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectParams {
    pub plaintext: bool,
    /// Accepted for compatibility; server reflection is not used
    pub reflect: bool,
    pub timeout: Option<Duration>,
    /// `0` means no limit
    pub max_receive_size: usize,
    pub max_send_size: usize,
    pub tls: TlsParams,
    pub protocol: Protocol,
    pub content_type: ContentType,
    pub http_version: HttpVersion,
    pub connection_strategy: ConnectionStrategy,
    pub headers: HashMap<String, String>,
}

impl Default for ConnectParams {
    fn default() -> Self {
        Self {
            plaintext: false,
            reflect: false,
            timeout: None,
            max_receive_size: 0,
            max_send_size: 0,
            tls: TlsParams::default(),
            protocol: Protocol::Connect,
            content_type: ContentType::Json,
            http_version: HttpVersion::Http2,
            connection_strategy: ConnectionStrategy::PerVu,
            headers: HashMap::new(),
        }
    }
}

impl ConnectParams {
    pub fn from_value(value: Option<&Value>) -> Result<Self, ParamsError> {
        let mut params = Self::default();
        let Some(object) = options_object(value)? else {
            return Ok(params);
        };

        for (key, value) in object {
            match key.as_str() {
                "plaintext" => params.plaintext = truthy(value),
                "reflect" => params.reflect = truthy(value),
                "timeout" => params.timeout = parse_timeout(value)?,
                "maxReceiveSize" => params.max_receive_size = size(key, value)?,
                "maxSendSize" => params.max_send_size = size(key, value)?,
                "tls" => params.tls = parse_tls(value)?,
                "protocol" => params.protocol = Protocol::parse(&string(key, value)?)?,
                "contentType" => {
                    params.content_type = ContentType::parse(&string(key, value)?)?
                }
                "httpVersion" => params.http_version = HttpVersion::parse(&string(key, value)?)?,
                "connectionStrategy" => {
                    params.connection_strategy = ConnectionStrategy::parse(&string(key, value)?)?
                }
                "headers" | "metadata" => string_map(key, value, &mut params.headers)?,
                _ => {}
            }
        }
        Ok(params)
    }
}

/// Options for a single call or stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallParams {
    pub timeout: Option<Duration>,
    pub discard_response: bool,
    pub metadata: HashMap<String, String>,
    pub tags: HashMap<String, String>,
}

impl CallParams {
    pub fn from_value(value: Option<&Value>) -> Result<Self, ParamsError> {
        let mut params = Self::default();
        let Some(object) = options_object(value)? else {
            return Ok(params);
        };

        for (key, value) in object {
            match key.as_str() {
                "headers" | "metadata" => string_map(key, value, &mut params.metadata)?,
                "timeout" => params.timeout = parse_timeout(value)?,
                "discardResponse" => params.discard_response = truthy(value),
                "tags" => parse_tags(value, &mut params.tags)?,
                _ => {}
            }
        }
        Ok(params)
    }
}

fn options_object(value: Option<&Value>) -> Result<Option<&Map<String, Value>>, ParamsError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(object)) => Ok(Some(object)),
        Some(_) => Err(ParamsError::NotAnObject),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn string(key: &str, value: &Value) -> Result<String, ParamsError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(ParamsError::Invalid {
            key: key.to_string(),
            reason: "must be a string".to_string(),
        }),
    }
}

fn size(key: &str, value: &Value) -> Result<usize, ParamsError> {
    match value {
        Value::Null => Ok(0),
        Value::Number(n) => {
            let n = n.as_f64().unwrap_or(0.0);
            if n < 0.0 {
                Ok(0)
            } else {
                Ok(n.trunc() as usize)
            }
        }
        _ => Err(ParamsError::Invalid {
            key: key.to_string(),
            reason: "must be a number".to_string(),
        }),
    }
}

fn string_map(
    key: &str,
    value: &Value,
    dest: &mut HashMap<String, String>,
) -> Result<(), ParamsError> {
    let object = match value {
        Value::Null => return Ok(()),
        Value::Object(object) => object,
        _ => {
            return Err(ParamsError::Metadata {
                key: key.to_string(),
                reason: "must be an object with key-value pairs".to_string(),
            })
        }
    };
    for (name, item) in object {
        let Value::String(item) = item else {
            return Err(ParamsError::Metadata {
                key: key.to_string(),
                reason: format!("{name:?} value must be a string"),
            });
        };
        dest.insert(name.clone(), item.clone());
    }
    Ok(())
}

fn parse_tags(value: &Value, dest: &mut HashMap<String, String>) -> Result<(), ParamsError> {
    let object = match value {
        Value::Null => return Ok(()),
        Value::Object(object) => object,
        _ => return Err(ParamsError::Tags("must be an object".to_string())),
    };
    for (name, item) in object {
        let item = match item {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => {
                return Err(ParamsError::Tags(format!(
                    "tag {name:?} must be a string, number or boolean"
                )))
            }
        };
        dest.insert(name.clone(), item);
    }
    Ok(())
}

fn parse_tls(value: &Value) -> Result<TlsParams, ParamsError> {
    let invalid = |reason: &str| ParamsError::Invalid {
        key: "tls".to_string(),
        reason: reason.to_string(),
    };
    let object = match value {
        Value::Null => return Ok(TlsParams::default()),
        Value::Object(object) => object,
        _ => return Err(invalid("must be an object")),
    };
    let mut tls = TlsParams::default();
    for (key, item) in object {
        match key.as_str() {
            "insecureSkipVerify" => tls.insecure_skip_verify = truthy(item),
            "cert" => tls.cert = item.as_str().map(str::to_string),
            "key" => tls.key = item.as_str().map(str::to_string),
            "password" => tls.password = item.as_str().map(str::to_string),
            "cacerts" => {
                tls.cacerts = match item {
                    Value::String(s) => vec![s.clone()],
                    Value::Array(items) => items
                        .iter()
                        .map(|i| i.as_str().map(str::to_string))
                        .collect::<Option<Vec<_>>>()
                        .ok_or_else(|| invalid("cacerts must be strings"))?,
                    Value::Null => Vec::new(),
                    _ => return Err(invalid("cacerts must be a string or an array")),
                }
            }
            _ => {}
        }
    }
    if tls.cert.is_some() != tls.key.is_some() {
        return Err(invalid("cert and key must be given together"));
    }
    Ok(tls)
}

/// Timeout option: `null`, `""`, `"0"` and `"infinite"` mean no deadline
pub fn parse_timeout(value: &Value) -> Result<Option<Duration>, ParamsError> {
    let text = match value {
        Value::Null => return Ok(None),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => return Err(ParamsError::Timeout(other.to_string())),
    };
    match text.as_str() {
        "" | "0" | "infinite" => Ok(None),
        _ => parse_duration(&text).map(Some),
    }
}

/// Duration strings such as `300ms`, `1.5s`, `1h30m`
pub fn parse_duration(input: &str) -> Result<Duration, ParamsError> {
    let fail = |reason: &str| ParamsError::Timeout(format!("{reason} in duration {input:?}"));
    let mut rest = input.strip_prefix('+').unwrap_or(input);
    if rest.starts_with('-') {
        return Err(fail("negative value"));
    }
    if rest == "0" {
        return Ok(Duration::ZERO);
    }
    if rest.is_empty() {
        return Err(fail("empty value"));
    }

    let mut total_nanos = 0f64;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(fail("expected a number"));
        }
        let number: f64 = rest[..number_len]
            .parse()
            .map_err(|_| fail("invalid number"))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "" => return Err(fail("missing unit")),
            _ => return Err(fail("unknown unit")),
        };
        rest = &rest[unit_len..];
        total_nanos += number * nanos_per_unit;
    }
    if !total_nanos.is_finite() || total_nanos >= u64::MAX as f64 {
        return Err(fail("out of range"));
    }
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}
