//! Runtime message schemas
//!
//! Message shapes are only known once descriptors are loaded, so every codec
//! and stream works against these descriptor types instead of generated code.

mod protoset;
mod registry;

pub use registry::SchemaRegistry;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

/// Errors from loading descriptors or resolving methods
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("no proto files loaded: call load_protoset() or load_descriptor_json() first")]
    NotLoaded,

    #[error("method to invoke cannot be empty")]
    EmptyMethod,

    #[error("method {0:?} not found in loaded proto files")]
    NotFound(String),

    #[error("message type {0:?} is not defined")]
    UnknownType(String),

    #[error("invalid descriptor: {0}")]
    Invalid(String),

    #[error("couldn't decode base64 protoset data: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("couldn't read protoset: {0}")]
    Io(#[from] std::io::Error),

    #[error("couldn't parse descriptor document: {0}")]
    Json(#[from] serde_json::Error),
}

/// Type of a single field
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Double,
    Float,
    Int32,
    Int64,
    Uint32,
    Uint64,
    Sint32,
    Sint64,
    Fixed32,
    Fixed64,
    Sfixed32,
    Sfixed64,
    Bool,
    String,
    Bytes,
    /// Enum, by fully-qualified name
    Enum(String),
    /// Message, by fully-qualified name
    Message(String),
}

impl FieldKind {
    /// Map a `FieldDescriptorProto.type` number to a kind.
    pub fn from_proto_type(ty: i64, type_name: &str) -> Option<Self> {
        let name = type_name.trim_start_matches('.').to_string();
        let kind = match ty {
            1 => FieldKind::Double,
            2 => FieldKind::Float,
            3 => FieldKind::Int64,
            4 => FieldKind::Uint64,
            5 => FieldKind::Int32,
            6 => FieldKind::Fixed64,
            7 => FieldKind::Fixed32,
            8 => FieldKind::Bool,
            9 => FieldKind::String,
            // groups are decoded like messages
            10 | 11 => FieldKind::Message(name),
            12 => FieldKind::Bytes,
            13 => FieldKind::Uint32,
            14 => FieldKind::Enum(name),
            15 => FieldKind::Sfixed32,
            16 => FieldKind::Sfixed64,
            17 => FieldKind::Sint32,
            18 => FieldKind::Sint64,
            _ => return None,
        };
        Some(kind)
    }

    /// Scalar kinds that can be packed on the wire
    pub fn is_packable(&self) -> bool {
        !matches!(
            self,
            FieldKind::String | FieldKind::Bytes | FieldKind::Message(_)
        )
    }
}

/// One field of a message
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub json_name: String,
    pub number: u32,
    pub kind: FieldKind,
    pub repeated: bool,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, number: u32, kind: FieldKind) -> Self {
        let name = name.into();
        Self {
            json_name: json_name_of(&name),
            name,
            number,
            kind,
            repeated: false,
        }
    }

    pub fn repeated(mut self) -> Self {
        self.repeated = true;
        self
    }
}

/// lowerCamelCase rendering protoc uses for `json_name`
pub fn json_name_of(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for ch in name.chars() {
        if ch == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

/// A message type: its fields, in declaration order
#[derive(Debug, Clone, PartialEq)]
pub struct MessageShape {
    pub full_name: String,
    pub fields: Vec<FieldDescriptor>,
    /// Synthetic `FooEntry` type backing a `map<K, V>` field
    pub map_entry: bool,
}

impl MessageShape {
    pub fn new(full_name: impl Into<String>, fields: Vec<FieldDescriptor>) -> Self {
        Self {
            full_name: full_name.into(),
            fields,
            map_entry: false,
        }
    }

    pub fn field_by_number(&self, number: u32) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.number == number)
    }

    /// Look a field up by its JSON name or its proto name
    pub fn field_by_name(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields
            .iter()
            .find(|f| f.json_name == name)
            .or_else(|| self.fields.iter().find(|f| f.name == name))
    }
}

/// An enum type with its named values
#[derive(Debug, Clone, PartialEq)]
pub struct EnumShape {
    pub full_name: String,
    pub values: Vec<EnumValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumValue {
    pub name: String,
    pub number: i32,
}

impl EnumShape {
    pub fn name_of(&self, number: i32) -> Option<&str> {
        self.values
            .iter()
            .find(|v| v.number == number)
            .map(|v| v.name.as_str())
    }

    pub fn number_of(&self, name: &str) -> Option<i32> {
        self.values.iter().find(|v| v.name == name).map(|v| v.number)
    }
}

/// All message and enum types known to a registry, by fully-qualified name
#[derive(Debug, Clone, Default)]
pub struct DescriptorPool {
    messages: HashMap<String, Arc<MessageShape>>,
    enums: HashMap<String, Arc<EnumShape>>,
}

impl DescriptorPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_message(&mut self, shape: MessageShape) {
        self.messages.insert(shape.full_name.clone(), Arc::new(shape));
    }

    pub fn add_enum(&mut self, shape: EnumShape) {
        self.enums.insert(shape.full_name.clone(), Arc::new(shape));
    }

    pub fn message(&self, full_name: &str) -> Option<&Arc<MessageShape>> {
        self.messages.get(full_name.trim_start_matches('.'))
    }

    pub fn enum_shape(&self, full_name: &str) -> Option<&Arc<EnumShape>> {
        self.enums.get(full_name.trim_start_matches('.'))
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Schema view of a message type
    pub fn schema(&self, full_name: &str) -> Option<Schema<'_>> {
        self.message(full_name).map(|message| Schema {
            message: message.as_ref(),
            pool: self,
        })
    }
}

/// A message shape together with the pool its nested types resolve against
#[derive(Debug, Clone, Copy)]
pub struct Schema<'a> {
    pub message: &'a MessageShape,
    pub pool: &'a DescriptorPool,
}

impl<'a> Schema<'a> {
    pub fn new(message: &'a MessageShape, pool: &'a DescriptorPool) -> Self {
        Self { message, pool }
    }

    pub fn full_name(&self) -> &'a str {
        &self.message.full_name
    }
}

/// Streaming directionality and naming of one RPC method
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MethodInfo {
    pub package: String,
    pub service: String,
    /// `/package.Service/Method`
    pub full_method: String,
    pub is_client_stream: bool,
    pub is_server_stream: bool,
}

impl MethodInfo {
    pub fn kind(&self) -> &'static str {
        match (self.is_client_stream, self.is_server_stream) {
            (false, false) => "unary",
            (true, false) => "client-stream",
            (false, true) => "server-stream",
            (true, true) => "bidi-stream",
        }
    }

    /// Method name without the service prefix
    pub fn procedure(&self) -> &str {
        self.full_method
            .rsplit('/')
            .next()
            .unwrap_or(&self.full_method)
    }
}

/// A resolved method: naming, input/output shapes and the pool they live in
#[derive(Debug, Clone)]
pub struct MethodSchema {
    pub info: MethodInfo,
    pub input: Arc<MessageShape>,
    pub output: Arc<MessageShape>,
    pub pool: Arc<DescriptorPool>,
}

impl MethodSchema {
    pub fn input_schema(&self) -> Schema<'_> {
        Schema::new(&self.input, &self.pool)
    }

    pub fn output_schema(&self) -> Schema<'_> {
        Schema::new(&self.output, &self.pool)
    }
}

/// Resolves method names to shapes
pub trait SchemaProvider: Send + Sync {
    fn resolve(&self, method: &str) -> Result<Arc<MethodSchema>, SchemaError>;

    /// Snapshot of every known type, used to decode error details
    fn pool(&self) -> Arc<DescriptorPool>;
}

/// Add the leading `/` servers route on
pub fn sanitize_method_name(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    }
}
