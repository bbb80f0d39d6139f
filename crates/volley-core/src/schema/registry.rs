//! Schema registry
//!
//! Holds every loaded message, enum and service. Loads may happen at any
//! time; each one swaps in a new pool snapshot so resolved methods keep the
//! pool they were resolved against.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Deserialize;

use super::protoset;
use super::{
    json_name_of, sanitize_method_name, DescriptorPool, EnumShape, EnumValue, FieldDescriptor,
    FieldKind, MessageShape, MethodInfo, MethodSchema, SchemaError, SchemaProvider,
};
use crate::codec::decode_base64;

/// Types and services extracted from one load, before installation
#[derive(Debug, Default)]
pub(super) struct Descriptors {
    pub messages: Vec<MessageShape>,
    pub enums: Vec<EnumShape>,
    pub services: Vec<ServiceDef>,
}

#[derive(Debug)]
pub(super) struct ServiceDef {
    pub package: String,
    pub full_name: String,
    pub methods: Vec<MethodDef>,
}

#[derive(Debug)]
pub(super) struct MethodDef {
    pub name: String,
    pub input: String,
    pub output: String,
    pub client_streaming: bool,
    pub server_streaming: bool,
}

#[derive(Debug, Clone)]
struct MethodEntry {
    info: MethodInfo,
    input: String,
    output: String,
}

#[derive(Debug, Default)]
struct RegistryState {
    pool: Arc<DescriptorPool>,
    methods: HashMap<String, MethodEntry>,
    loaded: bool,
}

/// Shareable registry of loaded descriptors
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    state: RwLock<RegistryState>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON descriptor document. Returns the methods it declares.
    pub fn load_descriptor_json(&self, document: &str) -> Result<Vec<MethodInfo>, SchemaError> {
        let document: Document = serde_json::from_str(document)?;
        let known = self.state.read().pool.clone();
        let descriptors = document.into_descriptors(&known)?;
        self.install(descriptors)
    }

    /// Load a binary `FileDescriptorSet`
    pub fn load_protoset(&self, bytes: &[u8]) -> Result<Vec<MethodInfo>, SchemaError> {
        let descriptors = protoset::parse(bytes)?;
        self.install(descriptors)
    }

    /// Load a base64-encoded `FileDescriptorSet`
    pub fn load_embedded_protoset(&self, data: &str) -> Result<Vec<MethodInfo>, SchemaError> {
        let bytes = decode_base64(data.trim())?;
        self.load_protoset(&bytes)
    }

    pub fn load_protoset_file(&self, path: impl AsRef<Path>) -> Result<Vec<MethodInfo>, SchemaError> {
        let bytes = std::fs::read(path.as_ref())?;
        self.load_protoset(&bytes)
    }

    pub fn is_loaded(&self) -> bool {
        self.state.read().loaded
    }

    /// Every known method, sorted by path
    pub fn methods(&self) -> Vec<MethodInfo> {
        let state = self.state.read();
        let mut methods: Vec<MethodInfo> =
            state.methods.values().map(|entry| entry.info.clone()).collect();
        methods.sort_by(|a, b| a.full_method.cmp(&b.full_method));
        methods
    }

    fn install(&self, descriptors: Descriptors) -> Result<Vec<MethodInfo>, SchemaError> {
        let mut state = self.state.write();
        let mut pool = (*state.pool).clone();
        for message in descriptors.messages {
            pool.add_message(message);
        }
        for shape in descriptors.enums {
            pool.add_enum(shape);
        }

        let mut entries = Vec::new();
        for service in descriptors.services {
            for method in service.methods {
                for type_name in [&method.input, &method.output] {
                    if pool.message(type_name).is_none() {
                        return Err(SchemaError::UnknownType(type_name.clone()));
                    }
                }
                let info = MethodInfo {
                    package: service.package.clone(),
                    service: service.full_name.clone(),
                    full_method: format!("/{}/{}", service.full_name, method.name),
                    is_client_stream: method.client_streaming,
                    is_server_stream: method.server_streaming,
                };
                entries.push(MethodEntry {
                    info,
                    input: method.input,
                    output: method.output,
                });
            }
        }

        state.pool = Arc::new(pool);
        state.loaded = true;
        let mut infos = Vec::with_capacity(entries.len());
        for entry in entries {
            tracing::debug!(method = %entry.info.full_method, kind = entry.info.kind(), "Registered method");
            infos.push(entry.info.clone());
            state.methods.insert(entry.info.full_method.clone(), entry);
        }
        Ok(infos)
    }
}

impl SchemaProvider for SchemaRegistry {
    fn resolve(&self, method: &str) -> Result<Arc<MethodSchema>, SchemaError> {
        if method.is_empty() {
            return Err(SchemaError::EmptyMethod);
        }
        let state = self.state.read();
        if !state.loaded {
            return Err(SchemaError::NotLoaded);
        }
        let name = sanitize_method_name(method);
        let entry = state
            .methods
            .get(&name)
            .ok_or_else(|| SchemaError::NotFound(name.clone()))?;
        let lookup = |type_name: &str| {
            state
                .pool
                .message(type_name)
                .cloned()
                .ok_or_else(|| SchemaError::UnknownType(type_name.to_string()))
        };
        Ok(Arc::new(MethodSchema {
            info: entry.info.clone(),
            input: lookup(&entry.input)?,
            output: lookup(&entry.output)?,
            pool: state.pool.clone(),
        }))
    }

    fn pool(&self) -> Arc<DescriptorPool> {
        self.state.read().pool.clone()
    }
}

// ---------------------------------------------------------------------------
// JSON descriptor documents
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Document {
    Files { files: Vec<FileDoc> },
    Single(FileDoc),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileDoc {
    #[serde(default)]
    package: String,
    #[serde(default)]
    messages: Vec<MessageDoc>,
    #[serde(default)]
    enums: Vec<EnumDoc>,
    #[serde(default)]
    services: Vec<ServiceDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageDoc {
    name: String,
    #[serde(default)]
    fields: Vec<FieldDoc>,
    #[serde(default)]
    messages: Vec<MessageDoc>,
    #[serde(default)]
    enums: Vec<EnumDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FieldDoc {
    name: String,
    number: u32,
    #[serde(rename = "type", default)]
    ty: Option<String>,
    #[serde(default)]
    repeated: bool,
    #[serde(default)]
    json_name: Option<String>,
    #[serde(default)]
    map: Option<MapDoc>,
}

#[derive(Debug, Deserialize)]
struct MapDoc {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct EnumDoc {
    name: String,
    values: Vec<EnumValueDoc>,
}

#[derive(Debug, Deserialize)]
struct EnumValueDoc {
    name: String,
    number: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceDoc {
    name: String,
    #[serde(default)]
    methods: Vec<MethodDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MethodDoc {
    name: String,
    input: String,
    output: String,
    #[serde(default)]
    client_streaming: bool,
    #[serde(default)]
    server_streaming: bool,
}

/// Kinds of every declared type, for resolving relative references
#[derive(Default)]
struct Declared {
    messages: HashSet<String>,
    enums: HashSet<String>,
}

fn qualify(scope: &str, name: &str) -> String {
    if scope.is_empty() {
        name.to_string()
    } else {
        format!("{scope}.{name}")
    }
}

fn scalar_kind(name: &str) -> Option<FieldKind> {
    let kind = match name {
        "double" => FieldKind::Double,
        "float" => FieldKind::Float,
        "int32" => FieldKind::Int32,
        "int64" => FieldKind::Int64,
        "uint32" => FieldKind::Uint32,
        "uint64" => FieldKind::Uint64,
        "sint32" => FieldKind::Sint32,
        "sint64" => FieldKind::Sint64,
        "fixed32" => FieldKind::Fixed32,
        "fixed64" => FieldKind::Fixed64,
        "sfixed32" => FieldKind::Sfixed32,
        "sfixed64" => FieldKind::Sfixed64,
        "bool" => FieldKind::Bool,
        "string" => FieldKind::String,
        "bytes" => FieldKind::Bytes,
        _ => return None,
    };
    Some(kind)
}

impl Declared {
    fn collect(&mut self, scope: &str, messages: &[MessageDoc], enums: &[EnumDoc]) {
        for shape in enums {
            self.enums.insert(qualify(scope, &shape.name));
        }
        for message in messages {
            let full_name = qualify(scope, &message.name);
            self.collect(&full_name, &message.messages, &message.enums);
            self.messages.insert(full_name);
        }
    }

    /// Resolve `name` the way protoc does: innermost scope outward
    fn resolve(&self, scope: &str, name: &str, known: &DescriptorPool) -> Result<FieldKind, SchemaError> {
        if let Some(kind) = scalar_kind(name) {
            return Ok(kind);
        }
        let is_message = |n: &str| self.messages.contains(n) || known.message(n).is_some();
        let is_enum = |n: &str| self.enums.contains(n) || known.enum_shape(n).is_some();

        let candidates: Vec<String> = if let Some(absolute) = name.strip_prefix('.') {
            vec![absolute.to_string()]
        } else {
            let mut scopes = Vec::new();
            let mut current = scope;
            loop {
                scopes.push(qualify(current, name));
                match current.rfind('.') {
                    Some(idx) => current = &current[..idx],
                    None if !current.is_empty() => current = "",
                    None => break,
                }
            }
            scopes
        };

        for candidate in candidates {
            if is_message(&candidate) {
                return Ok(FieldKind::Message(candidate));
            }
            if is_enum(&candidate) {
                return Ok(FieldKind::Enum(candidate));
            }
        }
        Err(SchemaError::UnknownType(name.to_string()))
    }
}

impl Document {
    fn into_descriptors(self, known: &DescriptorPool) -> Result<Descriptors, SchemaError> {
        let files = match self {
            Document::Files { files } => files,
            Document::Single(file) => vec![file],
        };

        let mut declared = Declared::default();
        for file in &files {
            declared.collect(&file.package, &file.messages, &file.enums);
        }

        let mut out = Descriptors::default();
        for file in files {
            for shape in file.enums {
                out.enums.push(convert_enum(&file.package, shape));
            }
            for message in file.messages {
                convert_message(&file.package, message, &declared, known, &mut out)?;
            }
            for service in file.services {
                let full_name = qualify(&file.package, &service.name);
                let methods = service
                    .methods
                    .into_iter()
                    .map(|m| {
                        let input = declared.resolve(&file.package, &m.input, known)?;
                        let output = declared.resolve(&file.package, &m.output, known)?;
                        match (input, output) {
                            (FieldKind::Message(input), FieldKind::Message(output)) => Ok(MethodDef {
                                name: m.name,
                                input,
                                output,
                                client_streaming: m.client_streaming,
                                server_streaming: m.server_streaming,
                            }),
                            _ => Err(SchemaError::Invalid(format!(
                                "method {} must take and return messages",
                                m.name
                            ))),
                        }
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                out.services.push(ServiceDef {
                    package: file.package.clone(),
                    full_name,
                    methods,
                });
            }
        }
        Ok(out)
    }
}

fn convert_enum(scope: &str, doc: EnumDoc) -> EnumShape {
    EnumShape {
        full_name: qualify(scope, &doc.name),
        values: doc
            .values
            .into_iter()
            .map(|v| EnumValue {
                name: v.name,
                number: v.number,
            })
            .collect(),
    }
}

fn convert_message(
    scope: &str,
    doc: MessageDoc,
    declared: &Declared,
    known: &DescriptorPool,
    out: &mut Descriptors,
) -> Result<(), SchemaError> {
    let full_name = qualify(scope, &doc.name);
    for shape in doc.enums {
        out.enums.push(convert_enum(&full_name, shape));
    }
    for nested in doc.messages {
        convert_message(&full_name, nested, declared, known, out)?;
    }

    let mut fields = Vec::with_capacity(doc.fields.len());
    for field in doc.fields {
        let descriptor = if let Some(map) = &field.map {
            let entry_name = format!("{}.{}Entry", full_name, upper_camel(&field.name));
            let key = scalar_kind(&map.key).ok_or_else(|| {
                SchemaError::Invalid(format!("map key of {} must be a scalar", field.name))
            })?;
            let value = declared.resolve(&full_name, &map.value, known)?;
            let mut entry = MessageShape::new(
                entry_name.clone(),
                vec![
                    FieldDescriptor::new("key", 1, key),
                    FieldDescriptor::new("value", 2, value),
                ],
            );
            entry.map_entry = true;
            out.messages.push(entry);
            FieldDescriptor::new(field.name, field.number, FieldKind::Message(entry_name)).repeated()
        } else {
            let ty = field.ty.as_deref().ok_or_else(|| {
                SchemaError::Invalid(format!("field {} in {} has no type", field.name, full_name))
            })?;
            let kind = declared.resolve(&full_name, ty, known)?;
            let mut descriptor = FieldDescriptor::new(field.name, field.number, kind);
            descriptor.repeated = field.repeated;
            descriptor
        };
        let descriptor = match field.json_name {
            Some(json_name) => FieldDescriptor {
                json_name,
                ..descriptor
            },
            None => descriptor,
        };
        fields.push(descriptor);
    }

    out.messages.push(MessageShape::new(full_name, fields));
    Ok(())
}

/// `foo_bar` -> `FooBar`, the naming protoc uses for map entry types
fn upper_camel(name: &str) -> String {
    let camel = json_name_of(name);
    let mut chars = camel.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => camel,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PING: &str = r#"{
        "package": "connectrpc.ping.v1",
        "messages": [
            {"name": "CumSumRequest", "fields": [{"name": "number", "number": 1, "type": "int64"}]},
            {"name": "CumSumResponse", "fields": [{"name": "sum", "number": 1, "type": "int64"}]},
            {"name": "Meta", "fields": [
                {"name": "labels", "number": 1, "map": {"key": "string", "value": "string"}},
                {"name": "level", "number": 2, "type": "Level"}
            ], "enums": [{"name": "Level", "values": [{"name": "LOW", "number": 0}]}]}
        ],
        "services": [{"name": "PingService", "methods": [
            {"name": "CumSum", "input": "CumSumRequest", "output": "CumSumResponse",
             "clientStreaming": true, "serverStreaming": true}
        ]}]
    }"#;

    #[test]
    fn test_resolve_before_load() {
        let registry = SchemaRegistry::new();
        assert!(matches!(
            registry.resolve("a.B/C"),
            Err(SchemaError::NotLoaded)
        ));
        assert!(matches!(registry.resolve(""), Err(SchemaError::EmptyMethod)));
    }

    #[test]
    fn test_load_and_resolve_json() {
        let registry = SchemaRegistry::new();
        let methods = registry.load_descriptor_json(PING).unwrap();
        assert_eq!(methods.len(), 1);
        assert_eq!(methods[0].full_method, "/connectrpc.ping.v1.PingService/CumSum");
        assert_eq!(methods[0].kind(), "bidi-stream");

        let schema = registry
            .resolve("connectrpc.ping.v1.PingService/CumSum")
            .unwrap();
        assert_eq!(schema.input.full_name, "connectrpc.ping.v1.CumSumRequest");
        assert_eq!(schema.output.full_name, "connectrpc.ping.v1.CumSumResponse");
        assert!(schema.info.is_client_stream);
    }

    #[test]
    fn test_not_found() {
        let registry = SchemaRegistry::new();
        registry.load_descriptor_json(PING).unwrap();
        let err = registry.resolve("/connectrpc.ping.v1.PingService/Nope").unwrap_err();
        assert!(matches!(err, SchemaError::NotFound(name) if name.ends_with("/Nope")));
    }

    #[test]
    fn test_maps_and_nested_enums() {
        let registry = SchemaRegistry::new();
        registry.load_descriptor_json(PING).unwrap();
        let pool = registry.pool();
        let meta = pool.message("connectrpc.ping.v1.Meta").unwrap();
        let labels = meta.field_by_name("labels").unwrap();
        assert!(labels.repeated);
        let entry = pool.message("connectrpc.ping.v1.Meta.LabelsEntry").unwrap();
        assert!(entry.map_entry);
        let level = meta.field_by_name("level").unwrap();
        assert_eq!(level.kind, FieldKind::Enum("connectrpc.ping.v1.Meta.Level".into()));
    }

    #[test]
    fn test_unknown_type_reference() {
        let registry = SchemaRegistry::new();
        let err = registry
            .load_descriptor_json(
                r#"{"messages": [{"name": "A", "fields": [{"name": "b", "number": 1, "type": "Missing"}]}]}"#,
            )
            .unwrap_err();
        assert!(matches!(err, SchemaError::UnknownType(name) if name == "Missing"));
        assert!(!registry.is_loaded());
    }

    #[test]
    fn test_later_loads_can_reference_earlier_types() {
        let registry = SchemaRegistry::new();
        registry.load_descriptor_json(PING).unwrap();
        registry
            .load_descriptor_json(
                r#"{"package": "other", "messages": [{"name": "Wrap", "fields": [
                    {"name": "inner", "number": 1, "type": ".connectrpc.ping.v1.CumSumRequest"}
                ]}]}"#,
            )
            .unwrap();
        assert!(registry.pool().message("other.Wrap").is_some());
        assert_eq!(registry.methods().len(), 1);
    }

    #[test]
    fn test_upper_camel() {
        assert_eq!(upper_camel("labels"), "Labels");
        assert_eq!(upper_camel("extra_labels"), "ExtraLabels");
    }
}
