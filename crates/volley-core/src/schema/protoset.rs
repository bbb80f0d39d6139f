//! Binary `FileDescriptorSet` loading
//!
//! The set is itself a protobuf message, so it is decoded with the proto
//! codec against a hand-built subset of `descriptor.proto`.

use serde_json::Value;

use super::registry::{Descriptors, MethodDef, ServiceDef};
use super::{
    json_name_of, DescriptorPool, EnumShape, EnumValue, FieldDescriptor, FieldKind, MessageShape,
    SchemaError,
};
use crate::codec::{Codec, ProtoCodec};

const FILE_DESCRIPTOR_SET: &str = "google.protobuf.FileDescriptorSet";
const LABEL_REPEATED: i64 = 3;

fn message(name: &str, fields: Vec<FieldDescriptor>) -> MessageShape {
    MessageShape::new(format!("google.protobuf.{name}"), fields)
}

fn nested(name: &str, number: u32, type_name: &str) -> FieldDescriptor {
    FieldDescriptor::new(
        name,
        number,
        FieldKind::Message(format!("google.protobuf.{type_name}")),
    )
}

fn string(name: &str, number: u32) -> FieldDescriptor {
    FieldDescriptor::new(name, number, FieldKind::String)
}

/// The parts of `descriptor.proto` needed to read message, enum and service shapes
pub(crate) fn bootstrap_pool() -> DescriptorPool {
    let mut pool = DescriptorPool::new();
    pool.add_message(message(
        "FileDescriptorSet",
        vec![nested("file", 1, "FileDescriptorProto").repeated()],
    ));
    pool.add_message(message(
        "FileDescriptorProto",
        vec![
            string("name", 1),
            string("package", 2),
            nested("message_type", 4, "DescriptorProto").repeated(),
            nested("enum_type", 5, "EnumDescriptorProto").repeated(),
            nested("service", 6, "ServiceDescriptorProto").repeated(),
        ],
    ));
    pool.add_message(message(
        "DescriptorProto",
        vec![
            string("name", 1),
            nested("field", 2, "FieldDescriptorProto").repeated(),
            nested("nested_type", 3, "DescriptorProto").repeated(),
            nested("enum_type", 4, "EnumDescriptorProto").repeated(),
            nested("options", 7, "MessageOptions"),
        ],
    ));
    pool.add_message(message(
        "MessageOptions",
        vec![FieldDescriptor::new("map_entry", 7, FieldKind::Bool)],
    ));
    pool.add_message(message(
        "FieldDescriptorProto",
        vec![
            string("name", 1),
            FieldDescriptor::new("number", 3, FieldKind::Int32),
            FieldDescriptor::new("label", 4, FieldKind::Int32),
            FieldDescriptor::new("type", 5, FieldKind::Int32),
            string("type_name", 6),
            string("json_name", 10),
        ],
    ));
    pool.add_message(message(
        "EnumDescriptorProto",
        vec![
            string("name", 1),
            nested("value", 2, "EnumValueDescriptorProto").repeated(),
        ],
    ));
    pool.add_message(message(
        "EnumValueDescriptorProto",
        vec![
            string("name", 1),
            FieldDescriptor::new("number", 2, FieldKind::Int32),
        ],
    ));
    pool.add_message(message(
        "ServiceDescriptorProto",
        vec![
            string("name", 1),
            nested("method", 2, "MethodDescriptorProto").repeated(),
        ],
    ));
    pool.add_message(message(
        "MethodDescriptorProto",
        vec![
            string("name", 1),
            string("input_type", 2),
            string("output_type", 3),
            FieldDescriptor::new("client_streaming", 5, FieldKind::Bool),
            FieldDescriptor::new("server_streaming", 6, FieldKind::Bool),
        ],
    ));
    pool
}

pub(super) fn parse(bytes: &[u8]) -> Result<Descriptors, SchemaError> {
    let pool = bootstrap_pool();
    let schema = pool
        .schema(FILE_DESCRIPTOR_SET)
        .ok_or_else(|| SchemaError::UnknownType(FILE_DESCRIPTOR_SET.to_string()))?;
    let set = ProtoCodec
        .decode(bytes, schema)
        .map_err(|e| SchemaError::Invalid(format!("couldn't unmarshal protoset: {e}")))?;

    let mut out = Descriptors::default();
    for file in items(&set, "file") {
        let package = text(file, "package");
        for shape in items(file, "enumType") {
            out.enums.push(read_enum(&package, shape));
        }
        for msg in items(file, "messageType") {
            read_message(&package, msg, &mut out)?;
        }
        for service in items(file, "service") {
            let full_name = qualify(&package, &text(service, "name"));
            let methods = items(service, "method")
                .map(|m| MethodDef {
                    name: text(m, "name"),
                    input: text(m, "inputType").trim_start_matches('.').to_string(),
                    output: text(m, "outputType").trim_start_matches('.').to_string(),
                    client_streaming: flag(m, "clientStreaming"),
                    server_streaming: flag(m, "serverStreaming"),
                })
                .collect();
            out.services.push(ServiceDef {
                package: package.clone(),
                full_name,
                methods,
            });
        }
    }
    Ok(out)
}

fn read_message(scope: &str, msg: &Value, out: &mut Descriptors) -> Result<(), SchemaError> {
    let full_name = qualify(scope, &text(msg, "name"));
    for shape in items(msg, "enumType") {
        out.enums.push(read_enum(&full_name, shape));
    }
    for inner in items(msg, "nestedType") {
        read_message(&full_name, inner, out)?;
    }

    let mut fields = Vec::new();
    for field in items(msg, "field") {
        let name = text(field, "name");
        let ty = number(field, "type");
        let kind = FieldKind::from_proto_type(ty, &text(field, "typeName")).ok_or_else(|| {
            SchemaError::Invalid(format!("field {name} in {full_name} has unknown type {ty}"))
        })?;
        let json_name = match text(field, "jsonName") {
            j if j.is_empty() => json_name_of(&name),
            j => j,
        };
        let field_number = u32::try_from(number(field, "number"))
            .map_err(|_| SchemaError::Invalid(format!("field {name} has an invalid number")))?;
        fields.push(FieldDescriptor {
            name,
            json_name,
            number: field_number,
            kind,
            repeated: number(field, "label") == LABEL_REPEATED,
        });
    }

    let mut shape = MessageShape::new(full_name, fields);
    shape.map_entry = msg
        .get("options")
        .map(|options| flag(options, "mapEntry"))
        .unwrap_or(false);
    out.messages.push(shape);
    Ok(())
}

fn read_enum(scope: &str, shape: &Value) -> EnumShape {
    EnumShape {
        full_name: qualify(scope, &text(shape, "name")),
        values: items(shape, "value")
            .map(|v| EnumValue {
                name: text(v, "name"),
                number: number(v, "number") as i32,
            })
            .collect(),
    }
}

fn qualify(scope: &str, name: &str) -> String {
    if scope.is_empty() {
        name.to_string()
    } else {
        format!("{scope}.{name}")
    }
}

fn items<'a>(value: &'a Value, key: &str) -> impl Iterator<Item = &'a Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn text(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn number(value: &Value, key: &str) -> i64 {
    value.get(key).and_then(Value::as_i64).unwrap_or(0)
}

fn flag(value: &Value, key: &str) -> bool {
    value.get(key).and_then(Value::as_bool).unwrap_or(false)
}
