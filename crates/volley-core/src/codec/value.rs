//! Normalization of opaque values against a schema
//!
//! Every codec funnels input through [`normalize`], which validates a value
//! and rewrites it into the canonical representation.

use serde_json::{Map, Number, Value};

use super::{decode_base64, encode_base64, type_name_of, CodecError, MAX_DEPTH};
use crate::schema::{DescriptorPool, FieldDescriptor, FieldKind, MessageShape, Schema};

/// How unknown object keys are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownFields {
    Reject,
    Ignore,
}

/// Validate `value` against `schema` and return its canonical form.
///
/// `null` normalizes to the empty object.
pub fn normalize(
    value: &Value,
    schema: Schema<'_>,
    unknown: UnknownFields,
) -> Result<Value, CodecError> {
    let map = normalize_message(value, schema.message, schema.pool, unknown, 0)?;
    Ok(Value::Object(map))
}

fn normalize_message(
    value: &Value,
    shape: &MessageShape,
    pool: &DescriptorPool,
    unknown: UnknownFields,
    depth: usize,
) -> Result<Map<String, Value>, CodecError> {
    if depth > MAX_DEPTH {
        return Err(CodecError::TooDeep);
    }
    let object = match value {
        Value::Null => return Ok(Map::new()),
        Value::Object(object) => object,
        other => {
            return Err(CodecError::NotAnObject {
                message: shape.full_name.clone(),
                found: type_name_of(other),
            })
        }
    };

    let mut out = Map::new();
    for (key, field_value) in object {
        let Some(field) = shape.field_by_name(key) else {
            if unknown == UnknownFields::Reject {
                return Err(CodecError::UnknownField {
                    message: shape.full_name.clone(),
                    field: key.clone(),
                });
            }
            continue;
        };
        if field_value.is_null() {
            continue;
        }
        let normalized = normalize_field(field_value, field, pool, unknown, depth)?;
        out.insert(field.json_name.clone(), normalized);
    }
    Ok(out)
}

fn normalize_field(
    value: &Value,
    field: &FieldDescriptor,
    pool: &DescriptorPool,
    unknown: UnknownFields,
    depth: usize,
) -> Result<Value, CodecError> {
    if let Some(entry) = map_entry(field, pool) {
        return normalize_map(value, field, entry, pool, unknown, depth);
    }
    if field.repeated {
        let Value::Array(items) = value else {
            return Err(invalid(field, format!("expected array, got {}", type_name_of(value))));
        };
        let normalized = items
            .iter()
            .map(|item| normalize_single(item, &field.kind, field, pool, unknown, depth))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Value::Array(normalized));
    }
    normalize_single(value, &field.kind, field, pool, unknown, depth)
}

/// The entry shape when `field` is a `map<K, V>`
pub(super) fn map_entry<'p>(
    field: &FieldDescriptor,
    pool: &'p DescriptorPool,
) -> Option<&'p MessageShape> {
    if !field.repeated {
        return None;
    }
    match &field.kind {
        FieldKind::Message(name) => pool
            .message(name)
            .map(|m| m.as_ref())
            .filter(|m| m.map_entry),
        _ => None,
    }
}

fn normalize_map(
    value: &Value,
    field: &FieldDescriptor,
    entry: &MessageShape,
    pool: &DescriptorPool,
    unknown: UnknownFields,
    depth: usize,
) -> Result<Value, CodecError> {
    let Value::Object(object) = value else {
        return Err(invalid(field, format!("expected object, got {}", type_name_of(value))));
    };
    let (key_field, value_field) = entry_fields(entry)?;
    let mut out = Map::new();
    for (key, item) in object {
        let key = normalize_map_key(key, &key_field.kind, field)?;
        if item.is_null() {
            return Err(invalid(field, format!("map value for key {key:?} is null")));
        }
        let item = normalize_single(item, &value_field.kind, field, pool, unknown, depth)?;
        out.insert(key, item);
    }
    Ok(Value::Object(out))
}

pub(super) fn entry_fields(
    entry: &MessageShape,
) -> Result<(&FieldDescriptor, &FieldDescriptor), CodecError> {
    match (entry.field_by_number(1), entry.field_by_number(2)) {
        (Some(key), Some(value)) => Ok((key, value)),
        _ => Err(CodecError::Malformed(format!(
            "map entry {} lacks key or value",
            entry.full_name
        ))),
    }
}

fn normalize_map_key(
    key: &str,
    kind: &FieldKind,
    field: &FieldDescriptor,
) -> Result<String, CodecError> {
    let ok = match kind {
        FieldKind::String => true,
        FieldKind::Bool => key == "true" || key == "false",
        FieldKind::Int32 | FieldKind::Sint32 | FieldKind::Sfixed32 => key.parse::<i32>().is_ok(),
        FieldKind::Int64 | FieldKind::Sint64 | FieldKind::Sfixed64 => key.parse::<i64>().is_ok(),
        FieldKind::Uint32 | FieldKind::Fixed32 => key.parse::<u32>().is_ok(),
        FieldKind::Uint64 | FieldKind::Fixed64 => key.parse::<u64>().is_ok(),
        _ => false,
    };
    if ok {
        Ok(key.to_string())
    } else {
        Err(invalid(field, format!("invalid map key {key:?}")))
    }
}

fn normalize_single(
    value: &Value,
    kind: &FieldKind,
    field: &FieldDescriptor,
    pool: &DescriptorPool,
    unknown: UnknownFields,
    depth: usize,
) -> Result<Value, CodecError> {
    match kind {
        FieldKind::Int32 | FieldKind::Sint32 | FieldKind::Sfixed32 => {
            let n = integer(value, field)?;
            i32::try_from(n)
                .map(Value::from)
                .map_err(|_| invalid(field, format!("{n} out of range for int32")))
        }
        FieldKind::Int64 | FieldKind::Sint64 | FieldKind::Sfixed64 => {
            let n = integer(value, field)?;
            i64::try_from(n)
                .map(Value::from)
                .map_err(|_| invalid(field, format!("{n} out of range for int64")))
        }
        FieldKind::Uint32 | FieldKind::Fixed32 => {
            let n = integer(value, field)?;
            u32::try_from(n)
                .map(Value::from)
                .map_err(|_| invalid(field, format!("{n} out of range for uint32")))
        }
        FieldKind::Uint64 | FieldKind::Fixed64 => {
            let n = integer(value, field)?;
            u64::try_from(n)
                .map(Value::from)
                .map_err(|_| invalid(field, format!("{n} out of range for uint64")))
        }
        FieldKind::Double => float(value, field).map(float_value),
        FieldKind::Float => {
            let f = float(value, field)?;
            if f.is_finite() && f.abs() > f32::MAX as f64 {
                return Err(invalid(field, format!("{f} out of range for float")));
            }
            Ok(float_value(narrow(f)))
        }
        FieldKind::Bool => match value {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            other => Err(expected(field, "boolean", other)),
        },
        FieldKind::String => match value {
            Value::String(s) => Ok(Value::String(s.clone())),
            other => Err(expected(field, "string", other)),
        },
        FieldKind::Bytes => match value {
            Value::String(s) => decode_base64(s)
                .map(|bytes| Value::String(encode_base64(&bytes)))
                .map_err(|e| invalid(field, format!("invalid base64: {e}"))),
            other => Err(expected(field, "base64 string", other)),
        },
        FieldKind::Enum(name) => {
            let shape = pool
                .enum_shape(name)
                .ok_or_else(|| CodecError::UnknownType(name.clone()))?;
            match value {
                Value::String(s) => match shape.number_of(s) {
                    Some(_) => Ok(Value::String(s.clone())),
                    None => Err(invalid(field, format!("unknown value {s:?} for enum {name}"))),
                },
                Value::Number(_) => {
                    let n = integer(value, field)?;
                    let n = i32::try_from(n)
                        .map_err(|_| invalid(field, format!("{n} out of range for enum")))?;
                    Ok(enum_value(shape.name_of(n), n))
                }
                other => Err(expected(field, "enum name or number", other)),
            }
        }
        FieldKind::Message(name) => {
            let shape = pool
                .message(name)
                .ok_or_else(|| CodecError::UnknownType(name.clone()))?;
            let map = normalize_message(value, shape, pool, unknown, depth + 1)?;
            Ok(Value::Object(map))
        }
    }
}

/// Enum name when known, number otherwise
pub(super) fn enum_value(name: Option<&str>, number: i32) -> Value {
    match name {
        Some(name) => Value::String(name.to_string()),
        None => Value::from(number),
    }
}

/// Finite floats become numbers, specials become their JSON string names
pub(super) fn float_value(f: f64) -> Value {
    if f.is_nan() {
        Value::String("NaN".into())
    } else if f.is_infinite() {
        let name = if f > 0.0 { "Infinity" } else { "-Infinity" };
        Value::String(name.into())
    } else {
        Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// Shortest decimal that round-trips through `f32`
pub(super) fn narrow(f: f64) -> f64 {
    let single = f as f32;
    if !single.is_finite() {
        return single as f64;
    }
    single.to_string().parse().unwrap_or(single as f64)
}

/// Integers as i128 so every proto range can be checked in one place
fn integer(value: &Value, field: &FieldDescriptor) -> Result<i128, CodecError> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i as i128)
            } else if let Some(u) = n.as_u64() {
                Ok(u as i128)
            } else {
                let f = n.as_f64().unwrap_or(f64::NAN);
                if f.fract() == 0.0 && f.abs() < 1.9e19 {
                    Ok(f as i128)
                } else {
                    Err(invalid(field, format!("{n} is not an integer")))
                }
            }
        }
        Value::String(s) => s
            .trim()
            .parse::<i128>()
            .map_err(|_| invalid(field, format!("{s:?} is not an integer"))),
        other => Err(expected(field, "integer", other)),
    }
}

fn float(value: &Value, field: &FieldDescriptor) -> Result<f64, CodecError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| invalid(field, format!("{n} is not a number"))),
        Value::String(s) => match s.as_str() {
            "NaN" => Ok(f64::NAN),
            "Infinity" => Ok(f64::INFINITY),
            "-Infinity" => Ok(f64::NEG_INFINITY),
            other => other
                .trim()
                .parse::<f64>()
                .map_err(|_| invalid(field, format!("{other:?} is not a number"))),
        },
        other => Err(expected(field, "number", other)),
    }
}

fn invalid(field: &FieldDescriptor, reason: String) -> CodecError {
    CodecError::InvalidValue {
        field: field.name.clone(),
        reason,
    }
}

fn expected(field: &FieldDescriptor, what: &str, found: &Value) -> CodecError {
    invalid(field, format!("expected {what}, got {}", type_name_of(found)))
}
