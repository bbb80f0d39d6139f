//! Protobuf binary codec (`application/proto`)
//!
//! Writes the canonical value in field declaration order, packing repeated
//! scalars. Reads packed and unpacked repeated fields and skips unknown ones.

use bytes::Bytes;
use serde_json::{Map, Value};

use super::value::{
    entry_fields, enum_value, float_value, map_entry, narrow, normalize, UnknownFields,
};
use super::{decode_base64, encode_base64, Codec, CodecError, MAX_DEPTH};
use crate::schema::{DescriptorPool, FieldDescriptor, FieldKind, MessageShape, Schema};

const WIRE_TYPE_VARINT: u8 = 0;
const WIRE_TYPE_FIXED64: u8 = 1;
const WIRE_TYPE_LEN: u8 = 2;
const WIRE_TYPE_START_GROUP: u8 = 3;
const WIRE_TYPE_END_GROUP: u8 = 4;
const WIRE_TYPE_FIXED32: u8 = 5;

/// Binary protobuf wire format driven by a runtime schema
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtoCodec;

impl Codec for ProtoCodec {
    fn name(&self) -> &'static str {
        "proto"
    }

    fn encode(&self, value: &Value, schema: Schema<'_>) -> Result<Bytes, CodecError> {
        let canonical = normalize(value, schema, UnknownFields::Reject)?;
        let mut buf = Vec::new();
        if let Value::Object(map) = &canonical {
            write_message(map, schema.message, schema.pool, &mut buf)?;
        }
        Ok(Bytes::from(buf))
    }

    fn decode(&self, bytes: &[u8], schema: Schema<'_>) -> Result<Value, CodecError> {
        read_message(bytes, schema.message, schema.pool, 0).map(Value::Object)
    }
}

fn wire_type(kind: &FieldKind) -> u8 {
    match kind {
        FieldKind::Double | FieldKind::Fixed64 | FieldKind::Sfixed64 => WIRE_TYPE_FIXED64,
        FieldKind::Float | FieldKind::Fixed32 | FieldKind::Sfixed32 => WIRE_TYPE_FIXED32,
        FieldKind::String | FieldKind::Bytes | FieldKind::Message(_) => WIRE_TYPE_LEN,
        _ => WIRE_TYPE_VARINT,
    }
}

fn encode_varint(mut value: u64, buf: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn decode_varint(buf: &mut &[u8]) -> Result<u64, CodecError> {
    let mut result: u64 = 0;
    let mut shift = 0;
    loop {
        let Some((&byte, rest)) = buf.split_first() else {
            return Err(malformed("truncated varint"));
        };
        *buf = rest;
        result |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift >= 64 {
            return Err(malformed("varint overflows 64 bits"));
        }
    }
}

fn encode_tag(field_number: u32, wire_type: u8, buf: &mut Vec<u8>) {
    encode_varint(((field_number as u64) << 3) | (wire_type as u64), buf);
}

fn decode_tag(buf: &mut &[u8]) -> Result<(u32, u8), CodecError> {
    let tag = decode_varint(buf)?;
    let field_number = u32::try_from(tag >> 3).map_err(|_| malformed("field number overflow"))?;
    if field_number == 0 {
        return Err(malformed("field number 0"));
    }
    Ok((field_number, (tag & 0x07) as u8))
}

fn encode_len_delimited(field_number: u32, data: &[u8], buf: &mut Vec<u8>) {
    encode_tag(field_number, WIRE_TYPE_LEN, buf);
    encode_varint(data.len() as u64, buf);
    buf.extend_from_slice(data);
}

fn take<'a>(buf: &mut &'a [u8], len: usize) -> Result<&'a [u8], CodecError> {
    if buf.len() < len {
        return Err(malformed("truncated field"));
    }
    let (head, rest) = buf.split_at(len);
    *buf = rest;
    Ok(head)
}

fn take_array<const N: usize>(buf: &mut &[u8]) -> Result<[u8; N], CodecError> {
    let mut out = [0u8; N];
    out.copy_from_slice(take(buf, N)?);
    Ok(out)
}

fn decode_len_delimited<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], CodecError> {
    let len = decode_varint(buf)?;
    let len = usize::try_from(len).map_err(|_| malformed("length overflow"))?;
    take(buf, len)
}

fn malformed(reason: &str) -> CodecError {
    CodecError::Malformed(reason.to_string())
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn write_message(
    map: &Map<String, Value>,
    shape: &MessageShape,
    pool: &DescriptorPool,
    buf: &mut Vec<u8>,
) -> Result<(), CodecError> {
    for field in &shape.fields {
        let Some(value) = map.get(&field.json_name) else {
            continue;
        };

        if let Some(entry) = map_entry(field, pool) {
            let (key_field, value_field) = entry_fields(entry)?;
            let Value::Object(entries) = value else {
                return Err(not_canonical(field));
            };
            for (key, item) in entries {
                let mut inner = Vec::new();
                write_single(&map_key_value(key, &key_field.kind), key_field, pool, &mut inner)?;
                write_single(item, value_field, pool, &mut inner)?;
                encode_len_delimited(field.number, &inner, buf);
            }
        } else if field.repeated {
            let Value::Array(items) = value else {
                return Err(not_canonical(field));
            };
            if field.kind.is_packable() {
                if items.is_empty() {
                    continue;
                }
                let mut packed = Vec::new();
                for item in items {
                    write_scalar(item, field, pool, &mut packed)?;
                }
                encode_len_delimited(field.number, &packed, buf);
            } else {
                for item in items {
                    write_single(item, field, pool, buf)?;
                }
            }
        } else {
            write_single(value, field, pool, buf)?;
        }
    }
    Ok(())
}

fn map_key_value(key: &str, kind: &FieldKind) -> Value {
    match kind {
        FieldKind::String => Value::String(key.to_string()),
        FieldKind::Bool => Value::Bool(key == "true"),
        FieldKind::Uint32 | FieldKind::Uint64 | FieldKind::Fixed32 | FieldKind::Fixed64 => {
            key.parse::<u64>().map(Value::from).unwrap_or(Value::Null)
        }
        _ => key.parse::<i64>().map(Value::from).unwrap_or(Value::Null),
    }
}

/// One occurrence of `field` (singular, or one element of a repeated field)
fn write_single(
    value: &Value,
    field: &FieldDescriptor,
    pool: &DescriptorPool,
    buf: &mut Vec<u8>,
) -> Result<(), CodecError> {
    match &field.kind {
        FieldKind::Message(name) => {
            let shape = pool
                .message(name)
                .ok_or_else(|| CodecError::UnknownType(name.clone()))?;
            let mut inner = Vec::new();
            match value {
                Value::Object(map) => write_message(map, shape, pool, &mut inner)?,
                Value::Null => {}
                _ => return Err(not_canonical(field)),
            }
            encode_len_delimited(field.number, &inner, buf);
        }
        FieldKind::String => {
            let s = value.as_str().ok_or_else(|| not_canonical(field))?;
            encode_len_delimited(field.number, s.as_bytes(), buf);
        }
        FieldKind::Bytes => {
            let s = value.as_str().ok_or_else(|| not_canonical(field))?;
            let bytes = decode_base64(s).map_err(|_| not_canonical(field))?;
            encode_len_delimited(field.number, &bytes, buf);
        }
        kind => {
            encode_tag(field.number, wire_type(kind), buf);
            write_scalar(value, field, pool, buf)?;
        }
    }
    Ok(())
}

/// Scalar payload without its tag
fn write_scalar(
    value: &Value,
    field: &FieldDescriptor,
    pool: &DescriptorPool,
    buf: &mut Vec<u8>,
) -> Result<(), CodecError> {
    let signed = || value.as_i64().ok_or_else(|| not_canonical(field));
    let unsigned = || value.as_u64().ok_or_else(|| not_canonical(field));
    let float = || canonical_float(value).ok_or_else(|| not_canonical(field));

    match &field.kind {
        FieldKind::Int32 | FieldKind::Int64 => encode_varint(signed()? as u64, buf),
        FieldKind::Uint32 | FieldKind::Uint64 => encode_varint(unsigned()?, buf),
        FieldKind::Sint32 => {
            let n = signed()? as i32;
            encode_varint(((n << 1) ^ (n >> 31)) as u32 as u64, buf);
        }
        FieldKind::Sint64 => {
            let n = signed()?;
            encode_varint(((n << 1) ^ (n >> 63)) as u64, buf);
        }
        FieldKind::Bool => {
            let b = value.as_bool().ok_or_else(|| not_canonical(field))?;
            encode_varint(b as u64, buf);
        }
        FieldKind::Enum(name) => {
            let number = match value {
                Value::String(s) => pool
                    .enum_shape(name)
                    .and_then(|shape| shape.number_of(s))
                    .ok_or_else(|| not_canonical(field))? as i64,
                _ => signed()?,
            };
            encode_varint(number as u64, buf);
        }
        FieldKind::Fixed32 => buf.extend_from_slice(&(unsigned()? as u32).to_le_bytes()),
        FieldKind::Sfixed32 => buf.extend_from_slice(&(signed()? as i32).to_le_bytes()),
        FieldKind::Float => buf.extend_from_slice(&(float()? as f32).to_le_bytes()),
        FieldKind::Fixed64 => buf.extend_from_slice(&unsigned()?.to_le_bytes()),
        FieldKind::Sfixed64 => buf.extend_from_slice(&signed()?.to_le_bytes()),
        FieldKind::Double => buf.extend_from_slice(&float()?.to_le_bytes()),
        FieldKind::String | FieldKind::Bytes | FieldKind::Message(_) => {
            return Err(not_canonical(field))
        }
    }
    Ok(())
}

fn canonical_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => match s.as_str() {
            "NaN" => Some(f64::NAN),
            "Infinity" => Some(f64::INFINITY),
            "-Infinity" => Some(f64::NEG_INFINITY),
            _ => None,
        },
        _ => None,
    }
}

fn not_canonical(field: &FieldDescriptor) -> CodecError {
    CodecError::InvalidValue {
        field: field.name.clone(),
        reason: "value does not match the field type".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

fn read_message(
    mut buf: &[u8],
    shape: &MessageShape,
    pool: &DescriptorPool,
    depth: usize,
) -> Result<Map<String, Value>, CodecError> {
    if depth > MAX_DEPTH {
        return Err(CodecError::TooDeep);
    }
    let mut out = Map::new();
    while !buf.is_empty() {
        let (number, wire) = decode_tag(&mut buf)?;
        match shape.field_by_number(number) {
            Some(field) => read_field(field, wire, &mut buf, &mut out, pool, depth)?,
            None => skip_field(number, wire, &mut buf, depth)?,
        }
    }
    Ok(out)
}

fn read_field(
    field: &FieldDescriptor,
    wire: u8,
    buf: &mut &[u8],
    out: &mut Map<String, Value>,
    pool: &DescriptorPool,
    depth: usize,
) -> Result<(), CodecError> {
    if let Some(entry) = map_entry(field, pool) {
        if wire != WIRE_TYPE_LEN {
            return Err(wire_mismatch(field));
        }
        let bytes = decode_len_delimited(buf)?;
        let (key_field, value_field) = entry_fields(entry)?;
        let decoded = read_message(bytes, entry, pool, depth + 1)?;
        let key = match decoded.get(&key_field.json_name) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => match default_value(&key_field.kind, pool) {
                Value::String(s) => s,
                other => other.to_string(),
            },
        };
        let value = decoded
            .get(&value_field.json_name)
            .cloned()
            .unwrap_or_else(|| default_value(&value_field.kind, pool));
        let slot = out
            .entry(field.json_name.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(map) = slot {
            map.insert(key, value);
        }
        return Ok(());
    }

    if field.repeated {
        let slot = out
            .entry(field.json_name.clone())
            .or_insert_with(|| Value::Array(Vec::new()));
        let Value::Array(items) = slot else {
            return Err(wire_mismatch(field));
        };
        if wire == WIRE_TYPE_LEN && field.kind.is_packable() {
            let mut packed = decode_len_delimited(buf)?;
            while !packed.is_empty() {
                items.push(read_scalar(field, &mut packed, pool)?);
            }
        } else {
            items.push(read_single(field, wire, buf, pool, depth)?);
        }
        return Ok(());
    }

    let value = read_single(field, wire, buf, pool, depth)?;
    // Repeated occurrences of a message field merge
    if let Value::Object(more) = &value {
        if let Some(Value::Object(existing)) = out.get_mut(&field.json_name) {
            existing.extend(more.clone());
            return Ok(());
        }
    }
    out.insert(field.json_name.clone(), value);
    Ok(())
}

fn read_single(
    field: &FieldDescriptor,
    wire: u8,
    buf: &mut &[u8],
    pool: &DescriptorPool,
    depth: usize,
) -> Result<Value, CodecError> {
    if wire != wire_type(&field.kind) {
        return Err(wire_mismatch(field));
    }
    match &field.kind {
        FieldKind::String => {
            let bytes = decode_len_delimited(buf)?;
            let s = std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidValue {
                field: field.name.clone(),
                reason: "string is not valid UTF-8".to_string(),
            })?;
            Ok(Value::String(s.to_string()))
        }
        FieldKind::Bytes => {
            let bytes = decode_len_delimited(buf)?;
            Ok(Value::String(encode_base64(bytes)))
        }
        FieldKind::Message(name) => {
            let shape = pool
                .message(name)
                .ok_or_else(|| CodecError::UnknownType(name.clone()))?;
            let bytes = decode_len_delimited(buf)?;
            read_message(bytes, shape, pool, depth + 1).map(Value::Object)
        }
        _ => read_scalar(field, buf, pool),
    }
}

fn read_scalar(
    field: &FieldDescriptor,
    buf: &mut &[u8],
    pool: &DescriptorPool,
) -> Result<Value, CodecError> {
    let value = match &field.kind {
        FieldKind::Int32 => Value::from(decode_varint(buf)? as i32),
        FieldKind::Int64 => Value::from(decode_varint(buf)? as i64),
        FieldKind::Uint32 => Value::from(decode_varint(buf)? as u32),
        FieldKind::Uint64 => Value::from(decode_varint(buf)?),
        FieldKind::Sint32 => {
            let n = decode_varint(buf)? as u32;
            Value::from(((n >> 1) as i32) ^ -((n & 1) as i32))
        }
        FieldKind::Sint64 => {
            let n = decode_varint(buf)?;
            Value::from(((n >> 1) as i64) ^ -((n & 1) as i64))
        }
        FieldKind::Bool => Value::Bool(decode_varint(buf)? != 0),
        FieldKind::Enum(name) => {
            let number = decode_varint(buf)? as i32;
            let label = pool.enum_shape(name).and_then(|shape| shape.name_of(number));
            enum_value(label, number)
        }
        FieldKind::Fixed32 => Value::from(u32::from_le_bytes(take_array(buf)?)),
        FieldKind::Sfixed32 => Value::from(i32::from_le_bytes(take_array(buf)?)),
        FieldKind::Float => float_value(narrow(f32::from_le_bytes(take_array(buf)?) as f64)),
        FieldKind::Fixed64 => Value::from(u64::from_le_bytes(take_array(buf)?)),
        FieldKind::Sfixed64 => Value::from(i64::from_le_bytes(take_array(buf)?)),
        FieldKind::Double => float_value(f64::from_le_bytes(take_array(buf)?)),
        FieldKind::String | FieldKind::Bytes | FieldKind::Message(_) => {
            return Err(wire_mismatch(field))
        }
    };
    Ok(value)
}

fn skip_field(number: u32, wire: u8, buf: &mut &[u8], depth: usize) -> Result<(), CodecError> {
    match wire {
        WIRE_TYPE_VARINT => {
            decode_varint(buf)?;
        }
        WIRE_TYPE_FIXED64 => {
            take(buf, 8)?;
        }
        WIRE_TYPE_LEN => {
            decode_len_delimited(buf)?;
        }
        WIRE_TYPE_FIXED32 => {
            take(buf, 4)?;
        }
        WIRE_TYPE_START_GROUP => {
            if depth > MAX_DEPTH {
                return Err(CodecError::TooDeep);
            }
            loop {
                let (inner, inner_wire) = decode_tag(buf)?;
                if inner_wire == WIRE_TYPE_END_GROUP {
                    if inner != number {
                        return Err(malformed("mismatched end group"));
                    }
                    break;
                }
                skip_field(inner, inner_wire, buf, depth + 1)?;
            }
        }
        WIRE_TYPE_END_GROUP => return Err(malformed("unexpected end group")),
        other => return Err(CodecError::Malformed(format!("invalid wire type {other}"))),
    }
    Ok(())
}

/// Proto3 zero value, used for map entries missing their key or value
fn default_value(kind: &FieldKind, pool: &DescriptorPool) -> Value {
    match kind {
        FieldKind::Bool => Value::Bool(false),
        FieldKind::String | FieldKind::Bytes => Value::String(String::new()),
        FieldKind::Double | FieldKind::Float => float_value(0.0),
        FieldKind::Enum(name) => {
            let label = pool.enum_shape(name).and_then(|shape| shape.name_of(0));
            enum_value(label, 0)
        }
        FieldKind::Message(_) => Value::Object(Map::new()),
        _ => Value::from(0),
    }
}

fn wire_mismatch(field: &FieldDescriptor) -> CodecError {
    CodecError::Malformed(format!("unexpected wire type for field {}", field.name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::fixtures;
    use serde_json::json;

    fn encode(type_name: &str, value: Value) -> Vec<u8> {
        let pool = fixtures::pool();
        let schema = pool.schema(type_name).unwrap();
        ProtoCodec.encode(&value, schema).unwrap().to_vec()
    }

    fn decode(type_name: &str, bytes: &[u8]) -> Result<Value, CodecError> {
        let pool = fixtures::pool();
        let schema = pool.schema(type_name).unwrap();
        ProtoCodec.decode(bytes, schema)
    }

    #[test]
    fn test_encode_simple_message() {
        assert_eq!(encode("test.CumSumRequest", json!({"number": 5})), vec![0x08, 0x05]);
        assert_eq!(encode("test.CumSumRequest", json!({"number": 300})), vec![0x08, 0xac, 0x02]);
    }

    #[test]
    fn test_null_and_empty_encode_empty_message() {
        assert!(encode("test.CumSumRequest", Value::Null).is_empty());
        assert!(encode("test.CumSumRequest", json!({})).is_empty());
        assert_eq!(decode("test.CumSumResponse", &[]).unwrap(), json!({}));
    }

    #[test]
    fn test_negative_int32_uses_ten_bytes() {
        let bytes = encode("test.Everything", json!({"count": -1}));
        assert_eq!(bytes.len(), 11);
        assert_eq!(decode("test.Everything", &bytes).unwrap(), json!({"count": -1}));
    }

    #[test]
    fn test_zigzag() {
        assert_eq!(encode("test.Everything", json!({"delta": -1})), vec![0x20, 0x01]);
        assert_eq!(encode("test.Everything", json!({"delta": 1})), vec![0x20, 0x02]);
    }

    #[test]
    fn test_repeated_scalars_are_packed() {
        let bytes = encode("test.Everything", json!({"values": [1, 2, 3]}));
        assert_eq!(bytes, vec![0x5a, 0x03, 0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_unpacked_repeated_is_accepted() {
        let value = decode("test.Everything", &[0x58, 0x01, 0x58, 0x02]).unwrap();
        assert_eq!(value, json!({"values": [1, 2]}));
    }

    #[test]
    fn test_unknown_fields_are_skipped() {
        // field 99 varint, then sum = 7
        let value = decode("test.CumSumResponse", &[0x98, 0x06, 0x01, 0x08, 0x07]).unwrap();
        assert_eq!(value, json!({"sum": 7}));
    }

    #[test]
    fn test_truncated_input_is_rejected() {
        assert!(decode("test.CumSumResponse", &[0x08]).is_err());
        assert!(decode("test.Everything", &[0x0a, 0x05, b'a']).is_err());
    }

    #[test]
    fn test_wire_type_mismatch_is_rejected() {
        // sum declared varint, sent as fixed32
        let err = decode("test.CumSumResponse", &[0x0d, 0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn test_round_trip_everything() {
        let value = json!({
            "name": "volley",
            "count": 42,
            "big": 18446744073709551615u64,
            "delta": -9000000000i64,
            "ratio": 2.5,
            "scale": 0.1,
            "enabled": true,
            "blob": "AQID",
            "color": "COLOR_RED",
            "child": {"number": 0},
            "values": [1, -2, 3],
            "tags": ["a", "b"],
            "labels": {"x": 1, "y": 0},
            "fixed": 7,
            "neg": -7,
            "userId": 12
        });
        let bytes = encode("test.Everything", value.clone());
        assert_eq!(decode("test.Everything", &bytes).unwrap(), value);
    }

    #[test]
    fn test_float_specials_round_trip() {
        let value = json!({"ratio": "-Infinity", "scale": "NaN"});
        let bytes = encode("test.Everything", value.clone());
        assert_eq!(decode("test.Everything", &bytes).unwrap(), value);
    }

    #[test]
    fn test_unknown_enum_number_is_kept() {
        let value = decode("test.Everything", &[0x48, 0x09]).unwrap();
        assert_eq!(value, json!({"color": 9}));
    }
}
