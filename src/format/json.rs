use serde_json::{Map, Number, Value as JsonValue};

use crate::error::FormatError;
use crate::format::Record;
use crate::models::{DataType, Field, Row, RowBatch, Schema, Value};

const KEY_INSERT: &str = "insert";
const KEY_DELETE: &str = "delete";
const KEY_WEIGHT: &str = "weight";

/// Newline-delimited JSON update objects.
///
/// Each line is `{"insert": {..}}` or `{"delete": {..}}` with an optional unsigned `"weight"`.
/// Inserts carry a positive weight and deletes a negative one.
#[derive(Clone, Debug)]
pub struct JsonFormat;

impl JsonFormat {
    pub(super) fn decode(&self, bytes: &[u8], schema: &Schema) -> Vec<Record> {
        bytes
            .split(|byte| *byte == b'\n')
            .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
            .enumerate()
            .map(|(idx, line)| decode_line(line, schema).map_err(|msg| FormatError::at(idx, msg)))
            .collect()
    }

    pub(super) fn encode(&self, batch: &RowBatch, schema: &Schema) -> Result<Vec<u8>, FormatError> {
        let mut buf = Vec::new();
        for (idx, (row, weight)) in batch.iter().enumerate() {
            let mut obj = Map::new();
            for (field, value) in schema.fields.iter().zip(row.iter()) {
                let val = encode_value(value).map_err(|msg| FormatError::at(idx, msg))?;
                obj.insert(field.name.clone(), val);
            }
            let key = if *weight < 0 { KEY_DELETE } else { KEY_INSERT };
            let mut update = Map::new();
            update.insert(key.into(), JsonValue::Object(obj));
            let magnitude = weight.unsigned_abs();
            if magnitude != 1 {
                update.insert(KEY_WEIGHT.into(), JsonValue::Number(magnitude.into()));
            }
            serde_json::to_writer(&mut buf, &JsonValue::Object(update)).map_err(|err| FormatError::at(idx, err.to_string()))?;
            buf.push(b'\n');
        }
        Ok(buf)
    }
}

fn decode_line(line: &[u8], schema: &Schema) -> Result<(Row, i64), String> {
    let mut update = match serde_json::from_slice::<JsonValue>(line).map_err(|err| err.to_string())? {
        JsonValue::Object(obj) => obj,
        other => return Err(format!("expected an update object, got {}", other)),
    };
    let magnitude = match update.remove(KEY_WEIGHT) {
        None => 1u64,
        Some(val) => val.as_u64().ok_or_else(|| format!("invalid weight {}", val))?,
    };
    let (sign, obj) = match (update.remove(KEY_INSERT), update.remove(KEY_DELETE)) {
        (Some(obj), None) => (1i128, obj),
        (None, Some(obj)) => (-1i128, obj),
        (Some(_), Some(_)) => return Err("update holds both insert and delete".into()),
        (None, None) => return Err("update holds neither insert nor delete".into()),
    };
    if let Some(key) = update.keys().next() {
        return Err(format!("unknown update key {:?}", key));
    }
    let weight = i64::try_from(sign * magnitude as i128).map_err(|_| format!("weight {} out of range", magnitude))?;

    let mut obj = match obj {
        JsonValue::Object(obj) => obj,
        other => return Err(format!("expected a row object, got {}", other)),
    };
    let mut row = Row::with_capacity(schema.len());
    for field in schema.fields.iter() {
        let value = match obj.remove(&field.name) {
            None => Value::Null,
            Some(val) => decode_value(field, val)?,
        };
        field.check(&value)?;
        row.push(value);
    }
    if let Some(key) = obj.keys().next() {
        return Err(format!("unknown field {:?}", key));
    }
    Ok((row, weight))
}

fn decode_value(field: &Field, val: JsonValue) -> Result<Value, String> {
    let mismatch = |val: &JsonValue| format!("field {} expects {}, got {}", field.name, field.data_type, val);
    Ok(match (field.data_type, val) {
        (_, JsonValue::Null) => Value::Null,
        (DataType::Bool, JsonValue::Bool(val)) => Value::Bool(val),
        (DataType::Int, JsonValue::Number(num)) => Value::Int(num.as_i64().ok_or_else(|| mismatch(&JsonValue::Number(num.clone())))?),
        (DataType::Float, JsonValue::Number(num)) => Value::Float(num.as_f64().ok_or_else(|| mismatch(&JsonValue::Number(num.clone())))?),
        (DataType::String, JsonValue::String(val)) => Value::String(val),
        (_, other) => return Err(mismatch(&other)),
    })
}

fn encode_value(value: &Value) -> Result<JsonValue, String> {
    Ok(match value {
        Value::Null => JsonValue::Null,
        Value::Bool(val) => JsonValue::Bool(*val),
        Value::Int(val) => JsonValue::Number((*val).into()),
        Value::Float(val) => JsonValue::Number(Number::from_f64(*val).ok_or_else(|| format!("non-finite float {}", val))?),
        Value::String(val) => JsonValue::String(val.clone()),
    })
}
