use prost::Message;

use crate::error::FormatError;
use crate::format::Record;
use crate::models::wire::{wire_value::Kind, WireRow, WireValue};
use crate::models::{DataType, Row, RowBatch, Schema, Value};

/// A stream of length-delimited protobuf rows.
#[derive(Clone, Debug)]
pub struct BinaryFormat;

impl BinaryFormat {
    pub(super) fn decode(&self, bytes: &[u8], schema: &Schema) -> Vec<Record> {
        let (mut buf, mut records) = (bytes, vec![]);
        let mut idx = 0;
        while !buf.is_empty() {
            match WireRow::decode_length_delimited(&mut buf) {
                Ok(wire) => records.push(decode_row(wire, schema).map_err(|msg| FormatError::at(idx, msg))),
                Err(err) => {
                    // Framing is lost, so the remainder of the payload is one rejected record.
                    records.push(Err(FormatError::at(idx, format!("invalid row framing: {}", err))));
                    break;
                }
            }
            idx += 1;
        }
        records
    }

    pub(super) fn encode(&self, batch: &RowBatch) -> Result<Vec<u8>, FormatError> {
        let mut buf = Vec::new();
        for (idx, (row, weight)) in batch.iter().enumerate() {
            let wire = WireRow {
                values: row.iter().map(encode_value).collect(),
                weight: *weight,
            };
            wire.encode_length_delimited(&mut buf).map_err(|err| FormatError::at(idx, err.to_string()))?;
        }
        Ok(buf)
    }
}

fn decode_row(wire: WireRow, schema: &Schema) -> Result<(Row, i64), String> {
    if wire.values.len() != schema.len() {
        return Err(format!("expected {} fields, got {}", schema.len(), wire.values.len()));
    }
    let mut row = Row::with_capacity(schema.len());
    for (field, wire_val) in schema.fields.iter().zip(wire.values.into_iter()) {
        let value = match (field.data_type, wire_val.kind) {
            (_, None) | (_, Some(Kind::Null(_))) => Value::Null,
            (DataType::Bool, Some(Kind::Bool(val))) => Value::Bool(val),
            (DataType::Int, Some(Kind::Int(val))) => Value::Int(val),
            (DataType::Float, Some(Kind::Float(val))) => Value::Float(val),
            (DataType::String, Some(Kind::Text(val))) => Value::String(val),
            (expected, Some(_)) => return Err(format!("field {} expects {}, got a different type", field.name, expected)),
        };
        field.check(&value)?;
        row.push(value);
    }
    Ok((row, wire.weight))
}

fn encode_value(value: &Value) -> WireValue {
    let kind = match value {
        Value::Null => Kind::Null(true),
        Value::Bool(val) => Kind::Bool(*val),
        Value::Int(val) => Kind::Int(*val),
        Value::Float(val) => Kind::Float(*val),
        Value::String(val) => Kind::Text(val.clone()),
    };
    WireValue { kind: Some(kind) }
}
