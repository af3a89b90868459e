use crate::error::FormatError;
use crate::format::Record;
use crate::models::{CsvOptions, Row, RowBatch, Schema, Value};

/// Delimited text, one record per line.
///
/// Fields appear in schema order followed by an optional weight column. Records without the
/// weight column are insertions of weight 1.
#[derive(Clone, Debug)]
pub struct CsvFormat {
    delimiter: u8,
    null_string: String,
}

impl CsvFormat {
    pub fn new(opts: &CsvOptions) -> Self {
        Self {
            // Validation guarantees an ASCII delimiter.
            delimiter: opts.delimiter as u8,
            null_string: opts.null_string.clone(),
        }
    }

    pub(super) fn decode(&self, bytes: &[u8], schema: &Schema) -> Vec<Record> {
        let mut reader = ::csv::ReaderBuilder::new()
            .has_headers(false)
            .delimiter(self.delimiter)
            .flexible(true)
            .from_reader(bytes);
        reader
            .byte_records()
            .enumerate()
            .map(|(idx, res)| match res {
                Ok(record) => self.decode_record(idx, &record, schema),
                Err(err) => Err(FormatError::at(idx, err.to_string())),
            })
            .collect()
    }

    fn decode_record(&self, idx: usize, record: &::csv::ByteRecord, schema: &Schema) -> Record {
        let arity = schema.len();
        let weight = if record.len() == arity {
            1
        } else if record.len() == arity + 1 {
            let text = field_text(idx, record, arity)?;
            text.parse::<i64>().map_err(|_| FormatError::at(idx, format!("invalid weight {:?}", text)))?
        } else {
            return Err(FormatError::at(idx, format!("expected {} or {} fields, got {}", arity, arity + 1, record.len())));
        };

        let mut row = Row::with_capacity(arity);
        for (pos, field) in schema.fields.iter().enumerate() {
            let text = field_text(idx, record, pos)?;
            let value = if text == self.null_string {
                Value::Null
            } else {
                Value::parse(text, field.data_type).map_err(|msg| FormatError::at(idx, format!("field {}: {}", field.name, msg)))?
            };
            field.check(&value).map_err(|msg| FormatError::at(idx, msg))?;
            row.push(value);
        }
        Ok((row, weight))
    }

    pub(super) fn encode(&self, batch: &RowBatch, schema: &Schema) -> Result<Vec<u8>, FormatError> {
        let mut writer = ::csv::WriterBuilder::new()
            .has_headers(false)
            .delimiter(self.delimiter)
            .terminator(::csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());
        let mut fields = Vec::with_capacity(schema.len() + 1);
        for (idx, (row, weight)) in batch.iter().enumerate() {
            fields.clear();
            for value in row.iter() {
                let text = match value {
                    Value::Null => self.null_string.clone(),
                    Value::String(val) if *val == self.null_string => {
                        return Err(FormatError::at(idx, format!("text value {:?} collides with the configured null string", val)));
                    }
                    Value::String(val) => val.clone(),
                    other => other.to_string(),
                };
                fields.push(text);
            }
            fields.push(weight.to_string());
            writer.write_record(&fields).map_err(|err| FormatError::at(idx, err.to_string()))?;
        }
        writer.into_inner().map_err(|err| FormatError::new(err.to_string()))
    }
}

fn field_text<'a>(idx: usize, record: &'a ::csv::ByteRecord, pos: usize) -> Result<&'a str, FormatError> {
    let raw = record.get(pos).unwrap_or_default();
    std::str::from_utf8(raw).map_err(|_| FormatError::at(idx, format!("field {} is not valid utf-8", pos)))
}
