//! Format codecs.
//!
//! A codec converts between the bytes carried by a transport and weighted row batches of a
//! pipeline's schema. Decoding applies the connector's error policy per record: under
//! `SkipAndCount` malformed records are dropped & counted, under `FailFast` the first malformed
//! record aborts the whole batch.

mod binary;
mod delimited;
mod json;

use std::sync::Arc;

use crate::error::FormatError;
use crate::models::{ErrorPolicy, FormatConfig, Row, RowBatch, Schema};

pub use self::binary::BinaryFormat;
pub use self::delimited::CsvFormat;
pub use self::json::JsonFormat;

/// The result of decoding a payload.
#[derive(Debug, Default, PartialEq)]
pub struct Decoded {
    /// The rows which decoded successfully.
    pub batch: RowBatch,
    /// The number of records rejected under the skip-and-count policy.
    pub rejected: u64,
}

/// The closed set of supported formats.
#[derive(Clone, Debug)]
pub enum Format {
    Csv(CsvFormat),
    Json(JsonFormat),
    Binary(BinaryFormat),
}

/// A codec bound to a schema & error policy.
#[derive(Clone, Debug)]
pub struct Codec {
    format: Format,
    schema: Arc<Schema>,
    policy: ErrorPolicy,
}

impl Codec {
    /// Create a new instance.
    pub fn new(config: &FormatConfig, schema: Arc<Schema>, policy: ErrorPolicy) -> Self {
        let format = match config {
            FormatConfig::Csv(opts) => Format::Csv(CsvFormat::new(opts)),
            FormatConfig::Json => Format::Json(JsonFormat),
            FormatConfig::Binary => Format::Binary(BinaryFormat),
        };
        Self { format, schema, policy }
    }

    /// Decode the given payload, applying this codec's error policy.
    pub fn decode(&self, bytes: &[u8]) -> Result<Decoded, FormatError> {
        let records = match &self.format {
            Format::Csv(format) => format.decode(bytes, &self.schema),
            Format::Json(format) => format.decode(bytes, &self.schema),
            Format::Binary(format) => format.decode(bytes, &self.schema),
        };
        let mut decoded = Decoded::default();
        for record in records {
            match record {
                Ok((row, weight)) => decoded.batch.push(row, weight),
                Err(err) => match self.policy {
                    ErrorPolicy::FailFast => return Err(err),
                    ErrorPolicy::SkipAndCount => {
                        tracing::debug!(error = %err, "skipping malformed record");
                        decoded.rejected += 1;
                    }
                },
            }
        }
        Ok(decoded)
    }

    /// Encode the given batch.
    ///
    /// Encoding is deterministic: equal batches always produce identical bytes. Rows which do not
    /// conform to the schema are always an error, regardless of policy.
    pub fn encode(&self, batch: &RowBatch) -> Result<Vec<u8>, FormatError> {
        for (idx, (row, _)) in batch.iter().enumerate() {
            self.schema.check(row).map_err(|msg| FormatError::at(idx, msg))?;
        }
        match &self.format {
            Format::Csv(format) => format.encode(batch, &self.schema),
            Format::Json(format) => format.encode(batch, &self.schema),
            Format::Binary(format) => format.encode(batch),
        }
    }
}

/// The outcome of decoding a single record.
pub(crate) type Record = Result<(Row, i64), FormatError>;
