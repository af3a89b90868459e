//! Pipeline configuration documents.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::models::row::Schema;

/// The default backpressure watermark of input connectors.
pub const DEFAULT_MAX_BUFFERED_BATCHES: u32 = 16;
/// The default number of records read from a file per batch.
pub const DEFAULT_MAX_BATCH_RECORDS: usize = 1024;

/// The configuration of a pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// The unique name of this pipeline.
    pub name: String,
    /// The built-in engine which this pipeline is to run.
    #[serde(default)]
    pub engine: EngineKind,
    /// The schema shared by all rows flowing through this pipeline.
    pub schema: Schema,
    /// The pipeline's input connectors, in scheduling order.
    pub inputs: Vec<ConnectorConfig>,
    /// The pipeline's output connectors.
    pub outputs: Vec<ConnectorConfig>,
}

/// The built-in engines available to pipelines.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Forward every input batch to every output.
    #[default]
    Identity,
    /// Merge identical rows within a step by summing their weights.
    Consolidate,
}

/// The direction of a connector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
        }
    }
}

/// The configuration of a single input or output connector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// The name of this connector, unique within its pipeline.
    pub name: String,
    /// The transport which this connector reads from or writes to.
    pub transport: TransportConfig,
    /// The format of the data carried by the transport.
    pub format: FormatConfig,
    /// The policy applied to malformed records.
    pub on_error: ErrorPolicy,
    /// The backpressure watermark; ignored by output connectors.
    #[serde(default = "ConnectorConfig::default_max_buffered_batches")]
    pub max_buffered_batches: u32,
    /// The retry policy applied to transient transport errors.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Transport-specific connector parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    Broker(BrokerTransport),
    File(FileTransport),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BrokerTransport {
    /// The address of the broker, as `{scheme}://{location}`.
    pub address: String,
    /// The topic to read from or publish to.
    pub topic: String,
    /// The partitions to read from; outputs publish to exactly one partition.
    #[serde(default = "BrokerTransport::default_partitions")]
    pub partitions: Vec<u32>,
    /// The consumer group used for offset commits, defaulting to the pipeline name.
    #[serde(default)]
    pub group: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileTransport {
    /// The path of the file.
    pub path: String,
    /// Keep reading as the file grows instead of treating EOF as the end of input.
    #[serde(default)]
    pub follow: bool,
    /// The maximum number of records read per batch.
    #[serde(default = "FileTransport::default_max_batch_records")]
    pub max_batch_records: usize,
}

/// The format of the data carried by a transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FormatConfig {
    /// Delimited text.
    Csv(CsvOptions),
    /// Newline-delimited insert/delete JSON objects.
    Json,
    /// Length-delimited protobuf rows.
    Binary,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsvOptions {
    #[serde(default = "CsvOptions::default_delimiter")]
    pub delimiter: char,
    #[serde(default = "CsvOptions::default_null_string")]
    pub null_string: String,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            delimiter: Self::default_delimiter(),
            null_string: Self::default_null_string(),
        }
    }
}

/// The policy applied to malformed records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Count and drop malformed records, keeping the rest of the batch.
    SkipAndCount,
    /// Abort the batch on the first malformed record.
    FailFast,
}

/// Bounded exponential backoff parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// The total number of attempts made before an error becomes permanent.
    #[serde(default = "RetryConfig::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "RetryConfig::default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "RetryConfig::default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            initial_backoff_ms: Self::default_initial_backoff_ms(),
            max_backoff_ms: Self::default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    fn default_max_attempts() -> u32 {
        3
    }

    fn default_initial_backoff_ms() -> u64 {
        100
    }

    fn default_max_backoff_ms() -> u64 {
        5_000
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl ConnectorConfig {
    fn default_max_buffered_batches() -> u32 {
        DEFAULT_MAX_BUFFERED_BATCHES
    }
}

impl BrokerTransport {
    fn default_partitions() -> Vec<u32> {
        vec![0]
    }
}

impl FileTransport {
    fn default_max_batch_records() -> usize {
        DEFAULT_MAX_BATCH_RECORDS
    }
}

impl CsvOptions {
    fn default_delimiter() -> char {
        ','
    }

    fn default_null_string() -> String {
        "\\N".into()
    }
}

impl FormatConfig {
    /// Whether records of this format are newline terminated.
    pub fn is_line_oriented(&self) -> bool {
        matches!(self, Self::Csv(_) | Self::Json)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Csv(_) => "csv",
            Self::Json => "json",
            Self::Binary => "binary",
        }
    }
}

impl TransportConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Broker(_) => "broker",
            Self::File(_) => "file",
        }
    }
}

impl PipelineConfig {
    /// All connectors of this pipeline along with their direction.
    pub fn connectors(&self) -> impl Iterator<Item = (Direction, &ConnectorConfig)> {
        self.inputs
            .iter()
            .map(|cfg| (Direction::Input, cfg))
            .chain(self.outputs.iter().map(|cfg| (Direction::Output, cfg)))
    }

    /// Validate this config, checking names, schema, and connector/format compatibility.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_name("pipeline", &self.name)?;
        if self.schema.is_empty() {
            return Err(ConfigError("pipeline schema must declare at least one field".into()));
        }
        let mut field_names = HashSet::new();
        for field in self.schema.fields.iter() {
            validate_name("schema field", &field.name)?;
            if !field_names.insert(field.name.as_str()) {
                return Err(ConfigError(format!("duplicate schema field {}", field.name)));
            }
        }
        if self.inputs.is_empty() {
            return Err(ConfigError("pipeline must declare at least one input connector".into()));
        }
        if self.outputs.is_empty() {
            return Err(ConfigError("pipeline must declare at least one output connector".into()));
        }
        let mut connector_names = HashSet::new();
        for (direction, connector) in self.connectors() {
            if !connector_names.insert(connector.name.as_str()) {
                return Err(ConfigError(format!("duplicate connector name {}", connector.name)));
            }
            connector.validate(direction)?;
        }
        Ok(())
    }
}

impl ConnectorConfig {
    /// Validate this connector's config for the given direction.
    pub fn validate(&self, direction: Direction) -> Result<(), ConfigError> {
        validate_name("connector", &self.name)?;
        let ctx = |msg: String| ConfigError(format!("{} connector {}: {}", direction, self.name, msg));

        match &self.transport {
            TransportConfig::Broker(broker) => {
                match broker.address.split_once("://") {
                    Some((scheme, location)) if !scheme.is_empty() && !location.is_empty() => (),
                    _ => return Err(ctx(format!("broker address {:?} must have the form scheme://location", broker.address))),
                }
                if broker.topic.is_empty() {
                    return Err(ctx("broker topic must not be empty".into()));
                }
                if broker.partitions.is_empty() {
                    return Err(ctx("broker transport must name at least one partition".into()));
                }
                let unique: HashSet<_> = broker.partitions.iter().collect();
                if unique.len() != broker.partitions.len() {
                    return Err(ctx("broker partitions must be unique".into()));
                }
                if direction == Direction::Output && broker.partitions.len() != 1 {
                    return Err(ctx("broker outputs publish to exactly one partition".into()));
                }
            }
            TransportConfig::File(file) => {
                if file.path.is_empty() {
                    return Err(ctx("file path must not be empty".into()));
                }
                if file.max_batch_records == 0 {
                    return Err(ctx("max_batch_records must be at least 1".into()));
                }
                if !self.format.is_line_oriented() {
                    return Err(ctx(format!(
                        "format {} is not line oriented and is incompatible with the {} transport",
                        self.format.kind(),
                        self.transport.kind()
                    )));
                }
            }
        }

        if let FormatConfig::Csv(opts) = &self.format {
            if !opts.delimiter.is_ascii() || matches!(opts.delimiter, '\n' | '\r' | '"') {
                return Err(ctx(format!("invalid csv delimiter {:?}", opts.delimiter)));
            }
            if opts.null_string.contains(opts.delimiter) || opts.null_string.contains('\n') {
                return Err(ctx("csv null_string must not contain the delimiter or a newline".into()));
            }
        }

        if direction == Direction::Input && self.max_buffered_batches == 0 {
            return Err(ctx("max_buffered_batches must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ctx("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ctx("retry.initial_backoff_ms must not exceed retry.max_backoff_ms".into()));
        }
        Ok(())
    }
}

/// Names are restricted to `[a-zA-Z0-9_-]`, as they are used in storage keys & metric labels.
fn validate_name(what: &str, name: &str) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(ConfigError(format!("{} name must not be empty", what)));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(ConfigError(format!("{} name {:?} may only contain [a-zA-Z0-9_-]", what, name)));
    }
    Ok(())
}
