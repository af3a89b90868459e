//! Data models.

pub mod pipeline;
pub mod row;
pub mod wire;

pub use pipeline::{
    BrokerTransport, ConnectorConfig, CsvOptions, Direction, EngineKind, ErrorPolicy, FileTransport, FormatConfig, PipelineConfig, RetryConfig, TransportConfig,
};
pub use row::{DataType, Field, Row, RowBatch, Schema, Value};
