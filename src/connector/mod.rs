//! Connectors.
//!
//! Connectors form a closed set of variants over {input, output} × {broker, file}. Inputs expose
//! `poll`/`ack`/`seek`, outputs expose `send`/`flush`. The variant is selected from config when
//! the connector is opened; the pipeline controller only ever sees the enums defined here.

mod broker;
#[cfg(test)]
mod broker_test;
mod file;
#[cfg(test)]
mod file_test;
mod retry;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConnectorError};
use crate::models::{ConnectorConfig, Direction, TransportConfig};

pub use self::broker::{Broker, BrokerClients, BrokerInput, BrokerOutput, BrokerRecord, MemoryBroker};
pub use self::file::{FileInput, FileOutput, RecordFraming};
pub use self::retry::RetryPolicy;

pub const METRIC_BATCHES_PROCESSED: &str = "hadron_connect_batches_processed";
pub const METRIC_ROWS_PROCESSED: &str = "hadron_connect_rows_processed";
pub const METRIC_ROWS_REJECTED: &str = "hadron_connect_rows_rejected";
pub const METRIC_RETRIES: &str = "hadron_connect_retries";
pub const METRIC_BACKLOG_DEPTH: &str = "hadron_connect_backlog_depth";

/// Register the descriptions of all connector metrics.
pub fn describe_metrics() {
    metrics::describe_counter!(METRIC_BATCHES_PROCESSED, metrics::Unit::Count, "batches processed by a connector");
    metrics::describe_counter!(METRIC_ROWS_PROCESSED, metrics::Unit::Count, "rows processed by a connector");
    metrics::describe_counter!(METRIC_ROWS_REJECTED, metrics::Unit::Count, "malformed rows rejected by a connector's error policy");
    metrics::describe_counter!(METRIC_RETRIES, metrics::Unit::Count, "transient transport errors retried by a connector");
    metrics::describe_gauge!(METRIC_BACKLOG_DEPTH, metrics::Unit::Count, "batches buffered by a connector awaiting acknowledgement");
}

/// A transport-specific cursor from which an input connector can resume.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ResumptionToken {
    /// The next offset to read, per partition.
    Offsets {
        #[serde(with = "partition_offsets")]
        offsets: BTreeMap<u32, u64>,
    },
    /// The byte position from which the next record is read.
    File { position: u64 },
}

/// Partition offsets are stored as a list of `{partition, offset}` objects, since integer map
/// keys can not be decoded from JSON inside an internally tagged enum.
mod partition_offsets {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct PartitionOffset {
        partition: u32,
        offset: u64,
    }

    pub fn serialize<S: Serializer>(offsets: &BTreeMap<u32, u64>, ser: S) -> Result<S::Ok, S::Error> {
        ser.collect_seq(offsets.iter().map(|(partition, offset)| PartitionOffset {
            partition: *partition,
            offset: *offset,
        }))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<BTreeMap<u32, u64>, D::Error> {
        let offsets = Vec::<PartitionOffset>::deserialize(de)?;
        Ok(offsets.into_iter().map(|entry| (entry.partition, entry.offset)).collect())
    }
}

/// Counters & gauges of a single connector.
///
/// Counters are kept in atomics for the control plane and mirrored into the metrics recorder.
#[derive(Debug)]
pub struct ConnectorStats {
    pipeline: String,
    connector: String,
    direction: Direction,
    batches: AtomicU64,
    rows: AtomicU64,
    rejected: AtomicU64,
    retries: AtomicU64,
    backlog: AtomicU64,
}

/// A point-in-time copy of a connector's counters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorSnapshot {
    pub name: String,
    pub direction: Direction,
    pub batches_processed: u64,
    pub rows_processed: u64,
    pub rows_rejected: u64,
    pub retries: u64,
    pub backlog: u64,
}

impl ConnectorStats {
    pub fn new(pipeline: &str, connector: &str, direction: Direction) -> Self {
        Self {
            pipeline: pipeline.into(),
            connector: connector.into(),
            direction,
            batches: AtomicU64::new(0),
            rows: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            backlog: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.connector
    }

    fn labels(&self) -> [(&'static str, String); 2] {
        [("pipeline", self.pipeline.clone()), ("connector", self.connector.clone())]
    }

    /// Record a processed batch of the given number of rows.
    pub fn record_batch(&self, rows: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.rows.fetch_add(rows as u64, Ordering::Relaxed);
        metrics::counter!(METRIC_BATCHES_PROCESSED, &self.labels()).increment(1);
        metrics::counter!(METRIC_ROWS_PROCESSED, &self.labels()).increment(rows as u64);
    }

    pub fn add_rejected(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.rejected.fetch_add(count, Ordering::Relaxed);
        metrics::counter!(METRIC_ROWS_REJECTED, &self.labels()).increment(count);
    }

    pub fn incr_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(METRIC_RETRIES, &self.labels()).increment(1);
    }

    pub fn set_backlog(&self, depth: usize) {
        self.backlog.store(depth as u64, Ordering::Relaxed);
        metrics::gauge!(METRIC_BACKLOG_DEPTH, &self.labels()).set(depth as f64);
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ConnectorSnapshot {
        ConnectorSnapshot {
            name: self.connector.clone(),
            direction: self.direction,
            batches_processed: self.batches.load(Ordering::Relaxed),
            rows_processed: self.rows.load(Ordering::Relaxed),
            rows_rejected: self.rejected(),
            retries: self.retries(),
            backlog: self.backlog.load(Ordering::Relaxed),
        }
    }
}

/// The resources needed to open a connector.
#[derive(Clone)]
pub struct ConnectorContext {
    /// The name of the pipeline owning the connector.
    pub pipeline: Arc<String>,
    /// The broker clients available to the process.
    pub brokers: BrokerClients,
    /// The stats of the connector being opened.
    pub stats: Arc<ConnectorStats>,
}

/// An input connector.
pub enum InputConnector {
    Broker(BrokerInput),
    File(FileInput),
}

impl InputConnector {
    /// Open the input connector described by the given config.
    pub fn open(config: &ConnectorConfig, ctx: &ConnectorContext) -> Result<Self, ConfigError> {
        let retry = RetryPolicy::new(&config.retry);
        Ok(match &config.transport {
            TransportConfig::Broker(transport) => {
                let client = ctx.brokers.resolve(&transport.address)?;
                let group = transport.group.clone().unwrap_or_else(|| ctx.pipeline.as_ref().clone());
                Self::Broker(BrokerInput::new(client, transport, group, config.max_buffered_batches as usize, retry, ctx.stats.clone()))
            }
            TransportConfig::File(transport) => {
                let framing = RecordFraming::for_format(&config.format);
                Self::File(FileInput::new(transport, framing, config.max_buffered_batches as usize, retry, ctx.stats.clone()))
            }
        })
    }

    /// Poll for the next batch of bytes, blocking for at most the given timeout.
    pub async fn poll(&mut self, timeout: Duration) -> Result<Option<(Vec<u8>, ResumptionToken)>, ConnectorError> {
        match self {
            Self::Broker(inner) => inner.poll(timeout).await,
            Self::File(inner) => inner.poll(timeout).await,
        }
    }

    /// Record that the batch of the given token has been accepted downstream.
    ///
    /// Acking a token which has already been acked has no effect.
    pub async fn ack(&mut self, token: &ResumptionToken) -> Result<(), ConnectorError> {
        match self {
            Self::Broker(inner) => inner.ack(token).await,
            Self::File(inner) => inner.ack(token),
        }
    }

    /// Resume reading from the given checkpoint.
    pub async fn seek(&mut self, token: &ResumptionToken) -> Result<(), ConnectorError> {
        match self {
            Self::Broker(inner) => inner.seek(token),
            Self::File(inner) => inner.seek(token).await,
        }
    }

    /// The committed progress of this connector.
    pub fn checkpoint(&self) -> ResumptionToken {
        match self {
            Self::Broker(inner) => inner.checkpoint(),
            Self::File(inner) => inner.checkpoint(),
        }
    }

    /// The number of polled batches which have not yet been acked.
    pub fn unacked(&self) -> usize {
        match self {
            Self::Broker(inner) => inner.unacked(),
            Self::File(inner) => inner.unacked(),
        }
    }

    /// True once no more batches can be polled until some are acked.
    pub fn saturated(&self) -> bool {
        match self {
            Self::Broker(inner) => inner.saturated(),
            Self::File(inner) => inner.saturated(),
        }
    }

    /// The maximum number of unacked batches this connector may hold.
    pub fn capacity(&self) -> usize {
        match self {
            Self::Broker(inner) => inner.capacity(),
            Self::File(inner) => inner.capacity(),
        }
    }
}

/// An output connector.
pub enum OutputConnector {
    Broker(BrokerOutput),
    File(FileOutput),
}

impl OutputConnector {
    /// Open the output connector described by the given config.
    pub fn open(config: &ConnectorConfig, ctx: &ConnectorContext) -> Result<Self, ConfigError> {
        let retry = RetryPolicy::new(&config.retry);
        Ok(match &config.transport {
            TransportConfig::Broker(transport) => {
                let client = ctx.brokers.resolve(&transport.address)?;
                Self::Broker(BrokerOutput::new(client, transport, retry, ctx.stats.clone()))
            }
            TransportConfig::File(transport) => Self::File(FileOutput::new(transport, retry, ctx.stats.clone())),
        })
    }

    /// Send the given bytes, returning once the transport has acknowledged them.
    pub async fn send(&mut self, bytes: Vec<u8>) -> Result<(), ConnectorError> {
        match self {
            Self::Broker(inner) => inner.send(bytes).await,
            Self::File(inner) => inner.send(bytes).await,
        }
    }

    /// Block until all previously sent bytes are durable.
    pub async fn flush(&mut self) -> Result<(), ConnectorError> {
        match self {
            Self::Broker(inner) => inner.flush().await,
            Self::File(inner) => inner.flush().await,
        }
    }
}

/// Build an error for a token which does not belong to the connector's transport.
fn token_mismatch(token: &ResumptionToken, transport: &str) -> ConnectorError {
    ConnectorError::Permanent(format!("resumption token {:?} does not belong to a {} transport", token, transport))
}
