use std::time::Duration;

use anyhow::{bail, Result};
use rand::prelude::*;
use tokio::sync::watch;

use crate::models::{
    BrokerTransport, ConnectorConfig, CsvOptions, DataType, EngineKind, ErrorPolicy, Field, FileTransport, FormatConfig, PipelineConfig, RetryConfig, RowBatch, Schema,
    TransportConfig, Value,
};
use crate::pipeline::{PipelineState, PipelineStatus};

/// The schema used throughout the test suite.
pub fn schema() -> Schema {
    Schema::new(vec![
        Field {
            name: "id".into(),
            data_type: DataType::Int,
            nullable: false,
        },
        Field {
            name: "name".into(),
            data_type: DataType::String,
            nullable: true,
        },
        Field {
            name: "score".into(),
            data_type: DataType::Float,
            nullable: false,
        },
        Field {
            name: "active".into(),
            data_type: DataType::Bool,
            nullable: false,
        },
    ])
}

pub fn csv() -> FormatConfig {
    FormatConfig::Csv(CsvOptions::default())
}

/// A retry policy which gives up fast.
pub fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
    }
}

pub fn broker_connector(name: &str, address: &str, topic: &str, partitions: Vec<u32>, format: FormatConfig) -> ConnectorConfig {
    ConnectorConfig {
        name: name.into(),
        transport: TransportConfig::Broker(BrokerTransport {
            address: address.into(),
            topic: topic.into(),
            partitions,
            group: None,
        }),
        format,
        on_error: ErrorPolicy::SkipAndCount,
        max_buffered_batches: 4,
        retry: fast_retry(3),
    }
}

pub fn file_connector(name: &str, path: &str, format: FormatConfig) -> ConnectorConfig {
    ConnectorConfig {
        name: name.into(),
        transport: TransportConfig::File(FileTransport {
            path: path.into(),
            follow: false,
            max_batch_records: 2,
        }),
        format,
        on_error: ErrorPolicy::SkipAndCount,
        max_buffered_batches: 4,
        retry: fast_retry(3),
    }
}

pub fn pipeline(name: &str, inputs: Vec<ConnectorConfig>, outputs: Vec<ConnectorConfig>) -> PipelineConfig {
    PipelineConfig {
        name: name.into(),
        engine: EngineKind::Identity,
        schema: schema(),
        inputs,
        outputs,
    }
}

/// A pipeline reading `{name}-in` and writing `{name}-out` on the given in-memory broker.
pub fn broker_pipeline(name: &str, address: &str) -> PipelineConfig {
    pipeline(
        name,
        vec![broker_connector("source", address, &format!("{}-in", name), vec![0], csv())],
        vec![broker_connector("sink", address, &format!("{}-out", name), vec![0], FormatConfig::Json)],
    )
}

/// Generate a random batch of schema-conformant rows.
pub fn random_batch(len: usize) -> RowBatch {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|idx| {
            let name = match rng.gen_range(0..4) {
                0 => Value::Null,
                1 => Value::String(String::new()),
                2 => Value::String("quoted, \"text\"\nwith newline".into()),
                _ => Value::String(format!("name-{}", rng.gen::<u32>())),
            };
            let row = vec![Value::Int(idx as i64 - rng.gen_range(0..1000)), name, Value::Float(rng.gen_range(-1e6..1e6)), Value::Bool(rng.gen())];
            let weight: i64 = match rng.gen_range(0..3) {
                0 => -rng.gen_range(1..10),
                1 => 1,
                _ => rng.gen_range(2..100),
            };
            (row, weight)
        })
        .collect()
}

pub fn row(id: i64, name: &str) -> Vec<Value> {
    vec![Value::Int(id), Value::String(name.into()), Value::Float(id as f64 / 2.0), Value::Bool(id % 2 == 0)]
}

/// Wait for the given status channel to satisfy the predicate.
pub async fn wait_for_state<F>(rx: &mut watch::Receiver<PipelineStatus>, timeout: Duration, pred: F) -> Result<PipelineState>
where
    F: Fn(&PipelineState) -> bool,
{
    match tokio::time::timeout(timeout, rx.wait_for(|status| pred(&status.state))).await {
        Ok(Ok(status)) => return Ok(status.state.clone()),
        Ok(Err(_)) => bail!("status channel closed"),
        Err(_) => (),
    }
    let last = rx.borrow().state.clone();
    bail!("timeout waiting for pipeline state, last state {:?}", last)
}
