use std::time::Duration;

use anyhow::Result;

use crate::config::Config;

#[test]
fn config_deserializes_from_full_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("HTTP_PORT".into(), "8000".into()),
        ("METRICS_PORT".into(), "8002".into()),
        ("INSTANCE".into(), "connect-3".into()),
        ("STORAGE_DATA_PATH".into(), "/var/lib/hadron-connect".into()),
        ("COMMAND_TIMEOUT_MS".into(), "2500".into()),
        ("POLL_TIMEOUT_MS".into(), "50".into()),
        ("OUTPUT_QUEUE_CAPACITY".into(), "32".into()),
        ("COMMAND_QUEUE_CAPACITY".into(), "4".into()),
    ])?;

    assert!(config.rust_log == "error", "unexpected value parsed for RUST_LOG, got {}, expected {}", config.rust_log, "error");
    assert!(config.http_port == 8000, "unexpected value parsed for HTTP_PORT, got {}, expected {}", config.http_port, 8000);
    assert!(config.metrics_port == 8002, "unexpected value parsed for METRICS_PORT, got {}, expected {}", config.metrics_port, 8002);
    assert!(config.instance == "connect-3", "unexpected value parsed for INSTANCE, got {}, expected {}", config.instance, "connect-3");
    assert!(
        config.storage_data_path == "/var/lib/hadron-connect",
        "unexpected value parsed for STORAGE_DATA_PATH, got {}, expected {}",
        config.storage_data_path,
        "/var/lib/hadron-connect"
    );
    assert!(
        config.command_timeout() == Duration::from_millis(2500),
        "unexpected value parsed for COMMAND_TIMEOUT_MS, got {:?}, expected {:?}",
        config.command_timeout(),
        Duration::from_millis(2500)
    );
    assert!(
        config.poll_timeout() == Duration::from_millis(50),
        "unexpected value parsed for POLL_TIMEOUT_MS, got {:?}, expected {:?}",
        config.poll_timeout(),
        Duration::from_millis(50)
    );
    assert!(
        config.output_queue_capacity == 32,
        "unexpected value parsed for OUTPUT_QUEUE_CAPACITY, got {}, expected {}",
        config.output_queue_capacity,
        32
    );
    assert!(
        config.command_queue_capacity == 4,
        "unexpected value parsed for COMMAND_QUEUE_CAPACITY, got {}, expected {}",
        config.command_queue_capacity,
        4
    );

    Ok(())
}

#[test]
fn config_deserializes_from_sparse_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![("RUST_LOG".into(), "info".into())])?;

    assert!(config.rust_log == "info", "unexpected value parsed for RUST_LOG, got {}, expected {}", config.rust_log, "info");
    assert!(config.http_port == 7000, "unexpected default for HTTP_PORT, got {}, expected {}", config.http_port, 7000);
    assert!(config.metrics_port == 7002, "unexpected default for METRICS_PORT, got {}, expected {}", config.metrics_port, 7002);
    assert!(
        config.storage_data_path == crate::database::DEFAULT_DATA_PATH,
        "unexpected default for STORAGE_DATA_PATH, got {}, expected {}",
        config.storage_data_path,
        crate::database::DEFAULT_DATA_PATH
    );
    assert!(
        config.command_timeout_ms == 10_000,
        "unexpected default for COMMAND_TIMEOUT_MS, got {}, expected {}",
        config.command_timeout_ms,
        10_000
    );
    assert!(config.poll_timeout_ms == 100, "unexpected default for POLL_TIMEOUT_MS, got {}, expected {}", config.poll_timeout_ms, 100);

    Ok(())
}

#[test]
fn config_requires_rust_log() {
    let res: std::result::Result<Config, _> = envy::from_iter(vec![("HTTP_PORT".into(), "8000".into())]);
    assert!(res.is_err(), "expected config without RUST_LOG to be rejected");
}
