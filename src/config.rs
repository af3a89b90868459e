//! Runtime configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port which control-plane HTTP traffic is to use.
    #[serde(default = "Config::default_http_port")]
    pub http_port: u16,
    /// The port which the Prometheus metrics endpoint is to use.
    #[serde(default = "Config::default_metrics_port")]
    pub metrics_port: u16,
    /// The name of this instance, attached as a global label to all metrics.
    #[serde(default = "Config::default_instance")]
    pub instance: String,

    /// The path to the database on disk.
    #[serde(default = "crate::database::default_data_path")]
    pub storage_data_path: String,

    /// The maximum time a control-plane command waits to observe its state transition.
    #[serde(default = "Config::default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// The maximum time an input connector blocks within a single poll.
    #[serde(default = "Config::default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// The capacity of the queue between a pipeline controller and each of its output connectors.
    #[serde(default = "Config::default_output_queue_capacity")]
    pub output_queue_capacity: usize,
    /// The capacity of each pipeline controller's command queue.
    #[serde(default = "Config::default_command_queue_capacity")]
    pub command_queue_capacity: usize,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        Ok(config)
    }

    /// The command timeout as a duration.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// The poll timeout as a duration.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    fn default_http_port() -> u16 {
        7000
    }

    fn default_metrics_port() -> u16 {
        7002
    }

    fn default_instance() -> String {
        "hadron-connect-0".into()
    }

    fn default_command_timeout_ms() -> u64 {
        10_000
    }

    fn default_poll_timeout_ms() -> u64 {
        100
    }

    fn default_output_queue_capacity() -> usize {
        64
    }

    fn default_command_queue_capacity() -> usize {
        8
    }
}

#[cfg(test)]
impl Config {
    /// Create a config for testing, rooted in a fresh temporary directory.
    pub fn new_test() -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")?;
        let config = Self {
            rust_log: "".into(),
            http_port: 7000,
            metrics_port: 7002,
            instance: "hadron-connect-test".into(),
            storage_data_path: tmpdir.path().to_string_lossy().to_string(),
            command_timeout_ms: 5_000,
            poll_timeout_ms: 20,
            output_queue_capacity: 16,
            command_queue_capacity: 8,
        };
        Ok((std::sync::Arc::new(config), tmpdir))
    }
}
