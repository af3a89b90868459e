//! The Hadron Connect pipeline controller.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::prelude::*;

use hadron_connect::app::App;
use hadron_connect::config::Config;
use hadron_connect::{connector, pipeline};

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true).with_ansi(true))
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let cfg = Arc::new(Config::new()?);
    tracing::info!(
        http_port = %cfg.http_port,
        metrics_port = %cfg.metrics_port,
        instance = %cfg.instance,
        storage_data_path = %cfg.storage_data_path,
        "starting Hadron Connect",
    );

    let prom = PrometheusBuilder::new()
        .add_global_label("instance", cfg.instance.clone())
        .install_recorder()
        .context("error installing prometheus recorder")?;
    connector::describe_metrics();
    pipeline::describe_metrics();

    if let Err(err) = App::new(cfg, prom).await?.spawn().await {
        tracing::error!(error = ?err);
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}
