use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::connector::BrokerClients;
use crate::database::Database;
use crate::registry::Registry;
use crate::server::{spawn_prom_server, AppServer};

/// The application object for when Hadron Connect is running as a server.
pub struct App {
    /// Runtime config, kept alive for the process lifetime.
    _config: Arc<Config>,
    /// The sled database backing the registry.
    _db: Database,
    /// The registry of all pipelines.
    registry: Registry,

    /// Broadcasts the process-wide shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
    /// Observes shutdowns triggered by the servers.
    shutdown_rx: BroadcastStream<()>,

    /// The control-plane HTTP server.
    client_server: JoinHandle<Result<()>>,
    /// The Prometheus scrape server.
    metrics_server: JoinHandle<Result<()>>,
}

impl App {
    /// Open storage, recover the registry and spawn both servers.
    pub async fn new(config: Arc<Config>, prom: PrometheusHandle) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(10);

        // Initialize this node's storage & recover all persisted pipelines.
        let db = Database::new(config.clone()).await.context("error opening database")?;
        let registry = Registry::new(config.clone(), &db, BrokerClients::default())
            .await
            .context("error recovering pipeline registry")?;

        let client_server = AppServer::new(config.clone(), registry.clone(), shutdown_tx.clone()).spawn();
        let metrics_server = spawn_prom_server(&config, prom, registry.clone(), shutdown_tx.subscribe());

        Ok(Self {
            _config: config,
            _db: db,
            registry,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            client_server,
            metrics_server,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        for (name, kind) in [("sigterm", SignalKind::terminate()), ("sigint", SignalKind::interrupt())] {
            let stream = signal(kind).with_context(|| format!("error registering {} handler", name))?;
            signals.insert(name, SignalStream::new(stream));
        }

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::info!(signal = ?sig, "signal received, draining pipelines");
                    let _res = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Drain all pipelines, then join the servers.
        tracing::debug!("Hadron Connect is shutting down");
        self.registry.shutdown_all().await;
        for (name, handle) in [("control-plane", self.client_server), ("metrics", self.metrics_server)] {
            if let Err(err) = handle.await.context("error joining server task").and_then(|res| res) {
                tracing::error!(error = ?err, server = name, "error shutting down server");
            }
        }

        tracing::debug!("Hadron Connect shutdown complete");
        Ok(())
    }
}
