use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::connector::{ConnectorStats, OutputConnector};
use crate::error::ConnectorError;
use crate::format::Codec;

/// A message sent to an output worker.
pub enum OutputMsg {
    /// Send the given encoded batch.
    Send(Vec<u8>),
    /// Flush all batches sent so far, responding with the outcome.
    Flush(oneshot::Sender<Result<(), ConnectorError>>),
}

/// A task driving a single output connector.
///
/// Messages are processed strictly in order, so batches reach the transport in submission order.
/// After the first failed send all further sends are dropped, and every flush reports the failure.
pub struct OutputWorker {
    name: Arc<String>,
    connector: OutputConnector,
    rx: mpsc::Receiver<OutputMsg>,
    error: Option<ConnectorError>,
}

/// The controller's handle to a running output worker.
pub struct OutputHandle {
    pub name: Arc<String>,
    pub codec: Codec,
    pub stats: Arc<ConnectorStats>,
    tx: mpsc::Sender<OutputMsg>,
    handle: JoinHandle<()>,
}

impl OutputWorker {
    /// Spawn a worker for the given connector, returning the controller's handle to it.
    pub fn spawn(name: Arc<String>, connector: OutputConnector, codec: Codec, stats: Arc<ConnectorStats>, capacity: usize) -> OutputHandle {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = Self {
            name: name.clone(),
            connector,
            rx,
            error: None,
        };
        let handle = tokio::spawn(worker.run());
        OutputHandle { name, codec, stats, tx, handle }
    }

    async fn run(mut self) {
        tracing::debug!(connector = %self.name, "output worker started");
        while let Some(msg) = self.rx.recv().await {
            match msg {
                OutputMsg::Send(bytes) => self.handle_send(bytes).await,
                OutputMsg::Flush(tx) => {
                    let res = self.handle_flush().await;
                    let _res = tx.send(res);
                }
            }
        }
        if self.error.is_none() {
            if let Err(err) = self.connector.flush().await {
                tracing::error!(error = %err, connector = %self.name, "error flushing output connector on stop");
            }
        }
        tracing::debug!(connector = %self.name, "output worker stopped");
    }

    #[tracing::instrument(level = "trace", skip(self, bytes), fields(connector = %self.name, len = bytes.len()))]
    async fn handle_send(&mut self, bytes: Vec<u8>) {
        if self.error.is_some() {
            return;
        }
        if let Err(err) = self.connector.send(bytes).await {
            tracing::error!(error = %err, connector = %self.name, "output connector failed");
            self.error = Some(err);
        }
    }

    async fn handle_flush(&mut self) -> Result<(), ConnectorError> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if let Err(err) = self.connector.flush().await {
            self.error = Some(err.clone());
            return Err(err);
        }
        Ok(())
    }
}

impl OutputHandle {
    /// Submit the given encoded batch for sending.
    pub async fn send(&self, bytes: Vec<u8>) -> Result<(), ConnectorError> {
        self.tx.send(OutputMsg::Send(bytes)).await.map_err(|_| stopped())
    }

    /// Wait until all batches submitted so far are acknowledged by the transport.
    pub async fn flush(&self) -> Result<(), ConnectorError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(OutputMsg::Flush(tx)).await.map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }

    /// Stop this worker once all submitted batches have been processed.
    pub async fn stop(self) {
        let Self { name, tx, handle, .. } = self;
        drop(tx);
        if let Err(err) = handle.await {
            tracing::error!(error = ?err, connector = %name, "error joining output worker");
        }
    }
}

fn stopped() -> ConnectorError {
    ConnectorError::Permanent("output worker stopped unexpectedly".into())
}
