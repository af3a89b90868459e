use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::connector::{ConnectorStats, InputConnector, ResumptionToken};
use crate::error::ConnectorError;
use crate::format::Codec;
use crate::pipeline::checkpoint::CheckpointStore;

/// An event emitted by an input worker.
#[derive(Debug)]
pub enum InputEvent {
    /// A polled batch of raw bytes along with the token which acks it.
    Batch(Vec<u8>, ResumptionToken),
    /// The connector has hit a permanent fault and will emit nothing more.
    Failed(ConnectorError),
}

/// A message sent to an input worker.
#[derive(Debug)]
pub enum InputCmd {
    /// Ack the batch of the given token and checkpoint the connector's progress.
    Ack(ResumptionToken),
}

/// A task driving a single input connector.
///
/// Polled batches are buffered in a channel bounded by the connector's capacity. The worker
/// stops polling while the connector is saturated with unacked batches.
pub struct InputWorker {
    name: Arc<String>,
    connector: InputConnector,
    checkpoints: CheckpointStore,
    stats: Arc<ConnectorStats>,
    poll_timeout: Duration,

    events_tx: mpsc::Sender<InputEvent>,
    cmd_rx: mpsc::Receiver<InputCmd>,
    /// A signal shared by all input workers of a pipeline, notified on each emitted event.
    data_ready: Arc<Notify>,
    /// Set once the connector has failed, after which the worker only waits to be stopped.
    failed: bool,
}

/// The controller's handle to a running input worker.
pub struct InputHandle {
    pub name: Arc<String>,
    pub codec: Codec,
    pub stats: Arc<ConnectorStats>,
    events_rx: mpsc::Receiver<InputEvent>,
    cmd_tx: mpsc::Sender<InputCmd>,
    handle: JoinHandle<()>,
}

impl InputWorker {
    /// Spawn a worker for the given connector, returning the controller's handle to it.
    pub fn spawn(
        name: Arc<String>, connector: InputConnector, codec: Codec, checkpoints: CheckpointStore, stats: Arc<ConnectorStats>, poll_timeout: Duration, data_ready: Arc<Notify>,
    ) -> InputHandle {
        let capacity = connector.capacity().max(1);
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let (cmd_tx, cmd_rx) = mpsc::channel(capacity);
        let worker = Self {
            name: name.clone(),
            connector,
            checkpoints,
            stats: stats.clone(),
            poll_timeout,
            events_tx,
            cmd_rx,
            data_ready,
            failed: false,
        };
        let handle = tokio::spawn(worker.run());
        InputHandle {
            name,
            codec,
            stats,
            events_rx,
            cmd_tx,
            handle,
        }
    }

    async fn run(mut self) {
        tracing::debug!(connector = %self.name, "input worker started");
        'outer: loop {
            // Apply all pending acks before sourcing more data.
            loop {
                match self.cmd_rx.try_recv() {
                    Ok(cmd) => self.handle_cmd(cmd).await,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => break 'outer,
                }
            }

            self.stats.set_backlog(self.connector.unacked());
            if self.failed || self.connector.saturated() {
                match self.cmd_rx.recv().await {
                    Some(cmd) => self.handle_cmd(cmd).await,
                    None => break,
                }
                continue;
            }

            match self.connector.poll(self.poll_timeout).await {
                Ok(Some((bytes, token))) => {
                    self.stats.set_backlog(self.connector.unacked());
                    if self.events_tx.send(InputEvent::Batch(bytes, token)).await.is_err() {
                        break;
                    }
                    self.data_ready.notify_one();
                }
                Ok(None) => (),
                Err(err) => self.fail(err).await,
            }
        }
        tracing::debug!(connector = %self.name, "input worker stopped");
    }

    #[tracing::instrument(level = "trace", skip(self, cmd), fields(connector = %self.name))]
    async fn handle_cmd(&mut self, cmd: InputCmd) {
        let InputCmd::Ack(token) = cmd;
        if self.failed {
            return;
        }
        if let Err(err) = self.connector.ack(&token).await {
            self.fail(err).await;
            return;
        }
        let checkpoint = self.connector.checkpoint();
        if let Err(err) = self.checkpoints.save(&self.name, &checkpoint).await {
            tracing::error!(error = ?err, connector = %self.name, "error persisting connector checkpoint");
            self.fail(ConnectorError::Permanent(format!("error persisting checkpoint: {:#}", err))).await;
        }
    }

    async fn fail(&mut self, err: ConnectorError) {
        tracing::error!(error = %err, connector = %self.name, "input connector failed");
        self.failed = true;
        let _res = self.events_tx.send(InputEvent::Failed(err)).await;
        self.data_ready.notify_one();
    }
}

impl InputHandle {
    /// Take the next event of this worker without waiting.
    ///
    /// A worker which has stopped unexpectedly is reported as a failure.
    pub fn try_next(&mut self) -> Option<InputEvent> {
        match self.events_rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(InputEvent::Failed(ConnectorError::Permanent("input worker stopped unexpectedly".into()))),
        }
    }

    /// Ack the batch of the given token.
    pub async fn ack(&self, token: ResumptionToken) -> Result<(), ConnectorError> {
        self.cmd_tx
            .send(InputCmd::Ack(token))
            .await
            .map_err(|_| ConnectorError::Permanent("input worker stopped unexpectedly".into()))
    }

    /// Stop this worker once it has applied all acks sent so far.
    ///
    /// Batches still buffered are dropped unacked, and are redelivered from the checkpoint.
    pub async fn stop(self) {
        let Self { name, events_rx, cmd_tx, handle, .. } = self;
        drop(cmd_tx);
        drop(events_rx);
        if let Err(err) = handle.await {
            tracing::error!(error = ?err, connector = %name, "error joining input worker");
        }
    }
}
