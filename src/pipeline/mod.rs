//! Pipeline controller.
//!
//! Each pipeline is driven by one controller task, which owns the pipeline's engine instance and
//! one worker task per connector. Input workers poll their transports ahead of the controller, up
//! to their watermark. The controller schedules the inputs round-robin, one batch at a time:
//!
//! decode -> engine push & step -> encode -> send -> flush -> engine commit -> ack
//!
//! An input batch is only acked after every output touched by its step has confirmed the flush.
//! Commands are only observed between batches.

mod checkpoint;
mod input;
mod output;
mod state;

use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Config;
use crate::connector::{BrokerClients, ConnectorContext, ConnectorSnapshot, ConnectorStats, InputConnector, OutputConnector, ResumptionToken};
use crate::engine::{self, Engine};
use crate::error::{EngineError, PipelineError};
use crate::format::Codec;
use crate::models::{Direction, PipelineConfig};

pub use self::checkpoint::CheckpointStore;
use self::input::{InputEvent, InputHandle, InputWorker};
use self::output::{OutputHandle, OutputWorker};
pub use self::state::{PipelineState, PipelineStatus, StatusTx};

pub const METRIC_PIPELINE_STATE: &str = "hadron_connect_pipeline_state";
pub const METRIC_PIPELINE_UPTIME: &str = "hadron_connect_pipeline_uptime_seconds";
pub const METRIC_PIPELINE_LAST_ERROR: &str = "hadron_connect_pipeline_last_error";

/// Register the descriptions of all pipeline metrics.
pub fn describe_metrics() {
    metrics::describe_gauge!(
        METRIC_PIPELINE_STATE,
        metrics::Unit::Count,
        "pipeline state: 0 provisioning, 1 running, 2 paused, 3 failed, 4 shutting down, 5 terminated"
    );
    metrics::describe_gauge!(METRIC_PIPELINE_UPTIME, metrics::Unit::Seconds, "seconds since the pipeline's current controller started running");
    metrics::describe_gauge!(METRIC_PIPELINE_LAST_ERROR, metrics::Unit::Count, "set to 1 for the reason of a pipeline's most recent failure");
}

/// A command sent to a pipeline controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineCmd {
    Pause,
    Resume,
    Shutdown,
}

/// The stats of all connectors of a pipeline, kept across controller instances.
#[derive(Clone)]
pub struct PipelineStats {
    connectors: Arc<Vec<Arc<ConnectorStats>>>,
}

impl PipelineStats {
    pub fn new(config: &PipelineConfig) -> Self {
        let connectors = config
            .connectors()
            .map(|(direction, connector)| Arc::new(ConnectorStats::new(&config.name, &connector.name, direction)))
            .collect();
        Self { connectors: Arc::new(connectors) }
    }

    /// Get the stats of the named connector, creating detached stats for unknown names.
    pub fn get(&self, name: &str, direction: Direction, pipeline: &str) -> Arc<ConnectorStats> {
        self.connectors
            .iter()
            .find(|stats| stats.name() == name)
            .cloned()
            .unwrap_or_else(|| Arc::new(ConnectorStats::new(pipeline, name, direction)))
    }

    pub fn snapshot(&self) -> Vec<ConnectorSnapshot> {
        self.connectors.iter().map(|stats| stats.snapshot()).collect()
    }
}

/// The resources a pipeline controller is spawned with.
#[derive(Clone)]
pub struct PipelineResources {
    pub brokers: BrokerClients,
    pub checkpoints: CheckpointStore,
    pub stats: PipelineStats,
    pub status: StatusTx,
}

/// A pipeline controller for managing a pipeline.
pub struct PipelineCtl {
    /// The application's runtime config.
    config: Arc<Config>,
    id: Uuid,
    /// The config of the pipeline with which this controller is associated.
    pipeline: Arc<PipelineConfig>,
    resources: PipelineResources,

    /// A channel of inbound commands.
    cmd_rx: mpsc::Receiver<PipelineCmd>,
    /// A signal notified whenever an input worker has emitted an event.
    data_ready: Arc<Notify>,

    engine: Option<Box<dyn Engine>>,
    inputs: Vec<InputHandle>,
    outputs: Vec<OutputHandle>,
    /// The index of the input to be serviced first in the next scheduling round.
    next_input: usize,

    /// A bool indicating that this controller is paused.
    paused: bool,
    /// A bool indicating that this controller has been descheduled and needs to shutdown.
    descheduled: bool,
}

impl PipelineCtl {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, id: Uuid, pipeline: Arc<PipelineConfig>, resources: PipelineResources, cmd_rx: mpsc::Receiver<PipelineCmd>) -> Self {
        Self {
            config,
            id,
            pipeline,
            resources,
            cmd_rx,
            data_ready: Arc::new(Notify::new()),
            engine: None,
            inputs: vec![],
            outputs: vec![],
            next_input: 0,
            paused: false,
            descheduled: false,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        tracing::debug!(id = %self.id, "pipeline controller {} has started", self.pipeline.name);
        if let Err(err) = self.provision().await {
            self.fail(err).await;
            return;
        }
        self.resources.status.transition(PipelineState::Running);

        loop {
            // Commands are observed at every batch boundary.
            self.drain_commands();
            if self.descheduled {
                break;
            }
            if self.paused {
                let cmd = self.cmd_rx.recv().await;
                self.handle_cmd(cmd);
                continue;
            }

            match self.next_event() {
                Some((idx, InputEvent::Batch(bytes, token))) => {
                    if let Err(err) = self.process_batch(idx, bytes, token).await {
                        self.fail(err).await;
                        return;
                    }
                }
                Some((idx, InputEvent::Failed(err))) => {
                    let err = PipelineError::connector(&self.inputs[idx].name, err);
                    self.fail(err).await;
                    return;
                }
                None => {
                    tokio::select! {
                        cmd = self.cmd_rx.recv() => self.handle_cmd(cmd),
                        _ = self.data_ready.notified() => (),
                    }
                }
            }
        }

        self.shutdown().await;
        tracing::debug!(id = %self.id, "pipeline controller {} has shutdown", self.pipeline.name);
    }

    /// Validate the pipeline's config, then open its connectors & spawn their workers.
    #[tracing::instrument(level = "trace", skip(self), fields(pipeline = %self.pipeline.name))]
    async fn provision(&mut self) -> Result<(), PipelineError> {
        let pipeline = self.pipeline.clone();
        pipeline.validate()?;
        let schema = Arc::new(pipeline.schema.clone());
        let name = Arc::new(pipeline.name.clone());

        for cfg in pipeline.inputs.iter() {
            let stats = self.resources.stats.get(&cfg.name, Direction::Input, &name);
            let ctx = ConnectorContext {
                pipeline: name.clone(),
                brokers: self.resources.brokers.clone(),
                stats: stats.clone(),
            };
            let mut connector = InputConnector::open(cfg, &ctx)?;
            let checkpoint = self
                .resources
                .checkpoints
                .load(&cfg.name)
                .await
                .map_err(|err| PipelineError::Storage(format!("{:#}", err)))?;
            if let Some(token) = checkpoint {
                tracing::debug!(connector = %cfg.name, ?token, "resuming input connector from checkpoint");
                connector.seek(&token).await.map_err(|err| PipelineError::connector(&cfg.name, err))?;
            }
            let codec = Codec::new(&cfg.format, schema.clone(), cfg.on_error);
            self.inputs.push(InputWorker::spawn(
                Arc::new(cfg.name.clone()),
                connector,
                codec,
                self.resources.checkpoints.clone(),
                stats,
                self.config.poll_timeout(),
                self.data_ready.clone(),
            ));
        }

        for cfg in pipeline.outputs.iter() {
            let stats = self.resources.stats.get(&cfg.name, Direction::Output, &name);
            let ctx = ConnectorContext {
                pipeline: name.clone(),
                brokers: self.resources.brokers.clone(),
                stats: stats.clone(),
            };
            let connector = OutputConnector::open(cfg, &ctx)?;
            let codec = Codec::new(&cfg.format, schema.clone(), cfg.on_error);
            self.outputs.push(OutputWorker::spawn(
                Arc::new(cfg.name.clone()),
                connector,
                codec,
                stats,
                self.config.output_queue_capacity,
            ));
        }

        self.engine = Some(engine::build(&pipeline));
        Ok(())
    }

    /// Handle all commands which are already queued.
    fn drain_commands(&mut self) {
        while !self.descheduled {
            match self.cmd_rx.try_recv() {
                Ok(cmd) => self.handle_cmd(Some(cmd)),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => self.handle_cmd(None),
            }
        }
    }

    #[tracing::instrument(level = "trace", skip(self), fields(pipeline = %self.pipeline.name))]
    fn handle_cmd(&mut self, cmd: Option<PipelineCmd>) {
        match cmd {
            Some(PipelineCmd::Pause) if !self.paused => {
                self.paused = true;
                self.resources.status.transition(PipelineState::Paused);
            }
            Some(PipelineCmd::Resume) if self.paused => {
                self.paused = false;
                self.resources.status.transition(PipelineState::Running);
            }
            Some(PipelineCmd::Pause) | Some(PipelineCmd::Resume) => (),
            // A closed command channel means the registry has dropped this pipeline.
            Some(PipelineCmd::Shutdown) | None => self.descheduled = true,
        }
    }

    /// Take the next available input event, servicing inputs round-robin.
    fn next_event(&mut self) -> Option<(usize, InputEvent)> {
        let count = self.inputs.len();
        for step in 0..count {
            let idx = (self.next_input + step) % count;
            if let Some(event) = self.inputs[idx].try_next() {
                self.next_input = (idx + 1) % count;
                return Some((idx, event));
            }
        }
        None
    }

    /// Drive one input batch through the engine & out to the outputs, acking it once durable.
    #[tracing::instrument(level = "trace", skip(self, bytes, token), fields(pipeline = %self.pipeline.name))]
    async fn process_batch(&mut self, idx: usize, bytes: Vec<u8>, token: ResumptionToken) -> Result<(), PipelineError> {
        let engine = match self.engine.as_mut() {
            Some(engine) => engine,
            None => return Err(EngineError("engine not provisioned".into()).into()),
        };

        let input = &self.inputs[idx];
        let decoded = input.codec.decode(&bytes).map_err(|err| PipelineError::format(&input.name, err))?;
        if decoded.rejected > 0 {
            tracing::debug!(connector = %input.name, rejected = decoded.rejected, "malformed records skipped");
        }
        input.stats.add_rejected(decoded.rejected);
        input.stats.record_batch(decoded.batch.len());
        engine.push(&input.name, decoded.batch)?;
        let produced = engine.step()?;

        let mut touched = vec![None; self.outputs.len()];
        for (name, batch) in produced {
            if batch.is_empty() {
                continue;
            }
            let out_idx = self
                .outputs
                .iter()
                .position(|output| output.name == name)
                .ok_or_else(|| EngineError(format!("engine produced a batch for unknown output {}", name)))?;
            let output = &self.outputs[out_idx];
            let encoded = output.codec.encode(&batch).map_err(|err| PipelineError::format(&output.name, err))?;
            output.send(encoded).await.map_err(|err| PipelineError::connector(&output.name, err))?;
            *touched[out_idx].get_or_insert(0) += batch.len();
        }
        for (output, rows) in self.outputs.iter().zip(touched) {
            if let Some(rows) = rows {
                output.flush().await.map_err(|err| PipelineError::connector(&output.name, err))?;
                output.stats.record_batch(rows);
            }
        }
        engine.commit()?;

        let input = &self.inputs[idx];
        input.ack(token).await.map_err(|err| PipelineError::connector(&input.name, err))
    }

    /// Transition to `Failed` after releasing all connector resources.
    async fn fail(&mut self, err: PipelineError) {
        self.release().await;
        self.resources.status.transition(PipelineState::Failed { reason: err.to_string() });
    }

    /// Drain & release all resources, then transition to `Terminated`.
    async fn shutdown(&mut self) {
        self.resources.status.transition(PipelineState::ShuttingDown);
        let mut res: Result<(), PipelineError> = Ok(());
        for output in self.outputs.iter() {
            if let Err(err) = output.flush().await {
                res = Err(PipelineError::connector(&output.name, err));
                break;
            }
        }
        if res.is_ok() {
            if let Some(engine) = self.engine.as_mut() {
                res = engine.commit().map_err(PipelineError::from);
            }
        }
        match res {
            Ok(()) => {
                self.release().await;
                self.resources.status.transition(PipelineState::Terminated);
            }
            Err(err) => self.fail(err).await,
        }
    }

    /// Stop all workers & drop the engine.
    async fn release(&mut self) {
        for input in self.inputs.drain(..) {
            input.stop().await;
        }
        for output in self.outputs.drain(..) {
            output.stop().await;
        }
        self.engine = None;
    }
}
