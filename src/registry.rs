//! Pipeline registry.
//!
//! The registry owns the table of all pipelines, their configs and their status. State-changing
//! commands for a pipeline are serialized by the pipeline's controller slot: a command which finds
//! the slot locked fails with `AppError::Busy` instead of queueing behind the in-flight command.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Config;
use crate::connector::{BrokerClients, ConnectorSnapshot};
use crate::database::{Database, Tree};
use crate::error::{AppError, ERR_DB_FLUSH, ERR_ITER_FAILURE};
use crate::models::PipelineConfig;
use crate::pipeline::{
    CheckpointStore, PipelineCmd, PipelineCtl, PipelineResources, PipelineState, PipelineStats, PipelineStatus, StatusTx, METRIC_PIPELINE_UPTIME,
};
use crate::utils;

/// All known pipelines mapped from their ID.
pub type PipelinesMap = Arc<ArcSwap<HashMap<Uuid, Arc<PipelineEntry>>>>;

/// The persisted record of a pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineRecord {
    pub id: Uuid,
    pub config: PipelineConfig,
}

/// The externally visible view of a pipeline.
#[derive(Clone, Debug, Serialize)]
pub struct PipelineView {
    pub id: Uuid,
    pub name: String,
    #[serde(flatten)]
    pub state: PipelineState,
    /// Unix timestamp of the last state transition.
    pub since: i64,
    pub uptime_seconds: f64,
    pub last_error: Option<String>,
    pub connectors: Vec<ConnectorSnapshot>,
    pub config: PipelineConfig,
}

/// A registered pipeline.
pub struct PipelineEntry {
    pub id: Uuid,
    config: ArcSwap<PipelineConfig>,
    stats: ArcSwap<PipelineStats>,
    status: StatusTx,
    checkpoints: CheckpointStore,
    /// The currently spawned controller, if any; locked for the duration of each command.
    slot: Mutex<Option<Controller>>,
}

pub(crate) struct Controller {
    tx: mpsc::Sender<PipelineCmd>,
    handle: JoinHandle<()>,
}

impl PipelineEntry {
    fn new(id: Uuid, config: PipelineConfig, checkpoints: CheckpointStore) -> Self {
        let stats = PipelineStats::new(&config);
        let status = StatusTx::new(Arc::new(config.name.clone()));
        Self {
            id,
            config: ArcSwap::from_pointee(config),
            stats: ArcSwap::from_pointee(stats),
            status,
            checkpoints,
            slot: Mutex::new(None),
        }
    }

    pub fn name(&self) -> String {
        self.config.load().name.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineStatus> {
        self.status.subscribe()
    }

    pub fn view(&self) -> PipelineView {
        let (status, config) = (self.status.current(), self.config.load_full());
        PipelineView {
            id: self.id,
            name: config.name.clone(),
            since: status.since.unix_timestamp(),
            uptime_seconds: status.uptime_seconds(),
            last_error: status.last_error.clone(),
            state: status.state,
            connectors: self.stats.load().snapshot(),
            config: config.as_ref().clone(),
        }
    }
}

/// The registry of all pipelines.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The database tree of pipeline records.
    tree: Tree,
    /// The database tree of connector checkpoints.
    checkpoints: Tree,
    brokers: BrokerClients,
    pipelines: PipelinesMap,
    /// Serializes changes to the set of pipelines.
    table: Mutex<()>,
}

impl Registry {
    /// Create a new instance, recovering all persisted pipelines.
    ///
    /// Recovered pipelines are idle in `Provisioning` until started.
    pub async fn new(config: Arc<Config>, db: &Database, brokers: BrokerClients) -> Result<Self> {
        let tree = db.get_pipelines_tree().await?;
        let checkpoints = db.get_checkpoints_tree().await?;
        let records = recover_pipelines(tree.clone()).await?;
        let pipelines: HashMap<_, _> = records
            .into_iter()
            .map(|record| {
                let store = CheckpointStore::new(checkpoints.clone(), record.id);
                (record.id, Arc::new(PipelineEntry::new(record.id, record.config, store)))
            })
            .collect();
        tracing::info!(count = pipelines.len(), "pipeline registry recovered");
        Ok(Self {
            inner: Arc::new(RegistryInner {
                config,
                tree,
                checkpoints,
                brokers,
                pipelines: Arc::new(ArcSwap::from_pointee(pipelines)),
                table: Mutex::new(()),
            }),
        })
    }

    pub fn brokers(&self) -> &BrokerClients {
        &self.inner.brokers
    }

    /// Look up a pipeline by ID.
    pub fn entry(&self, id: &Uuid) -> Result<Arc<PipelineEntry>> {
        self.inner.pipelines.load().get(id).cloned().ok_or_else(|| AppError::ResourceNotFound.into())
    }

    /// Lock the controller slot of the given entry for a command.
    ///
    /// Fails with `Busy` if another command holds the slot, and with `ResourceNotFound` if the
    /// entry has been deleted since it was looked up.
    pub(crate) fn lock_slot<'a>(&self, entry: &'a PipelineEntry) -> Result<MutexGuard<'a, Option<Controller>>> {
        let slot = entry.slot.try_lock().map_err(|_| AppError::Busy)?;
        match self.inner.pipelines.load().get(&entry.id) {
            Some(current) if std::ptr::eq(current.as_ref(), entry) => Ok(slot),
            _ => Err(AppError::ResourceNotFound.into()),
        }
    }

    pub fn get(&self, id: &Uuid) -> Result<PipelineView> {
        Ok(self.entry(id)?.view())
    }

    /// All pipelines, ordered by name.
    pub fn list(&self) -> Vec<PipelineView> {
        let mut views: Vec<_> = self.inner.pipelines.load().values().map(|entry| entry.view()).collect();
        views.sort_by(|a, b| a.name.cmp(&b.name));
        views
    }

    /// Create a new pipeline, idle in `Provisioning`.
    #[tracing::instrument(level = "debug", skip(self, config), fields(pipeline = %config.name))]
    pub async fn create(&self, config: PipelineConfig) -> Result<Uuid> {
        config.validate()?;
        let _table = self.inner.table.lock().await;
        if self.inner.pipelines.load().values().any(|entry| entry.name() == config.name) {
            return Err(AppError::Conflict(format!("a pipeline named {} already exists", config.name)).into());
        }

        let record = PipelineRecord { id: Uuid::new_v4(), config };
        self.persist(&record).await?;
        let store = CheckpointStore::new(self.inner.checkpoints.clone(), record.id);
        let entry = Arc::new(PipelineEntry::new(record.id, record.config, store));

        let orig = self.inner.pipelines.load_full();
        let mut updated = orig.as_ref().clone();
        updated.insert(record.id, entry);
        self.inner.pipelines.store(Arc::new(updated));
        tracing::info!(id = %record.id, "pipeline created");
        Ok(record.id)
    }

    /// Replace the config of a stopped pipeline.
    #[tracing::instrument(level = "debug", skip(self, config))]
    pub async fn update(&self, id: &Uuid, config: PipelineConfig) -> Result<PipelineView> {
        config.validate()?;
        let entry = self.entry(id)?;
        let slot = self.lock_slot(&entry)?;
        let state = entry.status.state();
        if !is_stoppable(&state, &slot) {
            return Err(AppError::Conflict(format!("pipeline can not be updated while {}", state.name())).into());
        }
        if config.name != entry.name() {
            return Err(AppError::InvalidInput("pipeline name can not be changed".into()).into());
        }

        let stale = stale_checkpoints(&entry.config.load(), &config);
        if !stale.is_empty() {
            tracing::info!(id = %id, connectors = ?stale, "resetting checkpoints of changed connectors");
            entry.checkpoints.remove(&stale).await?;
        }
        self.persist(&PipelineRecord { id: *id, config: config.clone() }).await?;
        entry.stats.store(Arc::new(PipelineStats::new(&config)));
        entry.config.store(Arc::new(config));
        tracing::info!(id = %id, "pipeline updated");
        Ok(entry.view())
    }

    /// Delete a stopped pipeline along with its checkpoints.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn delete(&self, id: &Uuid) -> Result<()> {
        let _table = self.inner.table.lock().await;
        let entry = self.entry(id)?;
        let mut slot = self.lock_slot(&entry)?;
        let state = entry.status.state();
        if !is_stoppable(&state, &slot) {
            return Err(AppError::Conflict(format!("pipeline can not be deleted while {}", state.name())).into());
        }
        join_controller(&entry, slot.take()).await;

        let (tree, key) = (self.inner.tree.clone(), utils::pipeline_key(id));
        Database::spawn_blocking(move || tree.remove(key))
            .await?
            .context("error deleting pipeline record")?;
        self.inner.tree.flush_async().await.context(ERR_DB_FLUSH)?;
        entry.checkpoints.clear().await?;

        let orig = self.inner.pipelines.load_full();
        let mut updated = orig.as_ref().clone();
        updated.remove(id);
        self.inner.pipelines.store(Arc::new(updated));
        tracing::info!(id = %id, "pipeline deleted");
        Ok(())
    }

    /// Start a pipeline, or resume it if paused.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn start(&self, id: &Uuid) -> Result<PipelineView> {
        let entry = self.entry(id)?;
        let mut slot = self.lock_slot(&entry)?;
        match entry.status.state() {
            PipelineState::Running => (),
            PipelineState::Paused => {
                self.send(&entry, &slot, PipelineCmd::Resume).await?;
                self.await_state(&entry, "running", |state| *state == PipelineState::Running).await?;
            }
            PipelineState::Provisioning if slot.is_none() => self.spawn_controller(&entry, &mut slot).await?,
            PipelineState::Terminated => {
                join_controller(&entry, slot.take()).await;
                entry.status.transition(PipelineState::Provisioning);
                self.spawn_controller(&entry, &mut slot).await?;
            }
            PipelineState::Failed { .. } => {
                return Err(AppError::Conflict("pipeline has failed and must be restarted".into()).into());
            }
            state => return Err(AppError::Conflict(format!("pipeline can not be started while {}", state.name())).into()),
        }
        Ok(entry.view())
    }

    /// Pause a running pipeline.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn pause(&self, id: &Uuid) -> Result<PipelineView> {
        let entry = self.entry(id)?;
        let slot = self.lock_slot(&entry)?;
        match entry.status.state() {
            PipelineState::Paused => (),
            PipelineState::Running => {
                self.send(&entry, &slot, PipelineCmd::Pause).await?;
                self.await_state(&entry, "paused", |state| *state == PipelineState::Paused).await?;
            }
            state => return Err(AppError::Conflict(format!("pipeline can not be paused while {}", state.name())).into()),
        }
        Ok(entry.view())
    }

    /// Shut down a running or paused pipeline, waiting for it to drain.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn shutdown(&self, id: &Uuid) -> Result<PipelineView> {
        let entry = self.entry(id)?;
        let mut slot = self.lock_slot(&entry)?;
        match entry.status.state() {
            PipelineState::Terminated => (),
            PipelineState::Running | PipelineState::Paused => {
                self.send(&entry, &slot, PipelineCmd::Shutdown).await?;
                self.await_state(&entry, "terminated", |state| *state == PipelineState::Terminated).await?;
                join_controller(&entry, slot.take()).await;
            }
            state => return Err(AppError::Conflict(format!("pipeline can not be shut down while {}", state.name())).into()),
        }
        Ok(entry.view())
    }

    /// Restart a failed pipeline.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn restart(&self, id: &Uuid) -> Result<PipelineView> {
        let entry = self.entry(id)?;
        let mut slot = self.lock_slot(&entry)?;
        match entry.status.state() {
            PipelineState::Failed { .. } => {
                join_controller(&entry, slot.take()).await;
                tracing::info!(id = %id, "restarting failed pipeline");
                entry.status.transition(PipelineState::Provisioning);
                self.spawn_controller(&entry, &mut slot).await?;
            }
            state => return Err(AppError::Conflict(format!("only failed pipelines can be restarted, pipeline is {}", state.name())).into()),
        }
        Ok(entry.view())
    }

    /// Drain every active pipeline, used on process shutdown.
    pub async fn shutdown_all(&self) {
        let pipelines = self.inner.pipelines.load_full();
        for entry in pipelines.values() {
            let mut slot = entry.slot.lock().await;
            if entry.status.state().is_active() {
                if let Err(err) = self.send(entry, &slot, PipelineCmd::Shutdown).await {
                    tracing::error!(error = ?err, id = %entry.id, "error sending shutdown to pipeline controller");
                }
                if let Err(err) = self.await_state(entry, "terminated", |state| *state == PipelineState::Terminated).await {
                    tracing::error!(error = ?err, id = %entry.id, "error draining pipeline");
                }
            }
            join_controller(entry, slot.take()).await;
        }
    }

    /// Refresh the gauges which are derived on scrape.
    pub fn refresh_metrics(&self) {
        for entry in self.inner.pipelines.load().values() {
            let status = entry.status.current();
            metrics::gauge!(METRIC_PIPELINE_UPTIME, "pipeline" => entry.name()).set(status.uptime_seconds());
        }
    }

    async fn spawn_controller(&self, entry: &PipelineEntry, slot: &mut Option<Controller>) -> Result<()> {
        let (tx, rx) = mpsc::channel(self.inner.config.command_queue_capacity.max(1));
        let resources = PipelineResources {
            brokers: self.inner.brokers.clone(),
            checkpoints: entry.checkpoints.clone(),
            stats: entry.stats.load().as_ref().clone(),
            status: entry.status.clone(),
        };
        let ctl = PipelineCtl::new(self.inner.config.clone(), entry.id, entry.config.load_full(), resources, rx);
        *slot = Some(Controller { tx, handle: ctl.spawn() });
        self.await_state(entry, "running", |state| *state != PipelineState::Provisioning).await
    }

    async fn send(&self, entry: &PipelineEntry, slot: &Option<Controller>, cmd: PipelineCmd) -> Result<()> {
        let ctl = slot
            .as_ref()
            .ok_or_else(|| AppError::Conflict("pipeline has no running controller".into()))?;
        ctl.tx.send(cmd).await.map_err(|_| {
            tracing::warn!(id = %entry.id, ?cmd, "pipeline controller stopped before accepting command");
            AppError::Conflict("pipeline controller is no longer running".into()).into()
        })
    }

    /// Wait for the pipeline to reach a state matching the predicate, or to fail.
    async fn await_state<F>(&self, entry: &PipelineEntry, target: &str, pred: F) -> Result<()>
    where
        F: Fn(&PipelineState) -> bool,
    {
        let mut rx = entry.status.subscribe();
        let wait = async {
            rx.wait_for(|status| pred(&status.state) || matches!(status.state, PipelineState::Failed { .. }))
                .await
                .map(|_| ())
        };
        match tokio::time::timeout(self.inner.config.command_timeout(), wait).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(anyhow::Error::from(err).context("pipeline status channel closed")),
            Err(_) => Err(AppError::Timeout(target.into()).into()),
        }
    }

    async fn persist(&self, record: &PipelineRecord) -> Result<()> {
        let (tree, key, val) = (self.inner.tree.clone(), utils::pipeline_key(&record.id), utils::encode_model(record)?);
        Database::spawn_blocking(move || tree.insert(key, val))
            .await?
            .context("error writing pipeline record")?;
        self.inner.tree.flush_async().await.context(ERR_DB_FLUSH)?;
        Ok(())
    }
}

/// The inputs of `old` which were removed or whose transport changed in `new`.
fn stale_checkpoints(old: &PipelineConfig, new: &PipelineConfig) -> Vec<String> {
    old.inputs
        .iter()
        .filter(|input| !new.inputs.iter().any(|other| other.name == input.name && other.transport == input.transport))
        .map(|input| input.name.clone())
        .collect()
}

/// True if the pipeline has no active controller and may be updated or deleted.
fn is_stoppable(state: &PipelineState, slot: &Option<Controller>) -> bool {
    match state {
        PipelineState::Provisioning => slot.is_none(),
        state => state.is_stopped(),
    }
}

async fn join_controller(entry: &PipelineEntry, ctl: Option<Controller>) {
    let ctl = match ctl {
        Some(ctl) => ctl,
        None => return,
    };
    drop(ctl.tx);
    if let Err(err) = ctl.handle.await {
        tracing::error!(error = ?err, id = %entry.id, "error joining pipeline controller");
    }
}

/// Recover all pipeline records from the given tree.
#[tracing::instrument(level = "debug", skip(tree))]
async fn recover_pipelines(tree: Tree) -> Result<Vec<PipelineRecord>> {
    Database::spawn_blocking(move || -> Result<Vec<PipelineRecord>> {
        let mut records = vec![];
        for kv_res in tree.iter() {
            let (_key, val) = kv_res.context(ERR_ITER_FAILURE)?;
            let record: PipelineRecord = utils::decode_model(&val)?;
            records.push(record);
        }
        Ok(records)
    })
    .await?
}
