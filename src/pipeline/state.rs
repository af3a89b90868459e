//! Pipeline lifecycle states.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::watch;

use crate::pipeline::{METRIC_PIPELINE_LAST_ERROR, METRIC_PIPELINE_STATE};

/// The lifecycle state of a pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineState {
    Provisioning,
    Running,
    Paused,
    Failed { reason: String },
    ShuttingDown,
    Terminated,
}

impl PipelineState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Failed { .. } => "failed",
            Self::ShuttingDown => "shutting_down",
            Self::Terminated => "terminated",
        }
    }

    /// The numeric code of this state, as exported by the state gauge.
    pub fn code(&self) -> f64 {
        match self {
            Self::Provisioning => 0.0,
            Self::Running => 1.0,
            Self::Paused => 2.0,
            Self::Failed { .. } => 3.0,
            Self::ShuttingDown => 4.0,
            Self::Terminated => 5.0,
        }
    }

    /// True if no controller owns the pipeline in this state.
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Terminated)
    }

    /// True if a controller is actively owning the pipeline in this state.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { reason } => write!(f, "failed({})", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// The observable status of a pipeline.
#[derive(Clone, Debug)]
pub struct PipelineStatus {
    pub state: PipelineState,
    /// The time of the last state transition.
    pub since: OffsetDateTime,
    /// The time at which the current controller instance started running.
    pub started_at: Option<OffsetDateTime>,
    /// The reason of the most recent failure, kept across restarts.
    pub last_error: Option<String>,
}

impl PipelineStatus {
    /// Seconds since the current controller instance started running, zero if not running.
    pub fn uptime_seconds(&self) -> f64 {
        match (&self.state, self.started_at) {
            (state, Some(started)) if state.is_active() => (OffsetDateTime::now_utc() - started).as_seconds_f64().max(0.0),
            _ => 0.0,
        }
    }
}

/// The sending half of a pipeline's status channel.
///
/// Held by the registry, and shared with each controller instance spawned for the pipeline.
#[derive(Clone)]
pub struct StatusTx {
    pipeline: Arc<String>,
    tx: Arc<watch::Sender<PipelineStatus>>,
}

impl StatusTx {
    /// Create a status channel for the named pipeline, starting in `Provisioning`.
    pub fn new(pipeline: Arc<String>) -> Self {
        let (tx, _) = watch::channel(PipelineStatus {
            state: PipelineState::Provisioning,
            since: OffsetDateTime::now_utc(),
            started_at: None,
            last_error: None,
        });
        metrics::gauge!(METRIC_PIPELINE_STATE, "pipeline" => pipeline.as_ref().clone()).set(PipelineState::Provisioning.code());
        Self { pipeline, tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineStatus> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> PipelineStatus {
        self.tx.borrow().clone()
    }

    pub fn state(&self) -> PipelineState {
        self.tx.borrow().state.clone()
    }

    /// Transition the pipeline to the given state.
    pub fn transition(&self, state: PipelineState) {
        let now = OffsetDateTime::now_utc();
        let mut prev = PipelineState::Provisioning;
        let mut prev_error = None;
        self.tx.send_modify(|status| {
            prev = std::mem::replace(&mut status.state, state.clone());
            status.since = now;
            match &state {
                PipelineState::Running if prev == PipelineState::Provisioning => status.started_at = Some(now),
                PipelineState::Failed { reason } => {
                    prev_error = status.last_error.replace(reason.clone());
                    status.started_at = None;
                }
                PipelineState::Terminated => status.started_at = None,
                _ => (),
            }
        });

        let labels = [("pipeline", self.pipeline.as_ref().clone())];
        metrics::gauge!(METRIC_PIPELINE_STATE, &labels).set(state.code());
        if let PipelineState::Failed { reason } = &state {
            if let Some(prev_error) = prev_error {
                metrics::gauge!(METRIC_PIPELINE_LAST_ERROR, "pipeline" => self.pipeline.as_ref().clone(), "reason" => prev_error).set(0.0);
            }
            metrics::gauge!(METRIC_PIPELINE_LAST_ERROR, "pipeline" => self.pipeline.as_ref().clone(), "reason" => reason.clone()).set(1.0);
            tracing::error!(pipeline = %self.pipeline, from = prev.name(), %reason, "pipeline failed");
        } else {
            tracing::info!(pipeline = %self.pipeline, from = prev.name(), to = state.name(), "pipeline state transition");
        }
    }
}
