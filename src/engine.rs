//! The computation engine boundary.
//!
//! The engine itself is an external collaborator. A pipeline controller only ever pushes decoded
//! input batches into it, steps it, and commits once every output of the step has been durably
//! accepted downstream.

use std::sync::Arc;

use crate::error::EngineError;
use crate::models::row::cmp_rows;
use crate::models::{EngineKind, PipelineConfig, RowBatch};

/// The capability of an incremental computation engine.
pub trait Engine: Send + 'static {
    /// Push a batch decoded from the named input connector.
    fn push(&mut self, input: &str, batch: RowBatch) -> Result<(), EngineError>;

    /// Run one step, returning the output batches produced for each named output connector.
    fn step(&mut self) -> Result<Vec<(Arc<String>, RowBatch)>, EngineError>;

    /// Commit the effects of all steps so far.
    fn commit(&mut self) -> Result<(), EngineError>;
}

/// Build the engine selected by the given pipeline config.
pub fn build(config: &PipelineConfig) -> Box<dyn Engine> {
    let outputs = config.outputs.iter().map(|cfg| Arc::new(cfg.name.clone())).collect();
    match config.engine {
        EngineKind::Identity => Box::new(IdentityEngine::new(outputs)),
        EngineKind::Consolidate => Box::new(ConsolidateEngine::new(outputs)),
    }
}

/// An engine which forwards every pushed batch to every output.
pub struct IdentityEngine {
    outputs: Vec<Arc<String>>,
    pending: Vec<RowBatch>,
}

impl IdentityEngine {
    pub fn new(outputs: Vec<Arc<String>>) -> Self {
        Self { outputs, pending: vec![] }
    }
}

impl Engine for IdentityEngine {
    fn push(&mut self, _input: &str, batch: RowBatch) -> Result<(), EngineError> {
        self.pending.push(batch);
        Ok(())
    }

    fn step(&mut self) -> Result<Vec<(Arc<String>, RowBatch)>, EngineError> {
        let batch: RowBatch = self.pending.drain(..).flat_map(|batch| batch.rows).collect();
        Ok(self.outputs.iter().map(|name| (name.clone(), batch.clone())).collect())
    }

    fn commit(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
}

/// An engine which consolidates each step's input, summing the weights of identical rows and
/// dropping rows whose weights cancel out.
pub struct ConsolidateEngine {
    outputs: Vec<Arc<String>>,
    pending: RowBatch,
}

impl ConsolidateEngine {
    pub fn new(outputs: Vec<Arc<String>>) -> Self {
        Self {
            outputs,
            pending: RowBatch::default(),
        }
    }
}

impl Engine for ConsolidateEngine {
    fn push(&mut self, _input: &str, batch: RowBatch) -> Result<(), EngineError> {
        self.pending.rows.extend(batch.rows);
        Ok(())
    }

    fn step(&mut self) -> Result<Vec<(Arc<String>, RowBatch)>, EngineError> {
        let mut rows = std::mem::take(&mut self.pending.rows);
        rows.sort_by(|a, b| cmp_rows(&a.0, &b.0));
        let mut out: Vec<(_, i64)> = Vec::with_capacity(rows.len());
        for (row, weight) in rows {
            match out.last_mut() {
                Some((last, acc)) if cmp_rows(last, &row).is_eq() => {
                    *acc = acc.checked_add(weight).ok_or_else(|| EngineError("row weight overflow during consolidation".into()))?;
                }
                _ => out.push((row, weight)),
            }
        }
        out.retain(|(_, weight)| *weight != 0);
        let batch = RowBatch::new(out);
        Ok(self.outputs.iter().map(|name| (name.clone(), batch.clone())).collect())
    }

    fn commit(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
}
