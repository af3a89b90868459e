use std::collections::BTreeMap;

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::connector::ResumptionToken;
use crate::database::{Database, Tree};
use crate::error::{ERR_DB_FLUSH, ERR_ITER_FAILURE};
use crate::utils;

/// The durable resumption tokens of a pipeline's input connectors.
#[derive(Clone)]
pub struct CheckpointStore {
    tree: Tree,
    pipeline: Uuid,
}

impl CheckpointStore {
    pub fn new(tree: Tree, pipeline: Uuid) -> Self {
        Self { tree, pipeline }
    }

    /// Load the checkpoint of the given connector, if any.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn load(&self, connector: &str) -> Result<Option<ResumptionToken>> {
        let (tree, key) = (self.tree.clone(), utils::checkpoint_key(&self.pipeline, connector));
        let val = Database::spawn_blocking(move || tree.get(key))
            .await?
            .context("error reading connector checkpoint")?;
        val.map(|val| utils::decode_model(&val)).transpose()
    }

    /// Load the checkpoints of all connectors of this pipeline, keyed by connector name.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn load_all(&self) -> Result<BTreeMap<String, ResumptionToken>> {
        let (tree, prefix) = (self.tree.clone(), utils::checkpoint_prefix(&self.pipeline));
        Database::spawn_blocking(move || -> Result<BTreeMap<String, ResumptionToken>> {
            let mut checkpoints = BTreeMap::new();
            for kv_res in tree.scan_prefix(prefix) {
                let (key, val) = kv_res.context(ERR_ITER_FAILURE)?;
                checkpoints.insert(utils::decode_checkpoint_connector(&key)?, utils::decode_model(&val)?);
            }
            Ok(checkpoints)
        })
        .await?
    }

    /// Durably record the checkpoint of the given connector.
    #[tracing::instrument(level = "trace", skip(self, token))]
    pub async fn save(&self, connector: &str, token: &ResumptionToken) -> Result<()> {
        let (tree, key, val) = (self.tree.clone(), utils::checkpoint_key(&self.pipeline, connector), utils::encode_model(token)?);
        Database::spawn_blocking(move || tree.insert(key, val))
            .await?
            .context("error writing connector checkpoint")?;
        self.tree.flush_async().await.context(ERR_DB_FLUSH)?;
        Ok(())
    }

    /// Remove the checkpoints of the given connectors.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn remove(&self, connectors: &[String]) -> Result<()> {
        let mut batch = sled::Batch::default();
        for connector in connectors {
            batch.remove(utils::checkpoint_key(&self.pipeline, connector));
        }
        let tree = self.tree.clone();
        Database::spawn_blocking(move || tree.apply_batch(batch))
            .await?
            .context("error removing connector checkpoints")?;
        self.tree.flush_async().await.context(ERR_DB_FLUSH)?;
        Ok(())
    }

    /// Remove the checkpoints of all connectors of this pipeline.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn clear(&self) -> Result<()> {
        let (tree, prefix) = (self.tree.clone(), utils::checkpoint_prefix(&self.pipeline));
        Database::spawn_blocking(move || -> Result<()> {
            let mut batch = sled::Batch::default();
            for key_res in tree.scan_prefix(prefix).keys() {
                batch.remove(key_res.context(ERR_ITER_FAILURE)?);
            }
            tree.apply_batch(batch).context("error removing connector checkpoints")?;
            Ok(())
        })
        .await??;
        self.tree.flush_async().await.context(ERR_DB_FLUSH)?;
        Ok(())
    }
}
