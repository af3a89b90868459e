//! Database management.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use sled::{Config as SledConfig, Db, IVec};

use crate::config::Config;
use crate::error::{ShutdownError, ShutdownResult};

pub type Tree = sled::Tree;

/// The root under which each instance keeps its sled database.
pub const DEFAULT_DATA_PATH: &str = "/usr/local/hadron-connect/data";
/// The DB tree used for pipeline records.
const TREE_PIPELINES: &str = "pipelines";
/// The DB tree used for connector checkpoints.
const TREE_CHECKPOINTS: &str = "checkpoints";

/// Serde default for `Config::storage_data_path`.
pub fn default_data_path() -> String {
    DEFAULT_DATA_PATH.to_string()
}

/// An abstraction over the connect database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    /// The sled handle shared by all trees.
    db: Db,
}

impl Database {
    /// Open the instance's database under `{storage_data_path}/{instance}`.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let dbpath = PathBuf::from(&config.storage_data_path).join(config.instance.as_str());
        tokio::fs::create_dir_all(&dbpath)
            .await
            .context("error creating dir for hadron connect database")?;

        Self::spawn_blocking(move || -> Result<Self> {
            let db = SledConfig::new().path(dbpath).mode(sled::Mode::HighThroughput).open()?;
            let inner = Arc::new(DatabaseInner { db });
            Ok(Self { inner })
        })
        .await?
    }

    /// Run a blocking sled call on the blocking pool. A failure to join the task is fatal.
    #[tracing::instrument(level = "trace", skip(f), err)]
    pub async fn spawn_blocking<F, R>(f: F) -> ShutdownResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|err| ShutdownError::from(anyhow::Error::from(err)))
    }

    async fn open_tree(&self, name: &'static str) -> ShutdownResult<Tree> {
        let (db, ivname) = (self.inner.db.clone(), IVec::from(name));
        let tree = Self::spawn_blocking(move || -> Result<Tree> { Ok(db.open_tree(ivname)?) })
            .await
            .and_then(|res| res.map_err(|err| ShutdownError(anyhow!("could not open DB tree {} {}", name, err))))?;
        Ok(tree)
    }

    /// Get a handle to the DB tree of pipeline records.
    pub async fn get_pipelines_tree(&self) -> ShutdownResult<Tree> {
        self.open_tree(TREE_PIPELINES).await
    }

    /// Get a handle to the DB tree of connector checkpoints.
    pub async fn get_checkpoints_tree(&self) -> ShutdownResult<Tree> {
        self.open_tree(TREE_CHECKPOINTS).await
    }
}
