//! Database management.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use sled::{Config as SledConfig, Db, IVec};

use crate::config::Config;
use crate::error::{ShutdownError, ShutdownResult};

pub type Tree = sled::Tree;

/// The default path to use for data storage.
pub const DEFAULT_DATA_PATH: &str = "/usr/local/tessera/data";
/// The DB tree used for cluster metadata: activation state, baseline & auto-adjust settings.
const TREE_METASTORE: &str = "metastore";
/// The directory under the data path holding the metastore database.
const DIR_METASTORE: &str = "db";
/// The directory under the data path holding partition files.
const DIR_PARTITIONS: &str = "partitions";

/// The default path to use for data storage.
pub fn default_data_path() -> String {
    DEFAULT_DATA_PATH.to_string()
}

/// An abstraction over the Tessera database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    /// System runtime config.
    config: Arc<Config>,
    /// The underlying DB handle.
    db: Db,
}

impl Database {
    /// Open the database for usage.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // Determine the database path, and ensure it exists.
        let dbpath = PathBuf::from(&config.storage_data_path)
            .join(config.node_id.as_str())
            .join(DIR_METASTORE);
        tokio::fs::create_dir_all(&dbpath)
            .await
            .context("error creating dir for tessera metastore database")?;

        Self::spawn_blocking(move || -> Result<Self> {
            let db = SledConfig::new().path(dbpath).mode(sled::Mode::HighThroughput).open()?;
            let inner = Arc::new(DatabaseInner { config, db });
            Ok(Self { inner })
        })
        .await?
    }

    /// Spawn a blocking database-related function, returning a ShutdownError if anything goes
    /// wrong related to spawning & joining.
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

    /// Get a handle to the DB tree for cluster metadata.
    pub async fn get_metastore_tree(&self) -> ShutdownResult<Tree> {
        let (db, ivname) = (self.inner.db.clone(), IVec::from(TREE_METASTORE));
        let tree = Self::spawn_blocking(move || -> Result<Tree> { Ok(db.open_tree(ivname)?) })
            .await
            .and_then(|res| res.map_err(|err| ShutdownError(anyhow!("could not open DB tree {} {}", TREE_METASTORE, err))))?;
        Ok(tree)
    }

    /// The directory holding this node's partition files.
    pub fn partitions_dir(&self) -> PathBuf {
        PathBuf::from(&self.inner.config.storage_data_path)
            .join(self.inner.config.node_id.as_str())
            .join(DIR_PARTITIONS)
    }
}
