//! Partition storage backends.
//!
//! The on-disk format of a partition is opaque to the transfer engine: a partition is a single
//! byte range which is streamed as one unit named after the partition. Received data is staged
//! next to the live data and only applied once a session completes.


use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{GridError, GridResult};
use crate::transfer::target::{AccessMode, BoxTarget, FileTarget, MemoryRegion, MemoryTarget, TargetIdentity};
use crate::transfer::unit::ChunkIoUnit;

/// The suffix of files holding partition data received from a peer.
const RECV_SUFFIX: &str = "recv";

/// The name of the transfer unit carrying the data of the given partition.
pub fn partition_unit_name(partition: u32) -> String {
    format!("part-{}", partition)
}

/// A storage backend holding the data of local partitions.
#[async_trait]
pub trait PartitionStore: Send + Sync {
    /// Open the data of the given partition for sending, positioned at `offset`.
    ///
    /// Returns `None` when the partition holds no data, in which case there is nothing to send.
    async fn open_for_read(&self, partition: u32, offset: u64) -> GridResult<Option<ChunkIoUnit>>;

    /// Open the staging target receiving the data of the given partition.
    ///
    /// An `offset` of `0` discards any previously staged bytes, otherwise staged bytes are kept
    /// so that an interrupted transfer may continue from `offset`.
    async fn open_for_write(&self, partition: u32, offset: u64) -> GridResult<BoxTarget>;

    /// Make the fully received target the live data of the given partition.
    async fn apply_received(&self, partition: u32, target: BoxTarget) -> GridResult<()>;
}

//////////////////////////////////////////////////////////////////////////////
// File Store ////////////////////////////////////////////////////////////////

/// A partition store keeping each partition in its own file.
#[derive(Clone, Debug)]
pub struct FilePartitionStore {
    dir: PathBuf,
}

impl FilePartitionStore {
    /// Create a new instance rooted at the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The directory holding partition files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The path of the live data file of the given partition.
    pub fn data_path(&self, partition: u32) -> PathBuf {
        self.dir.join(format!("{}.bin", partition_unit_name(partition)))
    }

    /// The path of the staging file of the given partition.
    pub fn recv_path(&self, partition: u32) -> PathBuf {
        self.dir.join(format!("{}.bin.{}", partition_unit_name(partition), RECV_SUFFIX))
    }
}

#[async_trait]
impl PartitionStore for FilePartitionStore {
    #[tracing::instrument(level = "trace", skip(self))]
    async fn open_for_read(&self, partition: u32, offset: u64) -> GridResult<Option<ChunkIoUnit>> {
        let path = self.data_path(partition);
        let len = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if len == 0 {
            return Ok(None);
        }
        let target = FileTarget::new(path, AccessMode::Read);
        let mut unit = ChunkIoUnit::new(partition_unit_name(partition), 0, len, Box::new(target));
        unit.resume_at(offset)?;
        Ok(Some(unit))
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn open_for_write(&self, partition: u32, offset: u64) -> GridResult<BoxTarget> {
        let path = self.recv_path(partition);
        if offset == 0 {
            match tokio::fs::remove_file(&path).await {
                Ok(_) => (),
                Err(err) if err.kind() == io::ErrorKind::NotFound => (),
                Err(err) => return Err(err.into()),
            }
        }
        Ok(Box::new(FileTarget::new(path, AccessMode::Write)))
    }

    #[tracing::instrument(level = "trace", skip(self, target))]
    async fn apply_received(&self, partition: u32, mut target: BoxTarget) -> GridResult<()> {
        let staged = match target.identity() {
            TargetIdentity::File(path) => path.clone(),
            TargetIdentity::Memory(region) => {
                return Err(GridError::InvalidInput(format!(
                    "memory region {} can not be applied to file partition {}",
                    region.name(),
                    partition
                )))
            }
        };
        if staged != self.recv_path(partition) {
            return Err(GridError::InvalidInput(format!(
                "file {:?} is not the staging file of partition {}",
                staged, partition
            )));
        }
        target.close().await.map_err(GridError::from_target)?;
        tokio::fs::rename(&staged, self.data_path(partition)).await?;
        tracing::debug!(partition, "applied received partition data");
        Ok(())
    }
}

//////////////////////////////////////////////////////////////////////////////
// Memory Store //////////////////////////////////////////////////////////////

/// A partition store keeping partitions in memory regions.
#[derive(Clone, Debug, Default)]
pub struct MemoryPartitionStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    /// Live partition data.
    live: HashMap<u32, MemoryRegion>,
    /// Partition data being received.
    staged: HashMap<u32, MemoryRegion>,
}

impl MemoryPartitionStore {
    /// Create a new empty instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the live data of the given partition.
    pub async fn insert(&self, partition: u32, data: Vec<u8>) {
        let region = MemoryRegion::with_data(partition_unit_name(partition), data);
        self.inner.lock().await.live.insert(partition, region);
    }

    /// Copy out the live data of the given partition.
    pub async fn get(&self, partition: u32) -> GridResult<Option<Vec<u8>>> {
        let inner = self.inner.lock().await;
        match inner.live.get(&partition) {
            Some(region) => Ok(Some(region.to_vec()?)),
            None => Ok(None),
        }
    }

    /// Copy out the staged data of the given partition.
    pub async fn get_staged(&self, partition: u32) -> GridResult<Option<Vec<u8>>> {
        let inner = self.inner.lock().await;
        match inner.staged.get(&partition) {
            Some(region) => Ok(Some(region.to_vec()?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl PartitionStore for MemoryPartitionStore {
    async fn open_for_read(&self, partition: u32, offset: u64) -> GridResult<Option<ChunkIoUnit>> {
        let region = match self.inner.lock().await.live.get(&partition) {
            Some(region) => region.clone(),
            None => return Ok(None),
        };
        let len = region.len()?;
        if len == 0 {
            return Ok(None);
        }
        let mut unit = ChunkIoUnit::new(partition_unit_name(partition), 0, len, Box::new(MemoryTarget::new(region)));
        unit.resume_at(offset)?;
        Ok(Some(unit))
    }

    async fn open_for_write(&self, partition: u32, offset: u64) -> GridResult<BoxTarget> {
        let mut inner = self.inner.lock().await;
        let region = match inner.staged.get(&partition) {
            Some(region) if offset > 0 => region.clone(),
            _ => {
                let region = MemoryRegion::new(partition_unit_name(partition));
                inner.staged.insert(partition, region.clone());
                region
            }
        };
        Ok(Box::new(MemoryTarget::new(region)))
    }

    async fn apply_received(&self, partition: u32, mut target: BoxTarget) -> GridResult<()> {
        let region = match target.identity() {
            TargetIdentity::Memory(region) => region.clone(),
            TargetIdentity::File(path) => {
                return Err(GridError::InvalidInput(format!(
                    "file {:?} can not be applied to memory partition {}",
                    path, partition
                )))
            }
        };
        target.close().await.map_err(GridError::from_target)?;
        let mut inner = self.inner.lock().await;
        inner.staged.remove(&partition);
        inner.live.insert(partition, region);
        Ok(())
    }
}
