//! Transmittable targets.
//!
//! A target is a byte-addressable resource which transfer units read from and write to at
//! explicit positions. Units and channels are written only against the `Transmittable`
//! trait, so partition data may live in files or in memory regions.

use std::fmt;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// A boxed transmittable target.
pub type BoxTarget = Box<dyn Transmittable>;

/// A byte-addressable resource supporting positioned reads & writes and an explicit close.
#[async_trait]
pub trait Transmittable: Send + Sync + fmt::Debug {
    /// The identity of the underlying resource.
    fn identity(&self) -> &TargetIdentity;

    /// Check if the underlying resource is currently open.
    fn is_open(&self) -> bool;

    /// Acquire the underlying resource; calling this on an open target is a no-op.
    async fn open(&mut self) -> io::Result<()>;

    /// The current length in bytes of the underlying resource.
    async fn len(&mut self) -> io::Result<u64>;

    /// Read bytes starting at `pos` into `buf`, returning the number of bytes read.
    ///
    /// A return value of `0` indicates that `pos` is at or beyond the end of the resource.
    async fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all of `data` starting at `pos`.
    async fn write_at(&mut self, pos: u64, data: &[u8]) -> io::Result<()>;

    /// Release the underlying resource; calling this on a closed target is a no-op.
    async fn close(&mut self) -> io::Result<()>;
}

/// The identity of a transmittable target's underlying resource.
#[derive(Clone, Debug)]
pub enum TargetIdentity {
    /// A file on local disk.
    File(PathBuf),
    /// A named in-memory region.
    Memory(MemoryRegion),
}

impl TargetIdentity {
    /// The unit name to use for this resource when it is transferred.
    pub fn name(&self) -> String {
        match self {
            Self::File(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| path.to_string_lossy().to_string()),
            Self::Memory(region) => region.name().to_string(),
        }
    }
}

/// The access mode of a file target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    /// The file is only read from, and must already exist.
    Read,
    /// The file is written to, and is created if needed. Existing bytes are preserved so that
    /// interrupted transfers may resume.
    Write,
}

/// A transmittable target backed by a file on disk.
pub struct FileTarget {
    identity: TargetIdentity,
    mode: AccessMode,
    file: Option<File>,
}

impl FileTarget {
    /// Create a new unopened instance.
    pub fn new(path: impl Into<PathBuf>, mode: AccessMode) -> Self {
        Self {
            identity: TargetIdentity::File(path.into()),
            mode,
            file: None,
        }
    }

    /// The path of the underlying file.
    pub fn path(&self) -> &Path {
        match &self.identity {
            TargetIdentity::File(path) => path.as_path(),
            TargetIdentity::Memory(_) => unreachable!("file targets always carry a file identity"),
        }
    }

    fn file_mut(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "file target is not open"))
    }
}

impl fmt::Debug for FileTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileTarget")
            .field("path", &self.path())
            .field("mode", &self.mode)
            .field("open", &self.file.is_some())
            .finish()
    }
}

#[async_trait]
impl Transmittable for FileTarget {
    fn identity(&self) -> &TargetIdentity {
        &self.identity
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    async fn open(&mut self) -> io::Result<()> {
        if self.file.is_some() {
            return Ok(());
        }
        let path = self.path().to_path_buf();
        let file = match self.mode {
            AccessMode::Read => OpenOptions::new().read(true).open(&path).await?,
            AccessMode::Write => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                OpenOptions::new().read(true).write(true).create(true).open(&path).await?
            }
        };
        self.file = Some(file);
        Ok(())
    }

    async fn len(&mut self) -> io::Result<u64> {
        match self.file.as_ref() {
            Some(file) => Ok(file.metadata().await?.len()),
            None => Ok(tokio::fs::metadata(self.path()).await?.len()),
        }
    }

    async fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(pos)).await?;
        file.read(buf).await
    }

    async fn write_at(&mut self, pos: u64, data: &[u8]) -> io::Result<()> {
        if self.mode == AccessMode::Read {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "file target was opened read-only"));
        }
        let file = self.file_mut()?;
        file.seek(SeekFrom::Start(pos)).await?;
        file.write_all(data).await
    }

    async fn close(&mut self) -> io::Result<()> {
        let mut file = match self.file.take() {
            Some(file) => file,
            None => return Ok(()),
        };
        if self.mode == AccessMode::Write {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}

/// A named, shareable in-memory byte region.
#[derive(Clone, Default)]
pub struct MemoryRegion {
    name: Arc<String>,
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemoryRegion {
    /// Create a new empty region.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_data(name, Vec::new())
    }

    /// Create a new region holding the given bytes.
    pub fn with_data(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: Arc::new(name.into()),
            data: Arc::new(Mutex::new(data)),
        }
    }

    /// The name of this region.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// The current length of this region.
    pub fn len(&self) -> io::Result<u64> {
        Ok(self.lock()?.len() as u64)
    }

    /// Check if this region is empty.
    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.lock()?.is_empty())
    }

    /// Copy out the full contents of this region.
    pub fn to_vec(&self) -> io::Result<Vec<u8>> {
        Ok(self.lock()?.clone())
    }

    /// Replace the full contents of this region.
    pub fn replace(&self, data: Vec<u8>) -> io::Result<()> {
        *self.lock()? = data;
        Ok(())
    }

    fn lock(&self) -> io::Result<MutexGuard<'_, Vec<u8>>> {
        self.data
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, format!("memory region {} lock poisoned", self.name)))
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.len().ok();
        f.debug_struct("MemoryRegion").field("name", &self.name).field("len", &len).finish()
    }
}

/// A transmittable target backed by an in-memory region.
#[derive(Debug)]
pub struct MemoryTarget {
    identity: TargetIdentity,
    region: MemoryRegion,
    open: bool,
}

impl MemoryTarget {
    /// Create a new unopened instance over the given region.
    pub fn new(region: MemoryRegion) -> Self {
        Self {
            identity: TargetIdentity::Memory(region.clone()),
            region,
            open: false,
        }
    }

    /// The region backing this target.
    pub fn region(&self) -> &MemoryRegion {
        &self.region
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::NotConnected, "memory target is not open"))
        }
    }
}

#[async_trait]
impl Transmittable for MemoryTarget {
    fn identity(&self) -> &TargetIdentity {
        &self.identity
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn open(&mut self) -> io::Result<()> {
        self.open = true;
        Ok(())
    }

    async fn len(&mut self) -> io::Result<u64> {
        self.region.len()
    }

    async fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.ensure_open()?;
        let data = self.region.lock()?;
        let start = match usize::try_from(pos) {
            Ok(start) if start < data.len() => start,
            _ => return Ok(0),
        };
        let len = buf.len().min(data.len() - start);
        buf[..len].copy_from_slice(&data[start..start + len]);
        Ok(len)
    }

    async fn write_at(&mut self, pos: u64, src: &[u8]) -> io::Result<()> {
        self.ensure_open()?;
        let start = usize::try_from(pos).map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        let mut data = self.region.lock()?;
        let end = start + src.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(src);
        Ok(())
    }

    async fn close(&mut self) -> io::Result<()> {
        self.open = false;
        Ok(())
    }
}
