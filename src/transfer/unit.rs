//! Chunk I/O units.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{GridError, GridResult};
use crate::models::{TransmissionMeta, TransmissionPolicy};
use crate::transfer::target::{BoxTarget, TargetIdentity, Transmittable};

/// A transmittable target along with the bookkeeping of its transfer.
///
/// The unit covers the byte range `[start_position, start_position + count)` of its target.
/// `transferred` only ever grows while streaming, never exceeds `count`, and the unit is
/// complete once `transferred == count`. A failed channel leaves `transferred` valid, so the
/// next channel resumes from `start_position + transferred`.
#[derive(Debug)]
pub struct ChunkIoUnit {
    /// The name of this unit, unique within its session.
    name: String,
    /// The position of the target where this unit begins.
    start_position: u64,
    /// The total number of bytes of this unit.
    count: u64,
    /// The number of bytes transferred so far.
    transferred: u64,
    /// The transfer policy of this unit.
    policy: TransmissionPolicy,
    /// The target of this unit.
    target: BoxTarget,
}

impl ChunkIoUnit {
    /// Create a new instance over the given unopened target.
    pub fn new(name: impl Into<String>, start_position: u64, count: u64, target: BoxTarget) -> Self {
        let policy = match target.identity() {
            TargetIdentity::File(_) => TransmissionPolicy::File,
            TargetIdentity::Memory(_) => TransmissionPolicy::Chunk,
        };
        Self {
            name: name.into(),
            start_position,
            count,
            transferred: 0,
            policy,
            target,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start_position(&self) -> u64 {
        self.start_position
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    pub fn policy(&self) -> TransmissionPolicy {
        self.policy
    }

    /// The number of bytes which still need to be transferred.
    pub fn remaining(&self) -> u64 {
        self.count - self.transferred
    }

    /// The absolute position of the next byte to be transferred.
    pub fn next_position(&self) -> u64 {
        self.start_position + self.transferred
    }

    /// Check if all bytes of this unit have been transferred.
    pub fn is_complete(&self) -> bool {
        self.transferred == self.count
    }

    /// The size of the next segment given the channel's segment cap.
    pub fn segment_len(&self, segment_cap: usize) -> usize {
        self.remaining().min(segment_cap as u64) as usize
    }

    /// A reference to this unit's target.
    pub fn target(&self) -> &dyn Transmittable {
        self.target.as_ref()
    }

    /// Consume this unit, returning its target.
    pub fn into_target(self) -> BoxTarget {
        self.target
    }

    /// Lazily open the underlying target.
    pub async fn open(&mut self) -> GridResult<()> {
        if self.target.is_open() {
            return Ok(());
        }
        self.target.open().await.map_err(GridError::from_target)
    }

    /// Pull the next segment of this unit from the given reader into the target.
    ///
    /// At most `min(buf.len(), remaining)` bytes are read. Returns the number of bytes actually
    /// read, where `0` is a no-op which leaves this unit untouched.
    pub async fn read_from<R>(&mut self, reader: &mut R, buf: &mut [u8]) -> GridResult<usize>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let len = self.segment_len(buf.len());
        if len == 0 {
            return Ok(0);
        }
        self.open().await?;
        let read = reader.read(&mut buf[..len]).await?;
        if read == 0 {
            return Ok(0);
        }
        let pos = self.next_position();
        self.target.write_at(pos, &buf[..read]).await.map_err(GridError::from_target)?;
        self.transferred += read as u64;
        Ok(read)
    }

    /// Push the next segment of this unit from the target into the given writer.
    ///
    /// At most `min(buf.len(), remaining)` bytes are written. Returns the number of bytes written.
    pub async fn write_into<W>(&mut self, writer: &mut W, buf: &mut [u8]) -> GridResult<usize>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let len = self.segment_len(buf.len());
        if len == 0 {
            return Ok(0);
        }
        self.open().await?;
        let pos = self.next_position();
        let read = self.target.read_at(pos, &mut buf[..len]).await.map_err(GridError::from_target)?;
        if read == 0 {
            return Err(GridError::Corrupted(format!(
                "unit {} source ended at position {} with {} bytes still expected",
                self.name,
                pos,
                self.remaining()
            )));
        }
        writer.write_all(&buf[..read]).await?;
        self.transferred += read as u64;
        Ok(read)
    }

    /// Align this unit with a peer-reported absolute offset of the next byte to transfer.
    pub fn resume_at(&mut self, offset: u64) -> GridResult<()> {
        let end = self.start_position.checked_add(self.count);
        if offset < self.start_position || end.map_or(true, |end| offset > end) {
            return Err(GridError::Protocol(format!(
                "resume offset {} is outside of unit {} [start={}, count={}]",
                offset, self.name, self.start_position, self.count
            )));
        }
        self.transferred = offset - self.start_position;
        Ok(())
    }

    /// Discard all transfer progress, restarting this unit from its start position.
    pub fn reset(&mut self) {
        self.transferred = 0;
    }

    /// Release the underlying target.
    ///
    /// Safe to call multiple times. Errors are logged and swallowed so that they never replace
    /// a primary transfer error.
    pub async fn close(&mut self) {
        if let Err(err) = self.target.close().await {
            tracing::warn!(error = ?err, unit = %self.name, "error closing transfer unit target");
        }
    }

    /// The header to send ahead of the remaining bytes of this unit.
    pub fn header(&self) -> TransmissionMeta {
        TransmissionMeta {
            name: self.name.clone(),
            offset: self.next_position(),
            count: self.remaining(),
            initial: self.transferred == 0,
            exit: false,
            params: Default::default(),
            policy: self.policy as i32,
            error: String::new(),
        }
    }

    /// The receiving state of this unit, as reported to a supplier when resuming.
    pub fn state(&self) -> TransmissionMeta {
        TransmissionMeta {
            name: self.name.clone(),
            offset: self.next_position(),
            count: self.count,
            initial: self.transferred == 0,
            exit: false,
            params: Default::default(),
            policy: self.policy as i32,
            error: String::new(),
        }
    }

    /// Check that the given header continues this unit exactly where it left off.
    pub fn check_header(&self, meta: &TransmissionMeta) -> GridResult<()> {
        if meta.name != self.name {
            return Err(GridError::Protocol(format!(
                "attempt to load different unit [name={}, meta={}]",
                self.name, meta.name
            )));
        }
        if meta.offset != self.next_position() {
            return Err(GridError::Protocol(format!(
                "the next segment offset is incorrect [start={}, transferred={}, meta offset={}]",
                self.start_position, self.transferred, meta.offset
            )));
        }
        if meta.count.checked_add(self.transferred) != Some(self.count) {
            return Err(GridError::Protocol(format!(
                "the count of bytes for the next segment is incorrect [total={}, transferred={}, meta count={}]",
                self.count, self.transferred, meta.count
            )));
        }
        Ok(())
    }
}
