//! Transfer channels.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::{GridError, GridResult};
use crate::models::{TransferRequest, TransmissionMeta};
use crate::transfer::meta::{read_frame, write_frame};
use crate::transfer::unit::ChunkIoUnit;
use crate::transfer::{METRIC_BYTES_RECEIVED, METRIC_BYTES_SENT};

/// A checker consulted at every segment boundary, returning `true` when the transfer must stop.
pub type StopCheck<'a> = &'a (dyn Fn() -> bool + Send + Sync);

/// A streaming channel which moves chunk I/O units over a single logical connection in
/// segments of at most `segment_cap` bytes.
pub struct TransferChannel<S> {
    /// The underlying connection.
    io: S,
    /// The segment buffer, sized to the segment cap.
    buf: Vec<u8>,
}

impl<S> TransferChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Create a new instance.
    pub fn new(io: S, segment_cap: usize) -> Self {
        Self {
            io,
            buf: vec![0u8; segment_cap.max(1)],
        }
    }

    /// The max number of bytes moved per segment.
    pub fn segment_cap(&self) -> usize {
        self.buf.len()
    }

    /// Send a session request to the supplying peer.
    pub async fn write_request(&mut self, request: &TransferRequest) -> GridResult<()> {
        write_frame(&mut self.io, request).await
    }

    /// Read a session request from the demanding peer.
    pub async fn read_request(&mut self) -> GridResult<TransferRequest> {
        read_frame(&mut self.io).await
    }

    /// Write a meta frame to the peer.
    pub async fn write_meta(&mut self, meta: &TransmissionMeta) -> GridResult<()> {
        write_frame(&mut self.io, meta).await
    }

    /// Read a meta frame from the peer.
    pub async fn read_meta(&mut self) -> GridResult<TransmissionMeta> {
        read_frame(&mut self.io).await
    }

    /// Send the remaining bytes of the given unit, preceded by its header.
    #[tracing::instrument(level = "trace", skip(self, unit, stop), fields(unit = %unit.name()))]
    pub async fn send_unit(&mut self, unit: &mut ChunkIoUnit, stop: StopCheck<'_>) -> GridResult<()> {
        self.write_meta(&unit.header()).await?;
        while !unit.is_complete() {
            if stop() {
                return Err(GridError::Cancelled);
            }
            let sent = unit.write_into(&mut self.io, &mut self.buf).await?;
            metrics::counter!(METRIC_BYTES_SENT, sent as u64);
        }
        self.io.flush().await?;
        Ok(())
    }

    /// Receive the bytes announced by `meta` into the given unit.
    ///
    /// The header must continue the unit exactly where it left off. On error the unit keeps the
    /// number of bytes which were durably handed to its target.
    #[tracing::instrument(level = "trace", skip(self, unit, meta, stop), fields(unit = %unit.name()))]
    pub async fn receive_unit(&mut self, unit: &mut ChunkIoUnit, meta: &TransmissionMeta, stop: StopCheck<'_>) -> GridResult<()> {
        unit.check_header(meta)?;
        unit.open().await?;
        while !unit.is_complete() {
            if stop() {
                return Err(GridError::Cancelled);
            }
            let read = unit.read_from(&mut self.io, &mut self.buf).await?;
            if read == 0 {
                return Err(GridError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "channel reached its end, but unit {} was not fully loaded [transferred={}, total={}]",
                        unit.name(),
                        unit.transferred(),
                        unit.count()
                    ),
                )));
            }
            metrics::counter!(METRIC_BYTES_RECEIVED, read as u64);
        }
        Ok(())
    }
}
