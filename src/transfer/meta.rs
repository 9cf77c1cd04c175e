//! Transfer wire framing.
//!
//! Every control frame is a u32 big-endian length followed by a prost encoded model. The
//! bytes of a unit follow its `TransmissionMeta` header unframed, exactly `count` of them.

use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{GridError, GridResult};
use crate::models::TransmissionMeta;
use crate::utils;

/// The max size of a control frame.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

impl TransmissionMeta {
    /// The meta marking the end of a session.
    pub fn exit_marker() -> Self {
        Self {
            exit: true,
            initial: true,
            ..Default::default()
        }
    }

    /// A meta reporting an error to the peer, which also ends the session.
    pub fn failure(error: impl ToString) -> Self {
        Self {
            exit: true,
            error: error.to_string(),
            ..Default::default()
        }
    }

    /// The error reported by the peer, if any.
    pub fn error_opt(&self) -> Option<&str> {
        if self.error.is_empty() {
            None
        } else {
            Some(self.error.as_str())
        }
    }
}

/// Write a length-prefixed model frame.
pub async fn write_frame<W, M>(writer: &mut W, model: &M) -> GridResult<()>
where
    W: AsyncWrite + Unpin + Send + ?Sized,
    M: Message,
{
    let bytes = utils::encode_model(model).map_err(|err| GridError::Protocol(err.to_string()))?;
    let len = u32::try_from(bytes.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or_else(|| GridError::Protocol(format!("frame of {} bytes exceeds the max frame size", bytes.len())))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-prefixed model frame.
pub async fn read_frame<R, M>(reader: &mut R) -> GridResult<M>
where
    R: AsyncRead + Unpin + Send + ?Sized,
    M: Message + Default,
{
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(GridError::Protocol(format!("frame of {} bytes exceeds the max frame size", len)));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    utils::decode_model(&buf).map_err(|err| GridError::Protocol(format!("{:#}", err)))
}
