//! Transfer peer connectivity.

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::{GridError, GridResult};
use crate::NodeId;

/// A bidirectional byte stream to a transfer peer.
pub trait TransferStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> TransferStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// A boxed transfer stream.
pub type BoxStream = Box<dyn TransferStream>;

/// A type which is able to open transfer connections to the supplier of a given node.
#[async_trait]
pub trait TransferConnector: Send + Sync {
    /// Open a new connection to the transfer server of the given node.
    async fn connect(&self, node: &NodeId) -> GridResult<BoxStream>;
}

/// A connector which reaches peers over TCP using statically configured addresses.
#[derive(Clone, Debug, Default)]
pub struct TcpConnector {
    peers: BTreeMap<NodeId, SocketAddr>,
}

impl TcpConnector {
    /// Create a new instance.
    pub fn new(peers: BTreeMap<NodeId, SocketAddr>) -> Self {
        Self { peers }
    }
}

#[async_trait]
impl TransferConnector for TcpConnector {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn connect(&self, node: &NodeId) -> GridResult<BoxStream> {
        let addr = self.peers.get(node).ok_or_else(|| {
            GridError::Io(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no transfer address known for node {}", node),
            ))
        })?;
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
