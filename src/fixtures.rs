use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::prelude::*;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::cluster::{ClusterGate, ClusterState};
use crate::config::Config;
use crate::database::Database;
use crate::error::{GridError, GridResult};
use crate::storage::PartitionStore;
use crate::transfer::{serve_connection, BoxStream, TransferConnector};
use crate::NodeId;

/// Build a set of node IDs from the given strs.
pub fn nodes(ids: &[&str]) -> BTreeSet<NodeId> {
    ids.iter().map(|id| id.to_string()).collect()
}

/// Generate a buffer of random bytes.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

/// Build a test config for the given node.
pub fn test_config(node_id: &str) -> Result<(Arc<Config>, TempDir)> {
    let (config, tmpdir) = Config::new_test()?;
    let mut config = (*config).clone();
    config.node_id = node_id.into();
    Ok((Arc::new(config), tmpdir))
}

/// Open a cluster gate for the given node backed by a temporary metastore.
pub async fn test_gate(node_id: &str) -> Result<(ClusterGate, Database, TempDir)> {
    let (config, tmpdir) = test_config(node_id)?;
    let db = Database::new(config.clone()).await.context("error opening test database")?;
    let gate = ClusterGate::new(&config, &db).await.context("error opening test gate")?;
    Ok((gate, db, tmpdir))
}

/// Open a cluster gate for the given node which is active with the given baseline as version 1.
pub async fn active_gate(node_id: &str, baseline: &[&str]) -> Result<(ClusterGate, Database, TempDir)> {
    let (gate, db, tmpdir) = test_gate(node_id).await?;
    gate.set_state(ClusterState::Active, &nodes(baseline))
        .await
        .context("error activating test gate")?;
    Ok((gate, db, tmpdir))
}

/// A node supplying partition data to a `DuplexConnector`.
#[derive(Clone)]
pub struct Supplier {
    pub gate: ClusterGate,
    pub store: Arc<dyn PartitionStore>,
}

/// A connector serving each connection from an in-process supplier over an in-memory pipe.
///
/// Read budgets may be queued to make the next connections fail after reading a given number
/// of bytes.
#[derive(Default)]
pub struct DuplexConnector {
    suppliers: HashMap<NodeId, Supplier>,
    segment_cap: usize,
    budgets: Mutex<VecDeque<Option<u64>>>,
    connects: AtomicUsize,
}

impl DuplexConnector {
    pub fn new(segment_cap: usize) -> Self {
        Self {
            segment_cap,
            ..Default::default()
        }
    }

    pub fn with_supplier(mut self, node: &str, supplier: Supplier) -> Self {
        self.suppliers.insert(node.into(), supplier);
        self
    }

    /// Make the next connection fail once it has read `budget` bytes.
    pub fn push_read_budget(&self, budget: Option<u64>) {
        if let Ok(mut budgets) = self.budgets.lock() {
            budgets.push_back(budget);
        }
    }

    /// The number of connections opened so far.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransferConnector for DuplexConnector {
    async fn connect(&self, node: &NodeId) -> GridResult<BoxStream> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let supplier = self
            .suppliers
            .get(node)
            .cloned()
            .ok_or_else(|| GridError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, format!("unknown node {}", node))))?;
        let budget = self.budgets.lock().ok().and_then(|mut budgets| budgets.pop_front()).flatten();
        let (client, server) = tokio::io::duplex(64 * 1024);
        let segment_cap = self.segment_cap;
        tokio::spawn(async move {
            let _ = serve_connection(server, supplier.gate, supplier.store, segment_cap).await;
        });
        Ok(Box::new(FlakyStream::new(client, budget)))
    }
}

/// A stream which fails its reads once a given number of bytes has been read.
pub struct FlakyStream<S> {
    inner: S,
    read_budget: Option<u64>,
}

impl<S> FlakyStream<S> {
    pub fn new(inner: S, read_budget: Option<u64>) -> Self {
        Self { inner, read_budget }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for FlakyStream<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let budget = match this.read_budget {
            None => return Pin::new(&mut this.inner).poll_read(cx, buf),
            Some(0) => return Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "injected connection failure"))),
            Some(budget) => budget,
        };
        let max = (budget as usize).min(buf.remaining());
        let mut limited = ReadBuf::new(buf.initialize_unfilled_to(max));
        futures::ready!(Pin::new(&mut this.inner).poll_read(cx, &mut limited))?;
        let read = limited.filled().len();
        buf.advance(read);
        this.read_budget = Some(budget - read as u64);
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for FlakyStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
