//! The supplying side of partition transfers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::cluster::gate::ClusterGate;
use crate::config::Config;
use crate::error::{GridError, GridResult};
use crate::models::{TransferRequest, TransmissionMeta};
use crate::storage::{partition_unit_name, PartitionStore};
use crate::transfer::channel::TransferChannel;
use crate::transfer::{METRIC_SESSIONS_SERVED, PARAM_ERROR_KIND, PARAM_ERROR_KIND_CORRUPTED};

/// A server accepting transfer connections from demanding peers.
pub struct TransferServer {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The cluster state gate.
    gate: ClusterGate,
    /// The storage backend holding the data to supply.
    store: Arc<dyn PartitionStore>,
    /// The bound listener.
    listener: TcpListener,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl TransferServer {
    /// Create a new instance, binding to the configured server port.
    pub async fn new(config: Arc<Config>, gate: ClusterGate, store: Arc<dyn PartitionStore>, shutdown: broadcast::Sender<()>) -> Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("error binding transfer server to {}", addr))?;
        metrics::register_counter!(METRIC_SESSIONS_SERVED, metrics::Unit::Count, "the number of transfer sessions served to peers");
        Ok(Self {
            config,
            gate,
            store,
            listener,
            shutdown_rx: BroadcastStream::new(shutdown.subscribe()),
        })
    }

    /// The local address of the bound listener.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("error reading transfer server address")
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!(port = self.config.server_port, "transfer server has started");

        loop {
            tokio::select! {
                res = self.listener.accept() => match res {
                    Ok((stream, peer)) => self.handle_connection(stream, peer),
                    Err(err) => tracing::error!(error = ?err, "error accepting transfer connection"),
                },
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("transfer server has shutdown");
        Ok(())
    }

    fn handle_connection(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        if let Err(err) = stream.set_nodelay(true) {
            tracing::warn!(error = ?err, %peer, "error setting nodelay on transfer connection");
        }
        let (gate, store, cap) = (self.gate.clone(), self.store.clone(), self.config.transfer_chunk_size);
        tokio::spawn(async move {
            match serve_connection(stream, gate, store, cap).await {
                Ok(()) => (),
                Err(GridError::Cancelled) => tracing::debug!(%peer, "transfer session to peer was cancelled"),
                Err(err) => tracing::warn!(error = %err, %peer, "error serving transfer session"),
            }
        });
    }
}

/// Serve one transfer session over the given connection.
///
/// Every unit of the requested partition which the peer does not already hold is sent from the
/// offset reported in the request, followed by the exit marker. Failures are reported to the
/// peer as an error meta when the connection still allows it.
#[tracing::instrument(level = "debug", skip(io, gate, store))]
pub async fn serve_connection<S>(io: S, gate: ClusterGate, store: Arc<dyn PartitionStore>, segment_cap: usize) -> GridResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut channel = TransferChannel::new(io, segment_cap);
    let request = channel.read_request().await?;
    metrics::increment_counter!(METRIC_SESSIONS_SERVED);
    tracing::debug!(
        session = %request.session_id,
        partition = request.partition,
        requester = %request.requester,
        version = request.baseline_version,
        "serving transfer session"
    );

    let res = supply(&mut channel, &request, &gate, store.as_ref()).await;
    match res {
        Ok(()) => channel.write_meta(&TransmissionMeta::exit_marker()).await,
        Err(err) => {
            let mut meta = TransmissionMeta::failure(&err);
            if let GridError::Corrupted(_) = &err {
                meta.name = partition_unit_name(request.partition);
                meta.params.insert(PARAM_ERROR_KIND.into(), PARAM_ERROR_KIND_CORRUPTED.into());
            }
            if let Err(write_err) = channel.write_meta(&meta).await {
                tracing::debug!(error = %write_err, "could not report transfer failure to peer");
            }
            Err(err)
        }
    }
}

/// Send the units of the requested partition.
async fn supply<S>(channel: &mut TransferChannel<S>, request: &TransferRequest, gate: &ClusterGate, store: &dyn PartitionStore) -> GridResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let snapshot = gate.snapshot();
    if !snapshot.state.permits_read() {
        return Err(GridError::Activation(format!("cluster is {}, partition data can not be read", snapshot.state)));
    }
    if request.baseline_version < snapshot.baseline.version {
        tracing::debug!(
            requested = request.baseline_version,
            current = snapshot.baseline.version,
            "rejecting transfer request for a stale baseline"
        );
        return Err(GridError::Cancelled);
    }

    let resume: HashMap<&str, &TransmissionMeta> = request.resume.iter().map(|meta| (meta.name.as_str(), meta)).collect();
    let name = partition_unit_name(request.partition);
    let offset = match resume.get(name.as_str()) {
        Some(state) if state.offset >= state.count => return Ok(()),
        Some(state) => state.offset,
        None => 0,
    };
    let mut unit = match store.open_for_read(request.partition, offset).await? {
        Some(unit) => unit,
        None => return Ok(()),
    };

    let (gate, version) = (gate.clone(), request.baseline_version);
    let stop = move || {
        let snapshot = gate.snapshot();
        !snapshot.state.permits_read() || snapshot.baseline.version > version
    };
    let res = channel.send_unit(&mut unit, &stop).await;
    unit.close().await;
    res
}
