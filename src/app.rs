use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::cluster::{BaselineManager, ClusterGate, ClusterState, GridCluster, LiveTopology, TopologyAuthority};
use crate::config::Config;
use crate::database::Database;
use crate::rebalance::RebalanceCoordinator;
use crate::storage::{FilePartitionStore, PartitionStore};
use crate::transfer::{self, TcpConnector, TransferConnector, TransferServer};

/// The application object for when Tessera is running as a server.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// The application's database system.
    _db: Database,
    /// The live node set of the cluster.
    _topology: LiveTopology,
    /// The operator surface of the grid.
    cluster: GridCluster,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the baseline auto-adjust controller.
    auto_adjust_handle: JoinHandle<Result<()>>,
    /// The join handle of the rebalance coordinator.
    rebalance_handle: JoinHandle<Result<()>>,
    /// The join handle of the transfer server.
    transfer_server: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(10);

        // Initialize this node's storage & recover cluster state.
        let db = Database::new(config.clone()).await.context("error opening database")?;
        let gate = ClusterGate::new(&config, &db).await.context("error recovering cluster state")?;
        let store: Arc<dyn PartitionStore> = Arc::new(FilePartitionStore::new(db.partitions_dir()));
        transfer::register_metrics();

        // The live node set starts out as this node along with its statically known peers.
        let topology = LiveTopology::new(config.peer_addrs.keys().cloned().chain(std::iter::once(config.node_id.clone())));
        let authority: Arc<dyn TopologyAuthority> = Arc::new(topology.clone());

        // Spawn various core tasks.
        let (baseline, auto_adjust) = BaselineManager::new(gate.clone(), authority.clone(), shutdown_tx.clone());
        let auto_adjust_handle = auto_adjust.spawn();

        let connector: Arc<dyn TransferConnector> = Arc::new(TcpConnector::new(config.peer_addrs.clone()));
        let (coordinator, rebalance) = RebalanceCoordinator::new(config.clone(), gate.clone(), store.clone(), connector, shutdown_tx.clone());
        let rebalance_handle = coordinator.spawn();

        let transfer_server = TransferServer::new(config.clone(), gate.clone(), store, shutdown_tx.clone())
            .await
            .context("error setting up transfer server")?
            .spawn();

        let cluster = GridCluster::new(gate, baseline, authority, rebalance);
        if config.activate_on_start {
            cluster
                .set_state(ClusterState::Active)
                .await
                .context("error activating cluster on start")?;
        }

        Ok(Self {
            _config: config,
            _db: db,
            _topology: topology,
            cluster,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            auto_adjust_handle,
            rebalance_handle,
            transfer_server,
        })
    }

    /// The operator surface of the grid.
    pub fn cluster(&self) -> &GridCluster {
        &self.cluster
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!(state = %self.cluster.get_state(), "Tessera is shutting down");
        if let Err(err) = self.transfer_server.await.context("error joining transfer server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down transfer server");
        }
        if let Err(err) = self.rebalance_handle.await.context("error joining rebalance coordinator handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down rebalance coordinator");
        }
        if let Err(err) = self.auto_adjust_handle.await.context("error joining auto-adjust controller handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down auto-adjust controller");
        }

        tracing::debug!("Tessera shutdown complete");
        Ok(())
    }
}
