//! The cluster state gate.
//!
//! The gate holds the authoritative activation state and baseline topology of the node. Reads go
//! through an atomically swapped snapshot and never block. Every change goes through a single
//! async mutex, is persisted to the metastore, then swapped in and published to subscribers.

use std::collections::BTreeSet;
use std::io;
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use sled::Tree;
use tokio::sync::{watch, Mutex};

use crate::cluster::baseline::{AutoAdjustSettings, BaselineTopology};
use crate::cluster::state::ClusterState;
use crate::config::Config;
use crate::database::Database;
use crate::error::{GridError, GridResult, ShutdownError, ERR_DB_FLUSH, ERR_INACTIVE_BASELINE};
use crate::models::{AutoAdjustRecord, BaselineRecord, ClusterStateKind, ClusterStateRecord};
use crate::utils;
use crate::NodeId;

/// The metastore key of the cluster activation state.
pub const KEY_CLUSTER_STATE: &[u8] = b"cluster_state";
/// The metastore key of the baseline topology.
pub const KEY_BASELINE: &[u8] = b"baseline";
/// The metastore key of the auto-adjust settings.
pub const KEY_AUTO_ADJUST: &[u8] = b"auto_adjust";

const METRIC_BASELINE_VERSION: &str = "tessera_baseline_version";
const METRIC_CLUSTER_ACTIVE: &str = "tessera_cluster_active";

/// A consistent view of the activation state and baseline topology.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterSnapshot {
    pub state: ClusterState,
    pub baseline: Arc<BaselineTopology>,
}

/// The authoritative holder of cluster state.
#[derive(Clone)]
pub struct ClusterGate {
    inner: Arc<GateInner>,
}

struct GateInner {
    /// The metastore tree.
    tree: Tree,
    /// The current snapshot.
    snapshot: ArcSwap<ClusterSnapshot>,
    /// The current auto-adjust settings.
    auto_adjust: ArcSwap<AutoAdjustSettings>,
    /// The write gate serializing all changes.
    write_gate: Mutex<()>,
    /// The channel publishing new snapshots.
    snapshot_tx: watch::Sender<Arc<ClusterSnapshot>>,
    /// Kept so that publishing never fails for lack of receivers.
    _snapshot_rx: watch::Receiver<Arc<ClusterSnapshot>>,
}

impl ClusterGate {
    /// Create a new instance, recovering any persisted state.
    pub async fn new(config: &Config, db: &Database) -> Result<Self> {
        let tree = db.get_metastore_tree().await?;
        let recovered = recover_cluster_state(tree.clone()).await?;
        let auto_adjust = recovered.auto_adjust.unwrap_or(AutoAdjustSettings {
            enabled: config.baseline_auto_adjust_enabled,
            timeout_ms: config.baseline_auto_adjust_timeout_ms,
        });
        tracing::debug!(
            state = %recovered.state,
            version = recovered.baseline.version,
            nodes = ?recovered.baseline.nodes,
            "recovered cluster state"
        );

        metrics::register_gauge!(METRIC_BASELINE_VERSION, metrics::Unit::Count, "the version of the current baseline topology");
        metrics::register_gauge!(METRIC_CLUSTER_ACTIVE, metrics::Unit::Count, "1 if the cluster permits reads, else 0");
        let snapshot = Arc::new(ClusterSnapshot {
            state: recovered.state,
            baseline: Arc::new(recovered.baseline),
        });
        record_snapshot_metrics(&snapshot);
        let (snapshot_tx, snapshot_rx) = watch::channel(snapshot.clone());
        Ok(Self {
            inner: Arc::new(GateInner {
                tree,
                snapshot: ArcSwap::new(snapshot),
                auto_adjust: ArcSwap::from_pointee(auto_adjust),
                write_gate: Mutex::new(()),
                snapshot_tx,
                _snapshot_rx: snapshot_rx,
            }),
        })
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<ClusterSnapshot> {
        self.inner.snapshot.load_full()
    }

    /// The current activation state.
    pub fn state(&self) -> ClusterState {
        self.inner.snapshot.load().state
    }

    /// The current baseline topology.
    pub fn baseline(&self) -> Arc<BaselineTopology> {
        self.inner.snapshot.load().baseline.clone()
    }

    /// The current auto-adjust settings.
    pub fn auto_adjust(&self) -> AutoAdjustSettings {
        **self.inner.auto_adjust.load()
    }

    /// Subscribe to published snapshots.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ClusterSnapshot>> {
        self.inner.snapshot_tx.subscribe()
    }

    /// Fail unless the cluster permits partition reads.
    pub fn ensure_read(&self) -> GridResult<()> {
        let state = self.state();
        if state.permits_read() {
            Ok(())
        } else {
            Err(GridError::Activation(format!("cluster is {}, reads are not permitted", state)))
        }
    }

    /// Fail unless the cluster permits partition writes.
    pub fn ensure_write(&self) -> GridResult<()> {
        let state = self.state();
        if state.permits_write() {
            Ok(())
        } else {
            Err(GridError::Activation(format!("cluster is {}, writes are not permitted", state)))
        }
    }

    /// Move the cluster to the given activation state.
    ///
    /// Requesting the current state is a no-op. Activating a cluster which still has the initial
    /// empty baseline installs the given live nodes as its first baseline. With no live nodes the
    /// initial baseline is kept.
    #[tracing::instrument(level = "debug", skip(self, live_nodes))]
    pub async fn set_state(&self, target: ClusterState, live_nodes: &BTreeSet<NodeId>) -> GridResult<Arc<ClusterSnapshot>> {
        let _guard = self.inner.write_gate.lock().await;
        let current = self.snapshot();
        if current.state == target {
            return Ok(current);
        }

        let mut baseline = current.baseline.clone();
        let mut batch = sled::Batch::default();
        if target.is_active() && baseline.is_initial() && !live_nodes.is_empty() {
            baseline = Arc::new(BaselineTopology::new(1, live_nodes.clone()));
            batch.insert(KEY_BASELINE, encode(&BaselineRecord::from(baseline.as_ref()))?);
        }
        let record = ClusterStateRecord {
            state: ClusterStateKind::from(target) as i32,
        };
        batch.insert(KEY_CLUSTER_STATE, encode(&record)?);
        self.apply_batch(batch).await?;

        tracing::info!(from = %current.state, to = %target, "cluster state changed");
        Ok(self.publish(ClusterSnapshot { state: target, baseline }))
    }

    /// Install the given node set as the new baseline, with the next version.
    ///
    /// An empty node set is a valid baseline which owns no partitions.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn set_baseline(&self, nodes: BTreeSet<NodeId>) -> GridResult<Arc<BaselineTopology>> {
        let _guard = self.inner.write_gate.lock().await;
        let current = self.snapshot();
        if !current.state.is_active() {
            return Err(GridError::Activation(ERR_INACTIVE_BASELINE.into()));
        }

        let baseline = Arc::new(BaselineTopology::new(current.baseline.version + 1, nodes));
        let mut batch = sled::Batch::default();
        batch.insert(KEY_BASELINE, encode(&BaselineRecord::from(baseline.as_ref()))?);
        self.apply_batch(batch).await?;

        tracing::info!(version = baseline.version, nodes = ?baseline.nodes, "baseline topology changed");
        self.publish(ClusterSnapshot {
            state: current.state,
            baseline: baseline.clone(),
        });
        Ok(baseline)
    }

    /// Persist the given auto-adjust settings.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn set_auto_adjust(&self, settings: AutoAdjustSettings) -> GridResult<()> {
        let _guard = self.inner.write_gate.lock().await;
        let mut batch = sled::Batch::default();
        batch.insert(KEY_AUTO_ADJUST, encode(&AutoAdjustRecord::from(settings))?);
        self.apply_batch(batch).await?;
        self.inner.auto_adjust.store(Arc::new(settings));
        Ok(())
    }

    /// Swap in and publish the given snapshot. Must be called under the write gate.
    fn publish(&self, snapshot: ClusterSnapshot) -> Arc<ClusterSnapshot> {
        let snapshot = Arc::new(snapshot);
        self.inner.snapshot.store(snapshot.clone());
        record_snapshot_metrics(&snapshot);
        let _ = self.inner.snapshot_tx.send(snapshot.clone());
        snapshot
    }

    /// Durably apply the given batch to the metastore.
    async fn apply_batch(&self, batch: sled::Batch) -> GridResult<()> {
        let tree = self.inner.tree.clone();
        Database::spawn_blocking(move || -> Result<()> {
            tree.apply_batch(batch).context("error applying cluster state batch")?;
            tree.flush().context(ERR_DB_FLUSH)?;
            Ok(())
        })
        .await
        .map_err(|err| storage_error(err.0))?
        .map_err(storage_error)
    }
}

fn record_snapshot_metrics(snapshot: &ClusterSnapshot) {
    metrics::gauge!(METRIC_BASELINE_VERSION, snapshot.baseline.version as f64);
    let active = if snapshot.state.is_active() { 1.0 } else { 0.0 };
    metrics::gauge!(METRIC_CLUSTER_ACTIVE, active);
}

fn encode<M: prost::Message>(model: &M) -> GridResult<Vec<u8>> {
    utils::encode_model(model).map_err(storage_error)
}

fn storage_error(err: anyhow::Error) -> GridError {
    GridError::Io(io::Error::new(io::ErrorKind::Other, format!("{:#}", err)))
}

/// Cluster state recovered from the metastore.
#[derive(Debug)]
struct RecoveredClusterState {
    state: ClusterState,
    baseline: BaselineTopology,
    /// The persisted auto-adjust settings, if any were ever set.
    auto_adjust: Option<AutoAdjustSettings>,
}

/// Recover the persisted cluster state, defaulting to an inactive cluster with the initial
/// baseline.
async fn recover_cluster_state(tree: Tree) -> Result<RecoveredClusterState> {
    Database::spawn_blocking(move || -> Result<RecoveredClusterState> {
        let state = match tree.get(KEY_CLUSTER_STATE).context("error fetching cluster state")? {
            Some(bytes) => {
                let record: ClusterStateRecord = utils::decode_model(&bytes).context("error decoding cluster state")?;
                ClusterStateKind::from_i32(record.state)
                    .map(ClusterState::from)
                    .with_context(|| format!("unknown cluster state value {}", record.state))?
            }
            None => ClusterState::Inactive,
        };
        let baseline = match tree.get(KEY_BASELINE).context("error fetching baseline topology")? {
            Some(bytes) => {
                let record: BaselineRecord = utils::decode_model(&bytes).context("error decoding baseline topology")?;
                BaselineTopology::from(record)
            }
            None => BaselineTopology::initial(),
        };
        let auto_adjust = match tree.get(KEY_AUTO_ADJUST).context("error fetching auto-adjust settings")? {
            Some(bytes) => {
                let record: AutoAdjustRecord = utils::decode_model(&bytes).context("error decoding auto-adjust settings")?;
                Some(AutoAdjustSettings::from(record))
            }
            None => None,
        };
        Ok(RecoveredClusterState { state, baseline, auto_adjust })
    })
    .await
    .map_err(|err: ShutdownError| err.0)?
}
