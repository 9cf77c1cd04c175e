//! Baseline topology management.
//!
//! The baseline is the set of nodes which own partition data. It changes only through explicit
//! commands, or through auto-adjust: when enabled, every change of the live node set arms a
//! single-shot timer, a further change before it fires re-arms it, and once it fires the live
//! node set becomes the new baseline.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use arc_swap::ArcSwapOption;
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::cluster::gate::{ClusterGate, ClusterSnapshot};
use crate::cluster::topology::TopologyAuthority;
use crate::error::{GridError, GridResult};
use crate::models::{AutoAdjustRecord, BaselineRecord};
use crate::utils;
use crate::NodeId;

/// A far-off deadline used for the disarmed auto-adjust timer.
const DISARMED_DELAY: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// An immutable snapshot of the baseline topology.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BaselineTopology {
    /// The version of this baseline, strictly increasing across changes.
    pub version: u64,
    /// The IDs of the nodes of this baseline.
    pub nodes: BTreeSet<NodeId>,
    /// The unix timestamp in seconds of when this baseline was installed.
    pub created_at: i64,
}

impl BaselineTopology {
    /// The initial empty baseline of a fresh cluster.
    pub fn initial() -> Self {
        Self {
            version: 0,
            nodes: BTreeSet::new(),
            created_at: 0,
        }
    }

    /// Create a new baseline installed now.
    pub fn new(version: u64, nodes: BTreeSet<NodeId>) -> Self {
        Self {
            version,
            nodes,
            created_at: utils::unix_timestamp(),
        }
    }

    /// Check if this is the initial empty baseline.
    pub fn is_initial(&self) -> bool {
        self.version == 0 && self.nodes.is_empty()
    }

    /// Check if the given node is part of this baseline.
    pub fn contains(&self, node: &str) -> bool {
        self.nodes.contains(node)
    }
}

impl From<BaselineRecord> for BaselineTopology {
    fn from(record: BaselineRecord) -> Self {
        Self {
            version: record.version,
            nodes: record.nodes.into_iter().collect(),
            created_at: record.created_at,
        }
    }
}

impl From<&BaselineTopology> for BaselineRecord {
    fn from(baseline: &BaselineTopology) -> Self {
        Self {
            version: baseline.version,
            nodes: baseline.nodes.iter().cloned().collect(),
            created_at: baseline.created_at,
        }
    }
}

/// The baseline auto-adjust settings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AutoAdjustSettings {
    pub enabled: bool,
    /// The quiet period in millis after the last live node set change before adjusting.
    pub timeout_ms: u64,
}

impl AutoAdjustSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl From<AutoAdjustRecord> for AutoAdjustSettings {
    fn from(record: AutoAdjustRecord) -> Self {
        Self {
            enabled: record.enabled,
            timeout_ms: record.timeout_ms,
        }
    }
}

impl From<AutoAdjustSettings> for AutoAdjustRecord {
    fn from(settings: AutoAdjustSettings) -> Self {
        Self {
            enabled: settings.enabled,
            timeout_ms: settings.timeout_ms,
        }
    }
}

/// The state of the auto-adjust task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AutoAdjustTaskState {
    /// No adjustment is scheduled.
    Idle,
    /// An adjustment is scheduled and has not yet fired.
    InProgress,
}

/// The observable status of baseline auto-adjust.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AutoAdjustStatus {
    /// The time remaining until the scheduled adjustment, if any.
    pub time_until_adjust: Option<Duration>,
    pub task_state: AutoAdjustTaskState,
}

/// A handle to the baseline topology manager.
#[derive(Clone)]
pub struct BaselineManager {
    gate: ClusterGate,
    topology: Arc<dyn TopologyAuthority>,
    requests_tx: mpsc::Sender<AutoAdjustMsg>,
    /// The deadline of the armed auto-adjust timer.
    deadline: Arc<ArcSwapOption<Instant>>,
}

impl BaselineManager {
    /// Create a new instance, along with its auto-adjust controller which must be spawned.
    pub fn new(gate: ClusterGate, topology: Arc<dyn TopologyAuthority>, shutdown: broadcast::Sender<()>) -> (Self, AutoAdjustCtl) {
        let (requests_tx, requests_rx) = mpsc::channel(100);
        let deadline = Arc::new(ArcSwapOption::empty());
        let ctl = AutoAdjustCtl {
            gate: gate.clone(),
            topology: topology.clone(),
            live_rx: topology.subscribe(),
            snapshot_rx: gate.subscribe(),
            requests_rx: ReceiverStream::new(requests_rx),
            shutdown_rx: BroadcastStream::new(shutdown.subscribe()),
            deadline: deadline.clone(),
            armed: false,
        };
        let handle = Self {
            gate,
            topology,
            requests_tx,
            deadline,
        };
        (handle, ctl)
    }

    /// The current baseline topology.
    pub fn current_baseline(&self) -> Arc<BaselineTopology> {
        self.gate.baseline()
    }

    /// Install the given node set as the new baseline.
    ///
    /// Any pending auto-adjust is cancelled first.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn set_baseline(&self, nodes: BTreeSet<NodeId>) -> GridResult<Arc<BaselineTopology>> {
        self.disarm().await;
        self.gate.set_baseline(nodes).await
    }

    /// Add the given live nodes to the baseline.
    pub async fn add_baseline_nodes(&self, ids: &[NodeId]) -> GridResult<Arc<BaselineTopology>> {
        let live = self.topology.live_nodes();
        if let Some(missing) = ids.iter().find(|id| !live.contains(*id)) {
            return Err(GridError::InvalidInput(format!("node not found for consistent ID: {}", missing)));
        }
        let mut nodes = self.current_baseline().nodes.clone();
        nodes.extend(ids.iter().cloned());
        self.set_baseline(nodes).await
    }

    /// Remove the given nodes from the baseline.
    pub async fn remove_baseline_nodes(&self, ids: &[NodeId]) -> GridResult<Arc<BaselineTopology>> {
        let mut nodes = self.current_baseline().nodes.clone();
        if let Some(missing) = ids.iter().find(|id| !nodes.contains(*id)) {
            return Err(GridError::InvalidInput(format!("node {} is not part of the baseline topology", missing)));
        }
        for id in ids {
            nodes.remove(id);
        }
        self.set_baseline(nodes).await
    }

    /// The current auto-adjust settings.
    pub fn auto_adjust_settings(&self) -> AutoAdjustSettings {
        self.gate.auto_adjust()
    }

    /// Update the auto-adjust settings, disarming any pending adjustment when disabled.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn set_auto_adjust(&self, settings: AutoAdjustSettings) -> GridResult<()> {
        self.gate.set_auto_adjust(settings).await?;
        if !settings.enabled {
            self.disarm().await;
        }
        Ok(())
    }

    /// The current auto-adjust status.
    pub fn auto_adjust_status(&self) -> AutoAdjustStatus {
        match self.deadline.load_full() {
            Some(deadline) => AutoAdjustStatus {
                time_until_adjust: Some(deadline.saturating_duration_since(Instant::now())),
                task_state: AutoAdjustTaskState::InProgress,
            },
            None => AutoAdjustStatus {
                time_until_adjust: None,
                task_state: AutoAdjustTaskState::Idle,
            },
        }
    }

    /// Disarm any pending auto-adjust, waiting for the controller to acknowledge.
    async fn disarm(&self) {
        let (tx, rx) = oneshot::channel();
        if self.requests_tx.send(AutoAdjustMsg::Disarm { tx }).await.is_err() {
            self.deadline.store(None);
            return;
        }
        let _ = rx.await;
    }
}

/// A message bound for the auto-adjust controller.
#[derive(Debug)]
pub enum AutoAdjustMsg {
    /// Disarm any pending adjustment.
    Disarm { tx: oneshot::Sender<()> },
}

/// A controller driving baseline auto-adjust.
pub struct AutoAdjustCtl {
    gate: ClusterGate,
    topology: Arc<dyn TopologyAuthority>,
    live_rx: watch::Receiver<BTreeSet<NodeId>>,
    snapshot_rx: watch::Receiver<Arc<ClusterSnapshot>>,
    requests_rx: ReceiverStream<AutoAdjustMsg>,
    shutdown_rx: BroadcastStream<()>,
    /// The deadline of the armed timer, shared with handles for status queries.
    deadline: Arc<ArcSwapOption<Instant>>,
    /// True while the timer is armed.
    armed: bool,
}

impl AutoAdjustCtl {
    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!("baseline auto-adjust controller has started");
        let timer = tokio::time::sleep(DISARMED_DELAY);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                res = self.live_rx.changed() => match res {
                    Ok(()) => self.handle_live_change(timer.as_mut()),
                    Err(_) => break,
                },
                res = self.snapshot_rx.changed() => match res {
                    Ok(()) => self.handle_snapshot_change(),
                    Err(_) => break,
                },
                Some(msg) = self.requests_rx.next() => match msg {
                    AutoAdjustMsg::Disarm { tx } => {
                        self.disarm();
                        let _ = tx.send(());
                    }
                },
                _ = &mut timer, if self.armed => self.fire().await,
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("baseline auto-adjust controller has shutdown");
        Ok(())
    }

    /// Handle a change of the live node set, re-arming the timer if an adjustment is needed.
    #[tracing::instrument(level = "trace", skip(self, timer))]
    fn handle_live_change(&mut self, timer: std::pin::Pin<&mut tokio::time::Sleep>) {
        let live = self.live_rx.borrow().clone();
        let (settings, snapshot) = (self.gate.auto_adjust(), self.gate.snapshot());
        if !settings.enabled || !snapshot.state.is_active() || live == snapshot.baseline.nodes {
            self.disarm();
            return;
        }
        let deadline = Instant::now() + settings.timeout();
        timer.reset(deadline);
        self.deadline.store(Some(Arc::new(deadline)));
        self.armed = true;
        tracing::debug!(timeout_ms = settings.timeout_ms, ?live, "baseline auto-adjust armed");
    }

    /// Handle a newly published cluster snapshot, disarming the timer if it became moot.
    fn handle_snapshot_change(&mut self) {
        if !self.armed {
            return;
        }
        let snapshot = self.snapshot_rx.borrow().clone();
        if !snapshot.state.is_active() || self.topology.live_nodes() == snapshot.baseline.nodes {
            self.disarm();
        }
    }

    fn disarm(&mut self) {
        if self.armed {
            tracing::debug!("baseline auto-adjust disarmed");
        }
        self.armed = false;
        self.deadline.store(None);
    }

    /// Commit the live node set as the new baseline.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn fire(&mut self) {
        self.disarm();
        let live = self.topology.live_nodes();
        if live == self.gate.baseline().nodes {
            return;
        }
        match self.gate.set_baseline(live).await {
            Ok(baseline) => tracing::info!(version = baseline.version, nodes = ?baseline.nodes, "baseline auto-adjusted"),
            Err(err) => tracing::error!(error = %err, "error auto-adjusting baseline"),
        }
    }
}
