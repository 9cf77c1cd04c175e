//! Rebalance coordinator.
//!
//! The coordinator reacts to published cluster snapshots. On a new baseline version it cancels
//! every session started for an older version and waits for them to stop, computes the partition
//! assignment delta, and starts one transfer task for every move which targets the local node.
//!
//! A transfer task owns the whole retry budget of its partition. A failed session is retried with
//! a new session at the same baseline version which resumes the failed session's units, after a
//! jittered exponential backoff. Cancelled sessions never consume the retry budget.


use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use arc_swap::ArcSwap;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::affinity::{Affinity, PartitionAssignmentDelta, PartitionMove};
use crate::cluster::baseline::BaselineTopology;
use crate::cluster::gate::{ClusterGate, ClusterSnapshot};
use crate::config::Config;
use crate::error::{GridError, GridResult};
use crate::storage::PartitionStore;
use crate::transfer::{CancelToken, SessionStatus, TransferConnector, TransferSession, VersionProbe};
use crate::NodeId;

const METRIC_SESSIONS_STARTED: &str = "tessera_rebalance_sessions_started";
const METRIC_SESSIONS_COMPLETED: &str = "tessera_rebalance_sessions_completed";
const METRIC_SESSIONS_CANCELLED: &str = "tessera_rebalance_sessions_cancelled";
const METRIC_SESSIONS_FAILED: &str = "tessera_rebalance_sessions_failed";
const METRIC_RUNNING_TRANSFERS: &str = "tessera_rebalance_running_transfers";
const METRIC_FAILED_PARTITIONS: &str = "tessera_rebalance_failed_partitions";

/// The ownership state of a local partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartitionOwnership {
    /// The partition's data is being received for the given baseline version.
    Moving { version: u64 },
    /// The partition's data is held locally.
    Owned,
}

/// Info on a running partition transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunningTransfer {
    pub partition: u32,
    pub source: NodeId,
    pub baseline_version: u64,
}

/// The observable state of the coordinator.
#[derive(Clone, Debug, Default)]
pub struct RebalanceStatus {
    /// The baseline version last processed.
    pub baseline_version: u64,
    pub ownership: BTreeMap<u32, PartitionOwnership>,
    pub running: Vec<RunningTransfer>,
    /// Partitions which exhausted their retry budget.
    pub failed: BTreeSet<u32>,
    /// Partitions which had conflicting assignments.
    pub conflicted: BTreeSet<u32>,
}

/// A message bound for the rebalance coordinator.
#[derive(Debug)]
pub enum RebalanceMsg {
    /// Process a baseline change between the given versions.
    BaselineChanged {
        old: Arc<BaselineTopology>,
        new: Arc<BaselineTopology>,
        tx: oneshot::Sender<GridResult<PartitionAssignmentDelta>>,
    },
}

/// A handle to the rebalance coordinator.
#[derive(Clone)]
pub struct RebalanceHandle {
    requests_tx: mpsc::Sender<RebalanceMsg>,
    status: Arc<ArcSwap<RebalanceStatus>>,
}

impl RebalanceHandle {
    /// Process the change from the `old` to the `new` baseline, returning the computed delta.
    pub async fn on_baseline_changed(&self, old: Arc<BaselineTopology>, new: Arc<BaselineTopology>) -> GridResult<PartitionAssignmentDelta> {
        let (tx, rx) = oneshot::channel();
        self.requests_tx
            .send(RebalanceMsg::BaselineChanged { old, new, tx })
            .await
            .map_err(|_| GridError::Cancelled)?;
        rx.await.map_err(|_| GridError::Cancelled)?
    }

    /// The current status of the coordinator.
    pub fn status(&self) -> Arc<RebalanceStatus> {
        self.status.load_full()
    }

    /// The partitions which could not be rebalanced.
    pub fn failed_partitions(&self) -> Vec<u32> {
        self.status.load().failed.iter().copied().collect()
    }

    /// The currently running partition transfers.
    pub fn running_sessions(&self) -> Vec<RunningTransfer> {
        self.status.load().running.clone()
    }

    /// The ownership state of local partitions.
    pub fn ownership(&self) -> BTreeMap<u32, PartitionOwnership> {
        self.status.load().ownership.clone()
    }

    /// Fail if any partition could not be rebalanced.
    pub fn check_rebalance(&self) -> GridResult<()> {
        let failed = self.failed_partitions();
        if failed.is_empty() {
            Ok(())
        } else {
            Err(GridError::RebalanceFailed(failed))
        }
    }
}

/// The final report of a partition transfer task.
#[derive(Debug)]
struct TransferReport {
    partition: u32,
    baseline_version: u64,
    status: SessionStatus,
    error: Option<GridError>,
}

/// A transfer task tracked by the coordinator.
struct TrackedTransfer {
    source: NodeId,
    baseline_version: u64,
    cancel: CancelToken,
}

/// Everything a transfer task needs to run its sessions.
#[derive(Clone)]
struct TransferCtx {
    local: NodeId,
    connector: Arc<dyn TransferConnector>,
    store: Arc<dyn PartitionStore>,
    probe: VersionProbe,
    segment_cap: usize,
    max_retries: u32,
    backoff: Duration,
}

/// A controller coordinating partition rebalancing for the local node.
pub struct RebalanceCoordinator {
    /// The application's runtime config.
    config: Arc<Config>,
    gate: ClusterGate,
    affinity: Affinity,
    ctx: TransferCtx,

    requests_rx: ReceiverStream<RebalanceMsg>,
    snapshot_rx: watch::Receiver<Arc<ClusterSnapshot>>,
    shutdown_rx: BroadcastStream<()>,

    /// Running transfer tasks, each resolving to its report even if the task panicked.
    tasks: FuturesUnordered<BoxFuture<'static, TransferReport>>,
    /// Running transfers by partition.
    transfers: HashMap<u32, TrackedTransfer>,
    /// The last processed baseline.
    processed: Arc<BaselineTopology>,
    /// True if the last observed state was active.
    active: bool,
    ownership: BTreeMap<u32, PartitionOwnership>,
    failed: BTreeSet<u32>,
    conflicted: BTreeSet<u32>,
    status: Arc<ArcSwap<RebalanceStatus>>,
}

impl RebalanceCoordinator {
    /// Create a new instance.
    pub fn new(
        config: Arc<Config>, gate: ClusterGate, store: Arc<dyn PartitionStore>, connector: Arc<dyn TransferConnector>, shutdown: broadcast::Sender<()>,
    ) -> (Self, RebalanceHandle) {
        metrics::register_counter!(METRIC_SESSIONS_STARTED, metrics::Unit::Count, "the number of transfer sessions started");
        metrics::register_counter!(METRIC_SESSIONS_COMPLETED, metrics::Unit::Count, "the number of transfer sessions completed");
        metrics::register_counter!(METRIC_SESSIONS_CANCELLED, metrics::Unit::Count, "the number of transfer sessions cancelled");
        metrics::register_counter!(METRIC_SESSIONS_FAILED, metrics::Unit::Count, "the number of transfer sessions failed");
        metrics::register_gauge!(METRIC_RUNNING_TRANSFERS, metrics::Unit::Count, "the number of running partition transfers");
        metrics::register_gauge!(METRIC_FAILED_PARTITIONS, metrics::Unit::Count, "the number of partitions which failed to rebalance");

        let affinity = Affinity::new(config.partitions, config.backups);
        let snapshot = gate.snapshot();
        let ownership = affinity
            .owned_by(&config.node_id, &snapshot.baseline.nodes)
            .into_iter()
            .map(|partition| (partition, PartitionOwnership::Owned))
            .collect();
        let probe_gate = gate.clone();
        let ctx = TransferCtx {
            local: config.node_id.clone(),
            connector,
            store,
            probe: Arc::new(move || probe_gate.baseline().version),
            segment_cap: config.transfer_chunk_size,
            max_retries: config.transfer_max_retries,
            backoff: config.transfer_retry_backoff(),
        };

        let (requests_tx, requests_rx) = mpsc::channel(100);
        let status = Arc::new(ArcSwap::from_pointee(RebalanceStatus::default()));
        let mut this = Self {
            config,
            snapshot_rx: gate.subscribe(),
            gate,
            affinity,
            ctx,
            requests_rx: ReceiverStream::new(requests_rx),
            shutdown_rx: BroadcastStream::new(shutdown.subscribe()),
            tasks: FuturesUnordered::new(),
            transfers: HashMap::new(),
            processed: snapshot.baseline.clone(),
            active: snapshot.state.is_active(),
            ownership,
            failed: BTreeSet::new(),
            conflicted: BTreeSet::new(),
            status: status.clone(),
        };
        this.publish_status();
        (this, RebalanceHandle { requests_tx, status })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!(node = %self.config.node_id, "rebalance coordinator has started");

        loop {
            tokio::select! {
                Some(msg) = self.requests_rx.next() => self.handle_msg(msg).await,
                res = self.snapshot_rx.changed() => match res {
                    Ok(()) => {
                        let snapshot = self.snapshot_rx.borrow().clone();
                        self.handle_snapshot(snapshot).await;
                    }
                    Err(_) => break,
                },
                Some(report) = self.tasks.next() => self.handle_task_result(report),
                _ = self.shutdown_rx.next() => break,
            }
        }

        self.cancel_transfers(None).await;
        tracing::debug!("rebalance coordinator has shutdown");
        Ok(())
    }

    async fn handle_msg(&mut self, msg: RebalanceMsg) {
        match msg {
            RebalanceMsg::BaselineChanged { old, new, tx } => {
                let res = self.on_baseline_changed(&old, &new).await;
                let _ = tx.send(res);
            }
        }
    }

    /// Handle a newly published cluster snapshot.
    #[tracing::instrument(level = "debug", skip(self, snapshot), fields(state = %snapshot.state, version = snapshot.baseline.version))]
    async fn handle_snapshot(&mut self, snapshot: Arc<ClusterSnapshot>) {
        let was_active = self.active;
        self.active = snapshot.state.is_active();
        if !self.active {
            if !self.transfers.is_empty() {
                tracing::info!(count = self.transfers.len(), "cluster deactivated, cancelling partition transfers");
            }
            self.cancel_transfers(None).await;
            self.publish_status();
            return;
        }

        if snapshot.baseline.version > self.processed.version {
            let old = self.processed.clone();
            if let Err(err) = self.on_baseline_changed(&old, &snapshot.baseline).await {
                tracing::error!(error = %err, "error processing baseline change");
            }
        } else if !was_active {
            self.resume_moving();
            self.publish_status();
        }
    }

    /// Process the change from the `old` to the `new` baseline.
    #[tracing::instrument(level = "debug", skip(self, old, new), fields(old = old.version, new = new.version))]
    async fn on_baseline_changed(&mut self, old: &BaselineTopology, new: &Arc<BaselineTopology>) -> GridResult<PartitionAssignmentDelta> {
        self.cancel_transfers(Some(new.version)).await;
        if new.version > self.processed.version {
            self.processed = new.clone();
        }

        let delta = self.affinity.compute_delta(old, new);
        let local = self.ctx.local.clone();
        let conflicts = find_conflicts(&delta);
        for (partition, reason) in conflicts.iter() {
            tracing::error!(partition, %reason, "conflicting partition assignment");
            self.conflicted.insert(*partition);
        }

        for partition in delta.evictions_of(&local) {
            self.ownership.remove(&partition);
        }
        let incoming: Vec<PartitionMove> = delta
            .moves_to(&local)
            .filter(|mv| !conflicts.contains_key(&mv.partition))
            .cloned()
            .collect();
        for partition in self.affinity.owned_by(&local, &new.nodes) {
            self.ownership.entry(partition).or_insert(PartitionOwnership::Owned);
        }
        for mv in incoming.iter() {
            self.ownership.insert(mv.partition, PartitionOwnership::Moving { version: new.version });
        }
        tracing::info!(
            moves = delta.moves.len(),
            incoming = incoming.len(),
            evictions = delta.evictions.len(),
            "computed partition assignment delta"
        );

        if self.gate.state().is_active() {
            for mv in incoming {
                if self.transfers.contains_key(&mv.partition) {
                    continue;
                }
                self.failed.remove(&mv.partition);
                self.start_transfer(mv.partition, mv.source, new.version);
            }
            self.resume_moving();
        }
        self.publish_status();

        if !conflicts.is_empty() {
            let partitions: Vec<String> = conflicts.keys().map(|partition| partition.to_string()).collect();
            return Err(GridError::Conflict(format!("conflicting assignments for partitions {}", partitions.join(","))));
        }
        Ok(delta)
    }

    /// Restart transfers for local partitions which are still moving but have no running task.
    fn resume_moving(&mut self) {
        let version = self.processed.version;
        let moving: Vec<u32> = self
            .ownership
            .iter()
            .filter(|&(&partition, ownership)| {
                matches!(ownership, PartitionOwnership::Moving { .. })
                    && !self.transfers.contains_key(&partition)
                    && !self.failed.contains(&partition)
                    && !self.conflicted.contains(&partition)
            })
            .map(|(partition, _)| *partition)
            .collect();
        for partition in moving {
            let source = self
                .affinity
                .owners(partition, &self.processed.nodes)
                .into_iter()
                .find(|owner| owner != &self.ctx.local);
            match source {
                Some(source) => {
                    self.ownership.insert(partition, PartitionOwnership::Moving { version });
                    self.start_transfer(partition, source, version);
                }
                None => tracing::warn!(partition, "no source available to resume partition transfer"),
            }
        }
    }

    /// Start a transfer task for the given partition.
    fn start_transfer(&mut self, partition: u32, source: NodeId, version: u64) {
        tracing::debug!(partition, %source, version, "starting partition transfer");
        let cancel = CancelToken::new();
        self.transfers.insert(
            partition,
            TrackedTransfer {
                source: source.clone(),
                baseline_version: version,
                cancel: cancel.clone(),
            },
        );
        let handle = tokio::spawn(run_transfer(self.ctx.clone(), partition, source, version, cancel));
        self.tasks.push(Box::pin(async move {
            match handle.await {
                Ok(report) => report,
                Err(err) => {
                    tracing::error!(error = ?err, partition, "partition transfer task panicked");
                    TransferReport {
                        partition,
                        baseline_version: version,
                        status: SessionStatus::Failed,
                        error: Some(GridError::TaskFailed(err.to_string())),
                    }
                }
            }
        }));
    }

    /// Cancel running transfers and wait for them to stop.
    ///
    /// With `Some(version)` only transfers started for an older version are cancelled.
    async fn cancel_transfers(&mut self, below: Option<u64>) {
        let mut cancelled = 0;
        for transfer in self.transfers.values() {
            if below.map(|version| transfer.baseline_version < version).unwrap_or(true) {
                transfer.cancel.cancel();
                cancelled += 1;
            }
        }
        if cancelled == 0 {
            return;
        }
        while self
            .transfers
            .values()
            .any(|transfer| below.map(|version| transfer.baseline_version < version).unwrap_or(true))
        {
            match self.tasks.next().await {
                Some(report) => self.handle_task_result(report),
                None => break,
            }
        }
        tracing::debug!(cancelled, "stale partition transfers have stopped");
    }

    /// Handle the result of a finished transfer task.
    fn handle_task_result(&mut self, report: TransferReport) {
        if let Some(transfer) = self.transfers.get(&report.partition) {
            if transfer.baseline_version == report.baseline_version {
                self.transfers.remove(&report.partition);
            }
        }

        match report.status {
            SessionStatus::Completed if report.baseline_version == self.processed.version => {
                tracing::info!(partition = report.partition, version = report.baseline_version, "partition rebalanced");
                self.ownership.insert(report.partition, PartitionOwnership::Owned);
            }
            SessionStatus::Failed => {
                let err = report.error.map(|err| err.to_string()).unwrap_or_default();
                tracing::error!(partition = report.partition, error = %err, "partition transfer failed after exhausting retries");
                self.failed.insert(report.partition);
                let failed = GridError::RebalanceFailed(self.failed.iter().copied().collect());
                tracing::error!(error = %failed, "rebalancing failed");
            }
            _ => (),
        }
        self.publish_status();
    }

    fn publish_status(&mut self) {
        let mut running: Vec<RunningTransfer> = self
            .transfers
            .iter()
            .map(|(partition, transfer)| RunningTransfer {
                partition: *partition,
                source: transfer.source.clone(),
                baseline_version: transfer.baseline_version,
            })
            .collect();
        running.sort_by_key(|transfer| transfer.partition);
        metrics::gauge!(METRIC_RUNNING_TRANSFERS, running.len() as f64);
        metrics::gauge!(METRIC_FAILED_PARTITIONS, self.failed.len() as f64);
        self.status.store(Arc::new(RebalanceStatus {
            baseline_version: self.processed.version,
            ownership: self.ownership.clone(),
            running,
            failed: self.failed.clone(),
            conflicted: self.conflicted.clone(),
        }));
    }
}

/// Find the moves of the given delta which conflict, keyed by partition.
///
/// A move whose source is its own target, or a second move of a partition to the same target,
/// is a duplicate authoritative assignment.
fn find_conflicts(delta: &PartitionAssignmentDelta) -> BTreeMap<u32, String> {
    let mut seen = BTreeSet::new();
    let mut conflicts = BTreeMap::new();
    for mv in delta.moves.iter() {
        if mv.source == mv.target {
            conflicts.insert(mv.partition, format!("node {} is both source and target", mv.source));
        } else if !seen.insert((mv.partition, mv.target.as_str())) {
            conflicts.insert(mv.partition, format!("node {} is targeted more than once", mv.target));
        }
    }
    conflicts
}

/// Run all sessions for one partition transfer, retrying failed sessions within the budget.
#[tracing::instrument(level = "debug", skip(ctx, cancel))]
async fn run_transfer(ctx: TransferCtx, partition: u32, source: NodeId, version: u64, cancel: CancelToken) -> TransferReport {
    let mut units = Vec::new();
    let mut attempt = 0;
    loop {
        let session = TransferSession::new(partition, source.clone(), ctx.local.clone(), version, units, cancel.clone(), ctx.probe.clone());
        metrics::increment_counter!(METRIC_SESSIONS_STARTED);
        let outcome = session.run(ctx.connector.clone(), ctx.store.clone(), ctx.segment_cap).await;
        match outcome.status {
            SessionStatus::Completed => {
                metrics::increment_counter!(METRIC_SESSIONS_COMPLETED);
                let mut error = None;
                for unit in outcome.units {
                    if let Err(err) = ctx.store.apply_received(partition, unit.into_target()).await {
                        error = Some(err);
                        break;
                    }
                }
                let status = if error.is_some() { SessionStatus::Failed } else { SessionStatus::Completed };
                return TransferReport {
                    partition,
                    baseline_version: version,
                    status,
                    error,
                };
            }
            SessionStatus::Cancelled | SessionStatus::Running => {
                metrics::increment_counter!(METRIC_SESSIONS_CANCELLED);
                return TransferReport {
                    partition,
                    baseline_version: version,
                    status: SessionStatus::Cancelled,
                    error: None,
                };
            }
            SessionStatus::Failed => {
                metrics::increment_counter!(METRIC_SESSIONS_FAILED);
                let retryable = outcome.error.as_ref().map(GridError::is_retryable).unwrap_or(false);
                if !retryable || attempt >= ctx.max_retries {
                    return TransferReport {
                        partition,
                        baseline_version: version,
                        status: SessionStatus::Failed,
                        error: outcome.error,
                    };
                }
                units = outcome.units;
                attempt += 1;
            }
        }

        let delay = retry_delay(ctx.backoff, attempt);
        tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying partition transfer");
        tokio::select! {
            _ = tokio::time::sleep(delay) => (),
            _ = cancel.cancelled() => (),
        }
        if cancel.is_cancelled() || (ctx.probe)() != version {
            metrics::increment_counter!(METRIC_SESSIONS_CANCELLED);
            return TransferReport {
                partition,
                baseline_version: version,
                status: SessionStatus::Cancelled,
                error: None,
            };
        }
    }
}

/// The delay before the given retry attempt: exponential in the attempt, plus up to one base
/// delay of jitter.
fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let base_ms = base.as_millis() as u64;
    let exp = base_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
    let jitter = if base_ms == 0 { 0 } else { rand::thread_rng().gen_range(0..=base_ms) };
    Duration::from_millis(exp.saturating_add(jitter))
}
