//! Cluster activation & baseline topology.

pub mod baseline;
pub mod gate;
#[cfg(test)]
mod gate_test;
pub mod state;
pub mod topology;

use std::collections::BTreeSet;
use std::sync::Arc;

pub use baseline::{AutoAdjustSettings, AutoAdjustStatus, AutoAdjustTaskState, BaselineManager, BaselineTopology};
pub use gate::{ClusterGate, ClusterSnapshot};
pub use state::ClusterState;
pub use topology::{LiveTopology, TopologyAuthority};

use crate::error::GridResult;
use crate::rebalance::RebalanceHandle;
use crate::NodeId;

/// The operator surface of the grid: cluster state queries and commands.
#[derive(Clone)]
pub struct GridCluster {
    gate: ClusterGate,
    baseline: BaselineManager,
    topology: Arc<dyn TopologyAuthority>,
    rebalance: RebalanceHandle,
}

impl GridCluster {
    /// Create a new instance.
    pub fn new(gate: ClusterGate, baseline: BaselineManager, topology: Arc<dyn TopologyAuthority>, rebalance: RebalanceHandle) -> Self {
        Self {
            gate,
            baseline,
            topology,
            rebalance,
        }
    }

    pub fn get_state(&self) -> ClusterState {
        self.gate.state()
    }

    /// Request the given activation state.
    pub async fn set_state(&self, target: ClusterState) -> GridResult<()> {
        let live = self.topology.live_nodes();
        self.gate.set_state(target, &live).await?;
        Ok(())
    }

    pub fn get_baseline(&self) -> Arc<BaselineTopology> {
        self.baseline.current_baseline()
    }

    /// The live nodes which are not part of the baseline.
    pub fn get_non_baseline_nodes(&self) -> BTreeSet<NodeId> {
        let baseline = self.get_baseline();
        self.topology.live_nodes().into_iter().filter(|node| !baseline.contains(node)).collect()
    }

    pub async fn set_baseline(&self, nodes: BTreeSet<NodeId>) -> GridResult<Arc<BaselineTopology>> {
        self.baseline.set_baseline(nodes).await
    }

    pub async fn add_baseline_nodes(&self, ids: &[NodeId]) -> GridResult<Arc<BaselineTopology>> {
        self.baseline.add_baseline_nodes(ids).await
    }

    pub async fn remove_baseline_nodes(&self, ids: &[NodeId]) -> GridResult<Arc<BaselineTopology>> {
        self.baseline.remove_baseline_nodes(ids).await
    }

    pub fn get_auto_adjust(&self) -> AutoAdjustSettings {
        self.baseline.auto_adjust_settings()
    }

    pub async fn set_auto_adjust(&self, settings: AutoAdjustSettings) -> GridResult<()> {
        self.baseline.set_auto_adjust(settings).await
    }

    pub fn get_auto_adjust_status(&self) -> AutoAdjustStatus {
        self.baseline.auto_adjust_status()
    }

    /// The partitions which could not be rebalanced.
    pub fn failed_partitions(&self) -> Vec<u32> {
        self.rebalance.failed_partitions()
    }

    /// Fail if any partition could not be rebalanced.
    pub fn check_rebalance(&self) -> GridResult<()> {
        self.rebalance.check_rebalance()
    }

    pub fn ensure_read(&self) -> GridResult<()> {
        self.gate.ensure_read()
    }

    pub fn ensure_write(&self) -> GridResult<()> {
        self.gate.ensure_write()
    }
}
