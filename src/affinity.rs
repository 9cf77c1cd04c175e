//! Partition affinity.
//!
//! Partitions are assigned to the nodes of a baseline with rendezvous hashing: every node gets a
//! weight per partition, and the `backups + 1` heaviest nodes own the partition. The first of
//! them is the primary. Adding or removing a node only moves the partitions for which that node
//! is among the heaviest, which keeps rebalancing proportional to the change.

use std::collections::BTreeSet;

use crate::cluster::baseline::BaselineTopology;
use crate::NodeId;

/// A move of one partition replica from a source node to a target node.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct PartitionMove {
    pub partition: u32,
    /// The node supplying the partition's data.
    pub source: NodeId,
    /// The node which newly hosts a replica of the partition.
    pub target: NodeId,
}

/// The difference in partition ownership between two baseline versions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartitionAssignmentDelta {
    pub from_version: u64,
    pub to_version: u64,
    /// The replica moves needed to reach the new assignment.
    pub moves: Vec<PartitionMove>,
    /// The `(partition, node)` pairs which stop owning a partition.
    pub evictions: Vec<(u32, NodeId)>,
}

impl PartitionAssignmentDelta {
    /// Check if this delta moves nothing.
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty() && self.evictions.is_empty()
    }

    /// The moves which target the given node.
    pub fn moves_to<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a PartitionMove> + 'a {
        self.moves.iter().filter(move |mv| mv.target == node)
    }

    /// The partitions which the given node stops owning.
    pub fn evictions_of<'a>(&'a self, node: &'a str) -> impl Iterator<Item = u32> + 'a {
        self.evictions.iter().filter(move |(_, owner)| owner == node).map(|(partition, _)| *partition)
    }
}

/// A deterministic partition to node assignment function.
#[derive(Clone, Copy, Debug)]
pub struct Affinity {
    partitions: u32,
    backups: u32,
}

impl Affinity {
    /// Create a new instance.
    pub fn new(partitions: u32, backups: u32) -> Self {
        Self { partitions, backups }
    }

    /// The owners of the given partition among the given nodes, primary first.
    pub fn owners(&self, partition: u32, nodes: &BTreeSet<NodeId>) -> Vec<NodeId> {
        let mut weighted: Vec<(u64, &NodeId)> = nodes.iter().map(|node| (weight(partition, node), node)).collect();
        // Heaviest first, ties broken by the lowest node ID.
        weighted.sort_by(|(wa, na), (wb, nb)| wb.cmp(wa).then_with(|| na.cmp(nb)));
        weighted
            .into_iter()
            .take(self.backups as usize + 1)
            .map(|(_, node)| node.clone())
            .collect()
    }

    /// The partitions owned by the given node among the given nodes.
    pub fn owned_by(&self, node: &str, nodes: &BTreeSet<NodeId>) -> BTreeSet<u32> {
        (0..self.partitions)
            .filter(|partition| self.owners(*partition, nodes).iter().any(|owner| owner == node))
            .collect()
    }

    /// Compute the ownership delta between two baselines.
    ///
    /// Every node which newly hosts a replica of a partition gets one move. Its source is an
    /// owner under `old`, preferring owners which are still part of `new`, ties broken by the
    /// lowest node ID. A partition with no owner under `old` has no data to copy and gets no
    /// move.
    pub fn compute_delta(&self, old: &BaselineTopology, new: &BaselineTopology) -> PartitionAssignmentDelta {
        let mut delta = PartitionAssignmentDelta {
            from_version: old.version,
            to_version: new.version,
            ..Default::default()
        };
        for partition in 0..self.partitions {
            let old_owners: BTreeSet<NodeId> = self.owners(partition, &old.nodes).into_iter().collect();
            let new_owners: BTreeSet<NodeId> = self.owners(partition, &new.nodes).into_iter().collect();
            if old_owners == new_owners {
                continue;
            }
            delta
                .evictions
                .extend(old_owners.difference(&new_owners).map(|node| (partition, node.clone())));

            let source = match old_owners
                .iter()
                .find(|node| new.nodes.contains(*node))
                .or_else(|| old_owners.iter().next())
            {
                Some(source) => source,
                None => continue,
            };
            delta.moves.extend(new_owners.difference(&old_owners).map(|target| PartitionMove {
                partition,
                source: source.clone(),
                target: target.clone(),
            }));
        }
        delta
    }
}

/// The rendezvous weight of the given node for the given partition.
fn weight(partition: u32, node: &str) -> u64 {
    seahash::hash(format!("{}:{}", partition, node).as_bytes())
}
