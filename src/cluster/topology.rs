//! The live node set.

use std::collections::BTreeSet;

use tokio::sync::watch;

use crate::NodeId;

/// A source of truth for the set of nodes currently alive in the cluster.
pub trait TopologyAuthority: Send + Sync {
    /// The current live node set.
    fn live_nodes(&self) -> BTreeSet<NodeId>;

    /// Subscribe to changes of the live node set.
    fn subscribe(&self) -> watch::Receiver<BTreeSet<NodeId>>;
}

/// A live node set fed by the embedding process.
#[derive(Clone)]
pub struct LiveTopology {
    tx: watch::Sender<BTreeSet<NodeId>>,
    rx: watch::Receiver<BTreeSet<NodeId>>,
}

impl LiveTopology {
    /// Create a new instance with the given initial live node set.
    pub fn new(nodes: impl IntoIterator<Item = NodeId>) -> Self {
        let (tx, rx) = watch::channel(nodes.into_iter().collect());
        Self { tx, rx }
    }

    /// Replace the live node set, notifying subscribers if it changed.
    pub fn set_live_nodes(&self, nodes: impl IntoIterator<Item = NodeId>) {
        let nodes: BTreeSet<NodeId> = nodes.into_iter().collect();
        if *self.rx.borrow() == nodes {
            return;
        }
        tracing::debug!(?nodes, "live node set changed");
        let _ = self.tx.send(nodes);
    }

    /// Mark the given node as alive.
    pub fn node_joined(&self, node: impl Into<NodeId>) {
        let mut nodes = self.live_nodes();
        nodes.insert(node.into());
        self.set_live_nodes(nodes);
    }

    /// Mark the given node as gone.
    pub fn node_left(&self, node: &str) {
        let mut nodes = self.live_nodes();
        nodes.remove(node);
        self.set_live_nodes(nodes);
    }
}

impl TopologyAuthority for LiveTopology {
    fn live_nodes(&self) -> BTreeSet<NodeId> {
        self.rx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<BTreeSet<NodeId>> {
        self.rx.clone()
    }
}
