//! Cluster node types

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Node name, unique across the cluster
pub type NodeId = String;

/// Liveness of a peer as seen by the local failure detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Heartbeats arriving on time
    #[default]
    Alive,
    /// Missed `vote_after` heartbeats; excluded from the ring
    Suspect,
    /// Missed `node_fail_after` heartbeats
    Dead,
}

impl NodeState {
    /// Check if node takes part in ownership
    pub fn is_healthy(&self) -> bool {
        matches!(self, NodeState::Alive)
    }

    /// Check if node might still answer
    pub fn is_reachable(&self) -> bool {
        matches!(self, NodeState::Alive | NodeState::Suspect)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeState::Alive => "alive",
            NodeState::Suspect => "suspect",
            NodeState::Dead => "dead",
        };
        f.write_str(s)
    }
}

/// A peer tracked by the membership table
#[derive(Debug, Clone)]
pub struct ClusterNode {
    /// Node name
    pub name: NodeId,

    /// Cluster address (`host:port`)
    pub addr: String,

    /// Current liveness
    pub state: NodeState,

    /// Last time we heard from this node
    pub last_heartbeat: Option<Instant>,

    /// Consecutive heartbeat periods without contact
    pub missed: u32,

    /// Last ring epoch the peer reported
    pub epoch: u64,

    /// Contact since the previous detector tick
    pub(crate) contacted: bool,
}

impl ClusterNode {
    pub fn new(name: impl Into<NodeId>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            state: NodeState::Alive,
            last_heartbeat: None,
            missed: 0,
            epoch: 0,
            contacted: false,
        }
    }

    /// Record contact. Returns the previous state when the node was not alive.
    pub fn touch(&mut self, epoch: u64) -> Option<NodeState> {
        self.last_heartbeat = Some(Instant::now());
        self.contacted = true;
        self.missed = 0;
        self.epoch = self.epoch.max(epoch);
        if self.state == NodeState::Alive {
            return None;
        }
        let old = self.state;
        self.state = NodeState::Alive;
        Some(old)
    }

    /// Mark as suspect
    pub fn mark_suspect(&mut self) {
        if self.state == NodeState::Alive {
            self.state = NodeState::Suspect;
        }
    }

    /// Mark as dead
    pub fn mark_dead(&mut self) {
        self.state = NodeState::Dead;
    }

    /// Check if node is healthy
    pub fn is_healthy(&self) -> bool {
        self.state.is_healthy()
    }
}
