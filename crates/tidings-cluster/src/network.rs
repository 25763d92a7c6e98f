//! In-process cluster network
//!
//! Connects several nodes living in one process. Every request and response
//! is pushed through the real codec so wire compatibility is exercised.
//! Nodes can be killed or partitioned to drive failover.

use crate::error::{ClusterError, Result};
use crate::node::NodeId;
use crate::protocol::{
    decode_request, decode_response, encode_request, encode_response, ClusterRequest,
    ClusterResponse,
};
use crate::transport::{ClusterHandler, PeerTransport};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::{Arc, Weak};

/// Shared in-memory network
#[derive(Default)]
pub struct LocalNetwork {
    handlers: DashMap<NodeId, Weak<dyn ClusterHandler>>,
    down: DashSet<NodeId>,
    cut: DashSet<(NodeId, NodeId)>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a node's request handler
    pub fn register(&self, node: impl Into<NodeId>, handler: Weak<dyn ClusterHandler>) {
        let node = node.into();
        self.down.remove(&node);
        self.handlers.insert(node, handler);
    }

    /// Transport endpoint for `node`
    pub fn endpoint(self: &Arc<Self>, node: impl Into<NodeId>) -> LocalTransport {
        LocalTransport {
            local: node.into(),
            network: self.clone(),
        }
    }

    /// Crash a node: it can neither send nor receive
    pub fn kill(&self, node: &str) {
        self.down.insert(node.to_string());
    }

    pub fn revive(&self, node: &str) {
        self.down.remove(node);
    }

    pub fn is_down(&self, node: &str) -> bool {
        self.down.contains(node)
    }

    /// Drop traffic between two nodes in both directions
    pub fn partition(&self, a: &str, b: &str) {
        self.cut.insert(Self::link_key(a, b));
    }

    pub fn heal(&self, a: &str, b: &str) {
        self.cut.remove(&Self::link_key(a, b));
    }

    fn link_key(a: &str, b: &str) -> (NodeId, NodeId) {
        if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        }
    }

    fn reachable(&self, from: &str, to: &str) -> bool {
        !self.is_down(from) && !self.is_down(to) && !self.cut.contains(&Self::link_key(from, to))
    }

    async fn deliver(&self, from: &str, to: &str, request: ClusterRequest) -> Result<ClusterResponse> {
        if !self.reachable(from, to) {
            return Err(ClusterError::ConnectionFailed(format!("{} -> {}", from, to)));
        }
        let handler = self
            .handlers
            .get(to)
            .and_then(|h| h.value().upgrade())
            .ok_or_else(|| ClusterError::NodeUnreachable(to.to_string()))?;

        let request = decode_request(&encode_request(&request)?)?;
        let response = handler.handle(request).await;

        // A node killed mid-request never answers
        if !self.reachable(from, to) {
            return Err(ClusterError::ConnectionClosed);
        }
        decode_response(&encode_response(&response)?)
    }
}

/// One node's view of the [`LocalNetwork`]
#[derive(Clone)]
pub struct LocalTransport {
    local: NodeId,
    network: Arc<LocalNetwork>,
}

impl LocalTransport {
    pub fn local_node(&self) -> &str {
        &self.local
    }

    pub fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }
}

#[async_trait]
impl PeerTransport for LocalTransport {
    async fn send(&self, peer: &str, request: ClusterRequest) -> Result<ClusterResponse> {
        self.network.deliver(&self.local, peer, request).await
    }
}
