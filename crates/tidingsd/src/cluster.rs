//! Ownership resolution and peer links for the hub and topic actors

use crate::config::ServerConfig;
use crate::error::Result;
use crate::link::{LinkConfig, LinkRegistry, ProxyLink};
use std::sync::Arc;
use tidings_cluster::{ClusterError, Membership, NodeId, PeerTransport};

/// Where a topic's master lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Owner {
    Local,
    Remote(NodeId),
}

pub struct Cluster {
    membership: Arc<Membership>,
    transport: Arc<dyn PeerTransport>,
    links: LinkRegistry,
}

impl Cluster {
    pub fn new(
        membership: Arc<Membership>,
        transport: Arc<dyn PeerTransport>,
        config: &ServerConfig,
    ) -> Self {
        let links = LinkRegistry::new(
            membership.clone(),
            transport.clone(),
            LinkConfig {
                call_timeout: config.timeouts.link,
                queue: config.limits.link_queue,
            },
        );
        Self {
            membership,
            transport,
            links,
        }
    }

    pub fn local_id(&self) -> &str {
        self.membership.local_id()
    }

    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    pub fn epoch(&self) -> u64 {
        self.membership.epoch()
    }

    /// Owner of a topic under the current ring
    pub fn owner_of(&self, topic: &str) -> Result<Owner> {
        match self.membership.owner_of(topic) {
            Some(node) if node == self.local_id() => Ok(Owner::Local),
            Some(node) => Ok(Owner::Remote(node)),
            None => Err(ClusterError::NoLiveNodes.into()),
        }
    }

    pub fn is_local_owner(&self, topic: &str) -> bool {
        self.membership.is_owner(topic)
    }

    /// Whether a peer may still answer. Dead and unknown peers are not.
    pub fn is_reachable(&self, peer: &str) -> bool {
        self.membership
            .state_of(peer)
            .is_some_and(|state| state.is_reachable())
    }

    pub fn link(&self, peer: &str) -> Arc<ProxyLink> {
        self.links.get_or_open(peer)
    }

    pub fn close_link(&self, peer: &str) {
        self.links.close(peer);
    }

    pub fn close_links(&self) {
        self.links.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidings_cluster::{ClusterConfig, LocalNetwork};

    #[tokio::test]
    async fn test_owner_resolution() {
        let mut config = ServerConfig::default();
        config.cluster = ClusterConfig::builder()
            .node("a", "a:1")
            .node("b", "b:1")
            .this_name("a")
            .build()
            .unwrap();
        let membership = Arc::new(Membership::new(config.cluster.clone()).unwrap());
        let net = LocalNetwork::new();
        let cluster = Cluster::new(membership.clone(), Arc::new(net.endpoint("a")), &config);

        for i in 0..32 {
            let topic = format!("grp{}", i);
            let expected = membership.owner_of(&topic).unwrap();
            match cluster.owner_of(&topic).unwrap() {
                Owner::Local => assert_eq!(expected, "a"),
                Owner::Remote(node) => assert_eq!(node, expected),
            }
        }
    }
}
