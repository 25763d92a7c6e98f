//! Cluster configuration

use crate::error::{ClusterError, Result};
use crate::node::NodeId;
use crate::ring::DEFAULT_REPLICAS;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Serde adapter for durations written as integer milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// One member of the static node list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNodeConfig {
    /// Unique node name
    pub name: NodeId,
    /// Cluster address (`host:port`)
    pub addr: String,
}

impl ClusterNodeConfig {
    pub fn new(name: impl Into<NodeId>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
        }
    }
}

/// Heartbeat failure detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Run the failure detector; when off the ring is the full node list
    pub enabled: bool,

    /// Interval between heartbeats
    #[serde(with = "duration_ms")]
    pub heartbeat: Duration,

    /// Missed heartbeats before a peer becomes suspect
    pub vote_after: u32,

    /// Missed heartbeats before a peer is declared dead
    pub node_fail_after: u32,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            heartbeat: Duration::from_millis(100),
            vote_after: 8,
            node_fail_after: 16,
        }
    }
}

impl FailoverConfig {
    /// Time after which a silent peer is declared dead
    pub fn failure_window(&self) -> Duration {
        self.heartbeat * self.node_fail_after
    }
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Name of this node; must appear in `nodes`
    #[serde(rename = "self")]
    pub this_name: NodeId,

    /// Static member list
    pub nodes: Vec<ClusterNodeConfig>,

    /// Failure detector settings
    #[serde(default)]
    pub failover: FailoverConfig,

    /// Virtual points per node on the ownership ring
    #[serde(default = "default_ring_replicas")]
    pub ring_replicas: usize,
}

fn default_ring_replicas() -> usize {
    DEFAULT_REPLICAS
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self::standalone("local")
    }
}

impl ClusterConfig {
    /// Single node owning every topic
    pub fn standalone(name: impl Into<NodeId>) -> Self {
        let name = name.into();
        Self {
            this_name: name.clone(),
            nodes: vec![ClusterNodeConfig::new(name, "127.0.0.1:0")],
            failover: FailoverConfig {
                enabled: false,
                ..Default::default()
            },
            ring_replicas: DEFAULT_REPLICAS,
        }
    }

    /// Create cluster configuration builder
    pub fn builder() -> ClusterConfigBuilder {
        ClusterConfigBuilder::default()
    }

    /// Check if more than one node is configured
    pub fn is_cluster(&self) -> bool {
        self.nodes.len() > 1
    }

    /// All configured node names
    pub fn node_names(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.name.clone()).collect()
    }

    /// Every node except this one
    pub fn peers(&self) -> impl Iterator<Item = &ClusterNodeConfig> {
        self.nodes.iter().filter(move |n| n.name != self.this_name)
    }

    /// Address of this node
    pub fn this_addr(&self) -> Option<&str> {
        self.nodes
            .iter()
            .find(|n| n.name == self.this_name)
            .map(|n| n.addr.as_str())
    }

    pub fn validate(&self) -> Result<()> {
        if self.this_name.is_empty() {
            return Err(ClusterError::InvalidConfig("node name is empty".into()));
        }
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.name.is_empty() {
                return Err(ClusterError::InvalidConfig("node with empty name".into()));
            }
            if !seen.insert(node.name.as_str()) {
                return Err(ClusterError::DuplicateNode(node.name.clone()));
            }
        }
        if !seen.contains(self.this_name.as_str()) {
            return Err(ClusterError::InvalidConfig(format!(
                "node '{}' is not in the cluster node list",
                self.this_name
            )));
        }
        if self.ring_replicas == 0 {
            return Err(ClusterError::InvalidConfig(
                "ring_replicas must be positive".into(),
            ));
        }
        let failover = &self.failover;
        if failover.enabled {
            if failover.heartbeat.is_zero() {
                return Err(ClusterError::InvalidConfig(
                    "failover.heartbeat must be positive".into(),
                ));
            }
            if failover.vote_after == 0 {
                return Err(ClusterError::InvalidConfig(
                    "failover.vote_after must be at least 1".into(),
                ));
            }
            if failover.node_fail_after <= failover.vote_after {
                return Err(ClusterError::InvalidConfig(format!(
                    "failover.node_fail_after ({}) must be greater than vote_after ({})",
                    failover.node_fail_after, failover.vote_after
                )));
            }
        }
        Ok(())
    }
}

/// Builder for cluster configuration
#[derive(Debug, Default)]
pub struct ClusterConfigBuilder {
    this_name: Option<NodeId>,
    nodes: Vec<ClusterNodeConfig>,
    failover: Option<FailoverConfig>,
    ring_replicas: Option<usize>,
}

impl ClusterConfigBuilder {
    pub fn this_name(mut self, name: impl Into<NodeId>) -> Self {
        self.this_name = Some(name.into());
        self
    }

    pub fn node(mut self, name: impl Into<NodeId>, addr: impl Into<String>) -> Self {
        self.nodes.push(ClusterNodeConfig::new(name, addr));
        self
    }

    pub fn failover(mut self, config: FailoverConfig) -> Self {
        self.failover = Some(config);
        self
    }

    pub fn heartbeat(mut self, heartbeat: Duration, vote_after: u32, node_fail_after: u32) -> Self {
        self.failover = Some(FailoverConfig {
            enabled: true,
            heartbeat,
            vote_after,
            node_fail_after,
        });
        self
    }

    pub fn ring_replicas(mut self, replicas: usize) -> Self {
        self.ring_replicas = Some(replicas);
        self
    }

    pub fn build(self) -> Result<ClusterConfig> {
        let this_name = self
            .this_name
            .or_else(|| self.nodes.first().map(|n| n.name.clone()))
            .ok_or_else(|| ClusterError::InvalidConfig("no nodes configured".into()))?;
        let config = ClusterConfig {
            this_name,
            nodes: self.nodes,
            failover: self.failover.unwrap_or_default(),
            ring_replicas: self.ring_replicas.unwrap_or(DEFAULT_REPLICAS),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_nodes() -> ClusterConfigBuilder {
        ClusterConfig::builder()
            .node("a", "127.0.0.1:12001")
            .node("b", "127.0.0.1:12002")
            .node("c", "127.0.0.1:12003")
    }

    #[test]
    fn test_standalone_config() {
        let config = ClusterConfig::standalone("solo");
        assert!(!config.is_cluster());
        assert!(!config.failover.enabled);
        assert!(config.validate().is_ok());
        assert_eq!(config.peers().count(), 0);
    }

    #[test]
    fn test_cluster_config_builder() {
        let config = three_nodes().this_name("b").build().unwrap();
        assert!(config.is_cluster());
        assert_eq!(config.this_name, "b");
        assert_eq!(config.this_addr(), Some("127.0.0.1:12002"));
        let peers: Vec<_> = config.peers().map(|p| p.name.as_str()).collect();
        assert_eq!(peers, vec!["a", "c"]);
    }

    #[test]
    fn test_fail_after_must_exceed_vote_after() {
        let err = three_nodes()
            .this_name("a")
            .heartbeat(Duration::from_millis(50), 4, 4)
            .build()
            .unwrap_err();
        assert!(matches!(err, ClusterError::InvalidConfig(_)));

        assert!(three_nodes()
            .this_name("a")
            .heartbeat(Duration::from_millis(50), 4, 5)
            .build()
            .is_ok());
    }

    #[test]
    fn test_self_must_be_listed() {
        let err = three_nodes().this_name("z").build().unwrap_err();
        assert!(matches!(err, ClusterError::InvalidConfig(_)));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = three_nodes()
            .node("a", "127.0.0.1:12004")
            .build()
            .unwrap_err();
        assert!(matches!(err, ClusterError::DuplicateNode(name) if name == "a"));
    }

    #[test]
    fn test_deserialize_millis() {
        let json = r#"{
            "self": "a",
            "nodes": [{"name": "a", "addr": "h:1"}, {"name": "b", "addr": "h:2"}],
            "failover": {"enabled": true, "heartbeat": 250, "vote_after": 2, "node_fail_after": 5}
        }"#;
        let config: ClusterConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.failover.heartbeat, Duration::from_millis(250));
        assert_eq!(config.failover.failure_window(), Duration::from_millis(1250));
        assert_eq!(config.ring_replicas, DEFAULT_REPLICAS);
        assert!(config.validate().is_ok());
    }
}
