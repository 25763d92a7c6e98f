//! Topic ownership ring
//!
//! Consistent hashing over the alive node set. Each node contributes
//! `replicas` virtual points hashed from `"<name>#<i>"` with CRC-32 (IEEE).
//! A topic is owned by the first point whose hash is `>=` the topic's hash,
//! wrapping to the lowest point. Points are ordered by `(hash, name)` so a
//! hash collision between two nodes always resolves to the smaller name.
//!
//! The result depends only on the topic name and the *set* of nodes: input
//! order and duplicates are ignored.

use crate::node::NodeId;

/// Default virtual points per node
pub const DEFAULT_REPLICAS: usize = 20;

/// Hash used for both ring points and topic keys
pub fn ring_hash(key: &str) -> u32 {
    crc32fast::hash(key.as_bytes())
}

/// Immutable consistent hash ring
#[derive(Debug, Clone, Default)]
pub struct Ring {
    points: Vec<(u32, NodeId)>,
    nodes: Vec<NodeId>,
}

impl Ring {
    pub fn new<I, S>(nodes: I, replicas: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        let mut nodes: Vec<NodeId> = nodes.into_iter().map(Into::into).collect();
        nodes.sort();
        nodes.dedup();

        let mut points = Vec::with_capacity(nodes.len() * replicas);
        for node in &nodes {
            for i in 0..replicas {
                points.push((ring_hash(&format!("{}#{}", node, i)), node.clone()));
            }
        }
        points.sort();

        Self { points, nodes }
    }

    /// Owner of `key`, `None` only for an empty ring
    pub fn owner(&self, key: &str) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }
        let hash = ring_hash(key);
        let idx = self.points.partition_point(|(h, _)| *h < hash);
        let (_, node) = &self.points[idx % self.points.len()];
        Some(node.as_str())
    }

    /// Sorted, deduplicated member names
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn contains(&self, node: &str) -> bool {
        self.nodes.binary_search_by(|n| n.as_str().cmp(node)).is_ok()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}
