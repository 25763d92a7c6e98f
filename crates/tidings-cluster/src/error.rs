//! Cluster error types

use thiserror::Error;

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Cluster errors
#[derive(Debug, Error)]
pub enum ClusterError {
    // ==================== Configuration Errors ====================
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("duplicate node name: {0}")]
    DuplicateNode(String),

    // ==================== Membership Errors ====================
    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("node unreachable: {0}")]
    NodeUnreachable(String),

    #[error("no live nodes in cluster")]
    NoLiveNodes,

    // ==================== Protocol Errors ====================
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unsupported protocol version {version}")]
    UnsupportedVersion { version: u16 },

    #[error("unexpected response: expected {expected}")]
    UnexpectedResponse { expected: &'static str },

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    // ==================== Network Errors ====================
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClusterError {
    /// Check if this error is retriable
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ClusterError::NodeUnreachable(_)
                | ClusterError::NoLiveNodes
                | ClusterError::ConnectionFailed(_)
                | ClusterError::ConnectionClosed
                | ClusterError::Timeout
                | ClusterError::Network(_)
                | ClusterError::Io(_)
        )
    }

    /// Errors that mean the peer, not the request, is at fault
    pub fn is_peer_failure(&self) -> bool {
        self.is_retriable() || matches!(self, ClusterError::NodeNotFound(_))
    }
}

impl From<postcard::Error> for ClusterError {
    fn from(e: postcard::Error) -> Self {
        ClusterError::Serialization(e.to_string())
    }
}
