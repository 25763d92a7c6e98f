//! # Tidings Cluster
//!
//! Cluster plumbing for the Tidings topic router:
//! - **Membership**: static node list with a heartbeat failure detector
//!   (`alive → suspect → dead`)
//! - **Ring**: deterministic topic → owner mapping over the alive set
//! - **Protocol**: postcard-encoded heartbeat, proxy and delivery messages
//! - **Transport**: TCP between processes, [`LocalNetwork`] within one
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                       Tidings Node                        │
//! ├───────────────┬──────────────────┬────────────────────────┤
//! │  Membership   │       Ring       │       Transport        │
//! ├───────────────┼──────────────────┼────────────────────────┤
//! │ • Heartbeats  │ • CRC-32 vnodes  │ • Proxy requests       │
//! │ • Suspicion   │ • Epoch per      │ • Downstream delivery  │
//! │ • Failure     │   alive-set      │ • Length-prefixed      │
//! │   detection   │   change         │   postcard frames      │
//! └───────────────┴──────────────────┴────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use tidings_cluster::{ClusterConfig, Membership};
//!
//! let config = ClusterConfig::builder()
//!     .node("one", "10.0.0.1:12001")
//!     .node("two", "10.0.0.2:12001")
//!     .this_name("one")
//!     .build()?;
//! let membership = Arc::new(Membership::new(config)?);
//! tokio::spawn(membership.clone().run(transport, shutdown));
//! let owner = membership.owner_of("grpX");
//! ```

pub mod config;
pub mod error;
pub mod membership;
pub mod network;
pub mod node;
pub mod observability;
pub mod protocol;
pub mod ring;
pub mod transport;

pub use config::{ClusterConfig, ClusterConfigBuilder, ClusterNodeConfig, FailoverConfig};
pub use error::{ClusterError, Result};
pub use membership::{Membership, MembershipEvent, RingSnapshot};
pub use network::{LocalNetwork, LocalTransport};
pub use node::{ClusterNode, NodeId, NodeState};
pub use observability::{init_metrics, ClusterMetrics, NetworkMetrics};
pub use protocol::{
    ClusterRequest, ClusterResponse, Delivery, DeliveryEvent, Envelope, Heartbeat, ProxyOp,
    ProxyRequest, ProxyResult, RequestHeader, ResponseHeader, SessionRef, StatusCode,
};
pub use ring::{Ring, DEFAULT_REPLICAS};
pub use transport::{ClusterHandler, PeerTransport, TcpTransport, TransportConfig};
