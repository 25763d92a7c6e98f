//! Tidings Server Daemon (tidingsd)
//!
//! Clustered topic routing for a real-time messaging server. Every topic has
//! exactly one **master** actor, on the node the ownership ring assigns it
//! to; other nodes with subscribers run a **proxy** actor that forwards
//! session actions upstream and relays deliveries downstream.
//!
//! ## Components
//!
//! - **Hub**: topic registry, starts masters and proxies on demand
//! - **Topics**: single-task actors with bounded mailboxes
//! - **Sessions**: client connections with idle and long-poll expiry
//! - **Links**: per-peer forwarding channels
//! - **Context**: configuration, store, validators, auth and push
//!
//! ## Quick Start
//!
//! ```bash
//! # Single node
//! tidingsd
//!
//! # One member of a three node cluster
//! tidingsd --config cluster.yaml --cluster-self one
//! ```

pub mod auth;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod context;
pub mod error;
pub mod hub;
pub mod link;
pub mod metrics;
pub mod node;
pub mod push;
pub mod session;
pub mod store;
pub mod topic;
pub mod validate;

pub use cli::Cli;
pub use cluster::{Cluster, Owner};
pub use config::{LimitsConfig, PushConfig, ServerConfig, StoreConfig, TimeoutConfig};
pub use context::{ServerContext, ServerContextBuilder};
pub use error::{Error, ErrorReply, Result};
pub use hub::Hub;
pub use node::Node;
pub use session::{
    CloseReason, ServerMessage, Session, SessionHandle, SessionStore, Subscription, TransportKind,
};
pub use store::{MemoryStore, Store, StoreError};
pub use topic::{AccessMode, TopicKind, TopicName, TopicRole, TopicState, TopicStats};
