//! Server configuration
//!
//! Loaded from a single YAML file. Durations are integer milliseconds.
//!
//! ```yaml
//! cluster:
//!   self: one
//!   nodes:
//!     - { name: one, addr: "10.0.0.1:12001" }
//!     - { name: two, addr: "10.0.0.2:12001" }
//!   failover: { enabled: true, heartbeat: 100, vote_after: 8, node_fail_after: 16 }
//! timeouts:
//!   session_idle: 55000
//! store:
//!   adapter: memory
//! validators:
//!   payload_limit: { max_bytes: 65536 }
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tidings_cluster::config::duration_ms;
use tidings_cluster::ClusterConfig;

/// Idle and request timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Session without activity is torn down after this long
    #[serde(with = "duration_ms")]
    pub session_idle: Duration,

    /// Extra idle allowance for long-poll sessions between polls
    #[serde(with = "duration_ms")]
    pub long_poll_grace: Duration,

    /// Master with no subscribers anywhere unloads after this long
    #[serde(with = "duration_ms")]
    pub master_idle: Duration,

    /// Proxy with no local subscribers unloads after this long
    #[serde(with = "duration_ms")]
    pub proxy_idle: Duration,

    /// Interval of the idle session sweep
    #[serde(with = "duration_ms")]
    pub sweep_interval: Duration,

    /// Upper bound for a client request waiting on a topic
    #[serde(with = "duration_ms")]
    pub request: Duration,

    /// Upper bound for one inter-node call
    #[serde(with = "duration_ms")]
    pub link: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            session_idle: Duration::from_secs(55),
            long_poll_grace: Duration::from_secs(15),
            master_idle: Duration::from_secs(4),
            proxy_idle: Duration::from_secs(2),
            sweep_interval: Duration::from_secs(1),
            request: Duration::from_secs(10),
            link: Duration::from_secs(3),
        }
    }
}

/// Size and queue limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Largest accepted publish payload in bytes
    pub max_message_size: usize,
    /// Most persisted subscribers a group topic may have
    pub max_subscriber_count: usize,
    /// Topic actor mailbox capacity
    pub mailbox_capacity: usize,
    /// Outbound queue capacity per session
    pub session_queue: usize,
    /// Recent messages each master keeps in memory
    pub history_cache: usize,
    /// Upstream calls a proxy buffers while the owner is in doubt
    pub max_pending_upstream: usize,
    /// Attempts per proxied call before giving up
    pub max_upstream_attempts: u32,
    /// Subscribe attempts across ownership hand-offs
    pub subscribe_retries: u32,
    /// Downstream deliveries buffered per peer link
    pub link_queue: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: 512 * 1024,
            max_subscriber_count: 256,
            mailbox_capacity: 256,
            session_queue: 128,
            history_cache: 32,
            max_pending_upstream: 64,
            max_upstream_attempts: 12,
            subscribe_retries: 4,
            link_queue: 1024,
        }
    }
}

/// Persistence backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Adapter name; only `memory` is built in
    pub adapter: String,
    /// Adapter-specific settings
    pub config: serde_json::Value,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            adapter: "memory".to_string(),
            config: serde_json::Value::Null,
        }
    }
}

/// Push notification backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    /// `none` or `log`
    pub handler: String,
    /// Buffered notifications before new ones are dropped
    pub queue: usize,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            handler: "none".to_string(),
            queue: 1024,
        }
    }
}

/// Complete server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub cluster: ClusterConfig,
    pub timeouts: TimeoutConfig,
    pub limits: LimitsConfig,
    pub store: StoreConfig,
    pub push: PushConfig,
    /// Validator name → settings
    pub validators: BTreeMap<String, serde_json::Value>,
    /// Authentication scheme → settings
    pub auth: BTreeMap<String, serde_json::Value>,
    /// Prometheus listener
    pub metrics_addr: Option<SocketAddr>,
}

impl ServerConfig {
    /// Load from a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        self.cluster
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;

        let t = &self.timeouts;
        for (name, value) in [
            ("session_idle", t.session_idle),
            ("master_idle", t.master_idle),
            ("proxy_idle", t.proxy_idle),
            ("sweep_interval", t.sweep_interval),
            ("request", t.request),
            ("link", t.link),
        ] {
            if value.is_zero() {
                return Err(Error::Config(format!("timeouts.{} must be positive", name)));
            }
        }

        let l = &self.limits;
        for (name, value) in [
            ("max_message_size", l.max_message_size),
            ("max_subscriber_count", l.max_subscriber_count),
            ("mailbox_capacity", l.mailbox_capacity),
            ("session_queue", l.session_queue),
            ("max_pending_upstream", l.max_pending_upstream),
            ("link_queue", l.link_queue),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("limits.{} must be positive", name)));
            }
        }
        if l.max_upstream_attempts == 0 || l.subscribe_retries == 0 {
            return Err(Error::Config("retry limits must be positive".into()));
        }
        Ok(())
    }
}
