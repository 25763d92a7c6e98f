//! Cluster metrics
//!
//! Thin wrappers over the `metrics` facade. With the `metrics` feature off
//! every call compiles to nothing.
//!
//! ```rust,ignore
//! use tidings_cluster::observability::{init_metrics, ClusterMetrics};
//!
//! init_metrics(Some("0.0.0.0:9090".parse()?))?;
//! ClusterMetrics::increment_heartbeats_sent();
//! ```

use std::sync::OnceLock;
use std::time::Duration;

// ============================================================================
// Cluster Metrics
// ============================================================================

/// Membership and failover metrics
pub struct ClusterMetrics;

impl ClusterMetrics {
    /// Nodes currently in the ring
    pub fn set_alive_nodes(count: usize) {
        #[cfg(feature = "metrics")]
        metrics::gauge!("tidings_cluster_alive_nodes").set(count as f64);
        #[cfg(not(feature = "metrics"))]
        let _ = count;
    }

    /// Local ring epoch
    pub fn set_epoch(epoch: u64) {
        #[cfg(feature = "metrics")]
        metrics::gauge!("tidings_cluster_epoch").set(epoch as f64);
        #[cfg(not(feature = "metrics"))]
        let _ = epoch;
    }

    pub fn increment_heartbeats_sent() {
        #[cfg(feature = "metrics")]
        metrics::counter!("tidings_cluster_heartbeats_sent_total").increment(1);
    }

    pub fn increment_heartbeats_failed() {
        #[cfg(feature = "metrics")]
        metrics::counter!("tidings_cluster_heartbeats_failed_total").increment(1);
    }

    pub fn increment_nodes_suspected() {
        #[cfg(feature = "metrics")]
        metrics::counter!("tidings_cluster_nodes_suspected_total").increment(1);
    }

    pub fn increment_nodes_failed() {
        #[cfg(feature = "metrics")]
        metrics::counter!("tidings_cluster_nodes_failed_total").increment(1);
    }

    pub fn increment_ring_changes() {
        #[cfg(feature = "metrics")]
        metrics::counter!("tidings_cluster_ring_changes_total").increment(1);
    }
}

// ============================================================================
// Network Metrics
// ============================================================================

/// Inter-node RPC metrics
pub struct NetworkMetrics;

impl NetworkMetrics {
    pub fn add_bytes_sent(bytes: u64) {
        #[cfg(feature = "metrics")]
        metrics::counter!("tidings_network_bytes_sent_total").increment(bytes);
        #[cfg(not(feature = "metrics"))]
        let _ = bytes;
    }

    pub fn add_bytes_received(bytes: u64) {
        #[cfg(feature = "metrics")]
        metrics::counter!("tidings_network_bytes_received_total").increment(bytes);
        #[cfg(not(feature = "metrics"))]
        let _ = bytes;
    }

    /// Record RPC latency by request kind
    pub fn record_rpc_latency(kind: &'static str, duration: Duration) {
        #[cfg(feature = "metrics")]
        metrics::histogram!("tidings_network_rpc_latency_seconds", "kind" => kind)
            .record(duration.as_secs_f64());
        #[cfg(not(feature = "metrics"))]
        let _ = (kind, duration);
    }

    pub fn increment_rpc_errors(kind: &'static str) {
        #[cfg(feature = "metrics")]
        metrics::counter!("tidings_network_rpc_errors_total", "kind" => kind).increment(1);
        #[cfg(not(feature = "metrics"))]
        let _ = kind;
    }
}

// ============================================================================
// Prometheus Backend (when enabled)
// ============================================================================

#[cfg(feature = "metrics-prometheus")]
mod prom {
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::net::SocketAddr;

    /// Serve `/metrics` on the given address
    pub fn init_prometheus_exporter(
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        tracing::info!("Prometheus metrics exporter listening on http://{}/metrics", addr);
        Ok(())
    }
}

#[cfg(feature = "metrics-prometheus")]
pub use prom::init_prometheus_exporter;

static METRICS_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize metrics subsystem. Safe to call multiple times.
pub fn init_metrics(prometheus_addr: Option<std::net::SocketAddr>) {
    METRICS_INITIALIZED.get_or_init(|| {
        #[cfg(feature = "metrics-prometheus")]
        if let Some(addr) = prometheus_addr {
            if let Err(e) = init_prometheus_exporter(addr) {
                tracing::error!("Failed to start Prometheus exporter: {}", e);
            }
        }
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = prometheus_addr;

        tracing::info!(
            prometheus = cfg!(feature = "metrics-prometheus"),
            "Metrics subsystem initialized"
        );
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_calls_compile() {
        ClusterMetrics::set_alive_nodes(3);
        ClusterMetrics::set_epoch(2);
        ClusterMetrics::increment_heartbeats_sent();
        ClusterMetrics::increment_ring_changes();
        NetworkMetrics::add_bytes_sent(1024);
        NetworkMetrics::record_rpc_latency("proxy", Duration::from_micros(500));
        NetworkMetrics::increment_rpc_errors("deliver");
        init_metrics(None);
        init_metrics(None);
    }
}
