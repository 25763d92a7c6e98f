//! Server metrics
//!
//! Same pattern as the cluster crate: static helpers over the `metrics`
//! facade that do nothing without the `metrics` feature.

use crate::topic::TopicRole;

impl TopicRole {
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    fn label(self) -> &'static str {
        match self {
            TopicRole::Master => "master",
            TopicRole::Proxy => "proxy",
        }
    }
}

/// Topic actor metrics
pub struct TopicMetrics;

impl TopicMetrics {
    pub fn increment_loaded(role: TopicRole) {
        #[cfg(feature = "metrics")]
        metrics::counter!("tidings_topics_loaded_total", "role" => role.label()).increment(1);
        #[cfg(not(feature = "metrics"))]
        let _ = role;
    }

    pub fn increment_unloaded(role: TopicRole) {
        #[cfg(feature = "metrics")]
        metrics::counter!("tidings_topics_unloaded_total", "role" => role.label()).increment(1);
        #[cfg(not(feature = "metrics"))]
        let _ = role;
    }

    /// Actor stopped because ownership moved
    pub fn increment_handoffs(role: TopicRole) {
        #[cfg(feature = "metrics")]
        metrics::counter!("tidings_topic_handoffs_total", "role" => role.label()).increment(1);
        #[cfg(not(feature = "metrics"))]
        let _ = role;
    }

    pub fn increment_publishes() {
        #[cfg(feature = "metrics")]
        metrics::counter!("tidings_publishes_total").increment(1);
    }

    pub fn increment_duplicates() {
        #[cfg(feature = "metrics")]
        metrics::counter!("tidings_publish_duplicates_total").increment(1);
    }

    pub fn increment_backpressure() {
        #[cfg(feature = "metrics")]
        metrics::counter!("tidings_backpressure_total").increment(1);
    }

    pub fn increment_upstream_retries() {
        #[cfg(feature = "metrics")]
        metrics::counter!("tidings_upstream_retries_total").increment(1);
    }
}

/// Session metrics
pub struct SessionMetrics;

impl SessionMetrics {
    pub fn set_active(count: usize) {
        #[cfg(feature = "metrics")]
        metrics::gauge!("tidings_sessions_active").set(count as f64);
        #[cfg(not(feature = "metrics"))]
        let _ = count;
    }

    pub fn increment_opened() {
        #[cfg(feature = "metrics")]
        metrics::counter!("tidings_sessions_opened_total").increment(1);
    }

    pub fn increment_closed(reason: &'static str) {
        #[cfg(feature = "metrics")]
        metrics::counter!("tidings_sessions_closed_total", "reason" => reason).increment(1);
        #[cfg(not(feature = "metrics"))]
        let _ = reason;
    }
}
