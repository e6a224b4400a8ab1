//! Observability infrastructure for the QoS agent
//!
//! Provides:
//! - Prometheus metrics (evictions, container kills, reconcile latency, policy state)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge_vec,
    HistogramVec, IntCounter, IntCounterVec, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for reconcile latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    pod_evictions: IntCounterVec,
    pod_eviction_failures: IntCounterVec,
    container_kills: IntCounterVec,
    reconcile_duration_seconds: HistogramVec,
    policy_state: IntGaugeVec,
    node_slo_updates: IntCounter,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            pod_evictions: register_int_counter_vec!(
                "qos_agent_pod_evictions_total",
                "Pods evicted by the agent",
                &["reason"]
            )
            .expect("Failed to register pod_evictions_total"),

            pod_eviction_failures: register_int_counter_vec!(
                "qos_agent_pod_eviction_failures_total",
                "Pod eviction requests rejected by the API server",
                &["reason"]
            )
            .expect("Failed to register pod_eviction_failures_total"),

            container_kills: register_int_counter_vec!(
                "qos_agent_container_kills_total",
                "Direct container stop attempts by result",
                &["result"]
            )
            .expect("Failed to register container_kills_total"),

            reconcile_duration_seconds: register_histogram_vec!(
                "qos_agent_reconcile_duration_seconds",
                "Time spent in one policy reconcile tick",
                &["policy"],
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register reconcile_duration_seconds"),

            policy_state: register_int_gauge_vec!(
                "qos_agent_policy_state",
                "Policy state: 0 disabled, 1 initializing, 2 running",
                &["policy"]
            )
            .expect("Failed to register policy_state"),

            node_slo_updates: register_int_counter!(
                "qos_agent_node_slo_updates_total",
                "NodeSLO specs accepted into the store"
            )
            .expect("Failed to register node_slo_updates_total"),
        }
    }
}

/// Agent metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AgentMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AgentMetrics")
    }
}

impl AgentMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new)
    }

    /// Count a successful pod eviction
    pub fn record_eviction(&self, reason: &str) {
        self.inner().pod_evictions.with_label_values(&[reason]).inc();
    }

    pub fn record_eviction_failure(&self, reason: &str) {
        self.inner()
            .pod_eviction_failures
            .with_label_values(&[reason])
            .inc();
    }

    /// `result` is one of `stopped`, `skipped`, `failed`
    pub fn record_container_kill(&self, result: &str) {
        self.inner().container_kills.with_label_values(&[result]).inc();
    }

    pub fn observe_reconcile_duration(&self, policy: &str, duration_secs: f64) {
        self.inner()
            .reconcile_duration_seconds
            .with_label_values(&[policy])
            .observe(duration_secs);
    }

    pub fn set_policy_state(&self, policy: &str, state: i64) {
        self.inner().policy_state.with_label_values(&[policy]).set(state);
    }

    pub fn inc_node_slo_updates(&self) {
        self.inner().node_slo_updates.inc();
    }

    /// Current eviction count for `reason`
    pub fn evictions(&self, reason: &str) -> u64 {
        self.inner().pod_evictions.with_label_values(&[reason]).get()
    }

    pub fn container_kills(&self, result: &str) -> u64 {
        self.inner().container_kills.with_label_values(&[result]).get()
    }

    pub fn policy_state(&self, policy: &str) -> i64 {
        self.inner().policy_state.with_label_values(&[policy]).get()
    }
}

/// Structured logger for agent events
///
/// Emits lifecycle records with a fixed `event` field so they can be
/// filtered out of the JSON log stream.
#[derive(Clone, Debug)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str, feature_gates: &str) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            feature_gates = %feature_gates,
            "QoS agent started"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "QoS agent shutting down"
        );
    }

    pub fn log_node_slo_updated(&self, revision: u64, created: bool) {
        info!(
            event = "node_slo_updated",
            node = %self.node_name,
            revision = revision,
            created = created,
            "NodeSLO applied"
        );
    }

    pub fn log_pod_evicted(&self, namespace: &str, pod_name: &str, reason: &str) {
        info!(
            event = "pod_evicted",
            node = %self.node_name,
            namespace = %namespace,
            pod_name = %pod_name,
            reason = %reason,
            "Pod evicted"
        );
    }

    /// Log a policy that will not run for the rest of the process lifetime
    pub fn log_policy_disabled(&self, policy: &str, cause: &str) {
        warn!(
            event = "policy_disabled",
            node = %self.node_name,
            policy = %policy,
            cause = %cause,
            "Policy disabled"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_metrics_counters() {
        let metrics = AgentMetrics::new();

        let before = metrics.evictions("test-reason");
        metrics.record_eviction("test-reason");
        metrics.record_eviction("test-reason");
        assert_eq!(metrics.evictions("test-reason"), before + 2);

        metrics.record_eviction_failure("test-reason");
        metrics.observe_reconcile_duration("test-policy", 0.002);
        metrics.inc_node_slo_updates();

        metrics.set_policy_state("test-policy", 2);
        assert_eq!(metrics.policy_state("test-policy"), 2);
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("test-node");
        assert_eq!(logger.node_name, "test-node");
    }
}
