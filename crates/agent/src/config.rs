//! Agent configuration

use agent_lib::policy::PolicyIntervals;
use agent_lib::resmanager::ResManagerConfig;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

/// Agent configuration, read from `AGENT_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Node name from Kubernetes downward API
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for health/metrics/status
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Cadence of cgroup reconcile, CPU burst and resctrl
    #[serde(default = "default_one_sec")]
    pub reconcile_interval_secs: u64,

    #[serde(default = "default_one_sec")]
    pub cpu_suppress_interval_secs: u64,

    #[serde(default = "default_one_sec")]
    pub memory_evict_interval_secs: u64,

    /// Bound on each startup sync wait
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_secs: u64,

    #[serde(default = "default_evict_dedup_ttl")]
    pub evict_dedup_ttl_secs: u64,

    #[serde(default = "default_evict_cache_sweep")]
    pub evict_cache_sweep_secs: u64,

    /// `Name=bool` overrides, comma separated
    #[serde(default)]
    pub feature_gates: String,

    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: String,

    #[serde(default = "default_proc_root")]
    pub proc_root: String,

    #[serde(default = "default_resctrl_root")]
    pub resctrl_root: String,

    #[serde(default = "default_containerd_endpoint")]
    pub containerd_endpoint: String,

    #[serde(default = "default_docker_endpoint")]
    pub docker_endpoint: String,

    #[serde(default = "default_runtime_request_timeout")]
    pub runtime_request_timeout_secs: u64,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_one_sec() -> u64 {
    1
}

fn default_sync_timeout() -> u64 {
    300
}

fn default_evict_dedup_ttl() -> u64 {
    300
}

fn default_evict_cache_sweep() -> u64 {
    60
}

fn default_cgroup_root() -> String {
    "/sys/fs/cgroup".to_string()
}

fn default_proc_root() -> String {
    "/proc".to_string()
}

fn default_resctrl_root() -> String {
    "/sys/fs/resctrl".to_string()
}

fn default_containerd_endpoint() -> String {
    "/run/containerd/containerd.sock".to_string()
}

fn default_docker_endpoint() -> String {
    "/var/run/cri-dockerd.sock".to_string()
}

fn default_runtime_request_timeout() -> u64 {
    10
}

impl AgentConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("AGENT"))
            .build()?;

        config
            .try_deserialize()
            .context("Failed to parse AGENT_* configuration")
    }

    pub fn policy_intervals(&self) -> PolicyIntervals {
        PolicyIntervals {
            reconcile: Duration::from_secs(self.reconcile_interval_secs.max(1)),
            cpu_suppress: Duration::from_secs(self.cpu_suppress_interval_secs.max(1)),
            memory_evict: Duration::from_secs(self.memory_evict_interval_secs.max(1)),
        }
    }

    pub fn res_manager(&self) -> ResManagerConfig {
        ResManagerConfig {
            sync_timeout: Duration::from_secs(self.sync_timeout_secs),
            ..Default::default()
        }
    }

    pub fn evict_dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.evict_dedup_ttl_secs)
    }

    pub fn evict_cache_sweep(&self) -> Duration {
        Duration::from_secs(self.evict_cache_sweep_secs.max(1))
    }

    pub fn runtime_request_timeout(&self) -> Duration {
        Duration::from_secs(self.runtime_request_timeout_secs)
    }
}
