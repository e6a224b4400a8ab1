//! Compiled-in node-level defaults for the NodeSLO spec

use super::types::*;

/// BE CPU suppression starts when node usage passes this percentage
pub const DEFAULT_CPU_SUPPRESS_THRESHOLD_PERCENT: i64 = 65;
/// BE pods are evicted when node memory usage passes this percentage
pub const DEFAULT_MEMORY_EVICT_THRESHOLD_PERCENT: i64 = 70;
/// Eviction releases memory until usage is this far under the threshold
pub const MEMORY_EVICT_LOWER_GAP_PERCENT: i64 = 2;

pub const DEFAULT_CPU_BURST_PERCENT: i64 = 1000;
pub const DEFAULT_CFS_QUOTA_BURST_PERCENT: i64 = 300;
pub const DEFAULT_SHARE_POOL_THRESHOLD_PERCENT: i64 = 50;

pub fn default_resource_threshold_strategy() -> ResourceThresholdStrategy {
    ResourceThresholdStrategy {
        enable: Some(true),
        cpu_suppress_threshold_percent: Some(DEFAULT_CPU_SUPPRESS_THRESHOLD_PERCENT),
        cpu_suppress_policy: Some(CpuSuppressPolicy::CpuSet),
        memory_evict_threshold_percent: Some(DEFAULT_MEMORY_EVICT_THRESHOLD_PERCENT),
        memory_evict_lower_percent: None,
    }
}

/// Recommended memory QoS for latency-sensitive classes
fn latency_sensitive_memory_qos() -> MemoryQoS {
    MemoryQoS {
        min_limit_percent: Some(0),
        low_limit_percent: Some(0),
        throttling_percent: Some(0),
        wmark_ratio: Some(95),
        wmark_scale_permill: Some(20),
        wmark_min_adj: Some(-25),
        priority_enable: Some(0),
        priority: Some(0),
        oom_kill_group: Some(0),
    }
}

fn best_effort_memory_qos() -> MemoryQoS {
    MemoryQoS {
        wmark_min_adj: Some(50),
        ..latency_sensitive_memory_qos()
    }
}

/// Memory QoS values that leave the kernel defaults untouched
pub fn none_memory_qos() -> MemoryQoS {
    MemoryQoS {
        min_limit_percent: Some(0),
        low_limit_percent: Some(0),
        throttling_percent: Some(0),
        wmark_ratio: Some(0),
        wmark_scale_permill: Some(50),
        wmark_min_adj: Some(0),
        priority_enable: Some(0),
        priority: Some(0),
        oom_kill_group: Some(0),
    }
}

/// Resctrl values granting the whole cache and full bandwidth
pub fn none_resctrl_qos() -> ResctrlQoS {
    ResctrlQoS {
        cat_range_start_percent: Some(0),
        cat_range_end_percent: Some(100),
        mba_percent: Some(100),
    }
}

fn resctrl_qos(start: i64, end: i64, mba: i64) -> ResctrlQoS {
    ResctrlQoS {
        cat_range_start_percent: Some(start),
        cat_range_end_percent: Some(end),
        mba_percent: Some(mba),
    }
}

fn resource_qos(memory: MemoryQoS, resctrl: ResctrlQoS) -> ResourceQoS {
    ResourceQoS {
        memory_qos: Some(MemoryQoSCfg {
            enable: Some(false),
            memory_qos: memory,
        }),
        resctrl_qos: Some(ResctrlQoSCfg {
            enable: Some(false),
            resctrl_qos: resctrl,
        }),
    }
}

pub fn default_resource_qos_strategy() -> ResourceQoSStrategy {
    ResourceQoSStrategy {
        lsr: Some(resource_qos(latency_sensitive_memory_qos(), resctrl_qos(0, 100, 100))),
        ls: Some(resource_qos(latency_sensitive_memory_qos(), resctrl_qos(0, 100, 100))),
        be: Some(resource_qos(best_effort_memory_qos(), resctrl_qos(0, 30, 100))),
        system: Some(resource_qos(none_memory_qos(), none_resctrl_qos())),
        cgroup_root: Some(resource_qos(none_memory_qos(), none_resctrl_qos())),
    }
}

pub fn default_cpu_burst_strategy() -> CpuBurstStrategy {
    CpuBurstStrategy {
        config: CpuBurstConfig {
            policy: Some(CpuBurstPolicy::None),
            cpu_burst_percent: Some(DEFAULT_CPU_BURST_PERCENT),
            cfs_quota_burst_percent: Some(DEFAULT_CFS_QUOTA_BURST_PERCENT),
            cfs_quota_burst_period_seconds: Some(-1),
        },
        share_pool_threshold_percent: Some(DEFAULT_SHARE_POOL_THRESHOLD_PERCENT),
    }
}

/// The spec every pushed NodeSLO is merged over
pub fn default_node_slo_spec() -> NodeSLOSpec {
    NodeSLOSpec {
        resource_used_threshold_with_be: Some(default_resource_threshold_strategy()),
        resource_qos_strategy: Some(default_resource_qos_strategy()),
        cpu_burst_strategy: Some(default_cpu_burst_strategy()),
    }
}
