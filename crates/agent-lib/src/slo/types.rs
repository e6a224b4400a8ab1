//! NodeSLO custom resource
//!
//! The per-node QoS contract pushed by the control plane. Every leaf is
//! optional: an absent field inherits the node-level default, it does not
//! mean "off". Enablement is always an explicit `enable` field.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Memory cgroup tuning for a QoS class
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MemoryQoS {
    /// `memory.min` = requests.memory * minLimitPercent / 100
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_limit_percent: Option<i64>,
    /// `memory.low` = requests.memory * lowLimitPercent / 100
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_limit_percent: Option<i64>,
    /// `memory.high` = limits.memory * throttlingPercent / 100
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttling_percent: Option<i64>,
    /// Async reclaim watermark, [0, 100]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wmark_ratio: Option<i64>,
    /// [1, 1000]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wmark_scale_permill: Option<i64>,
    /// Global reclaim adjustment, [-25, 50]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wmark_min_adj: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_enable: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oom_kill_group: Option<i64>,
}

/// Node-level memory QoS switch plus its parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MemoryQoSCfg {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,
    #[serde(flatten)]
    pub memory_qos: MemoryQoS,
}

/// LLC and memory bandwidth partition for a QoS class
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResctrlQoS {
    /// [0, 100]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cat_range_start_percent: Option<i64>,
    /// [0, 100]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cat_range_end_percent: Option<i64>,
    /// [0, 100]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mba_percent: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResctrlQoSCfg {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,
    #[serde(flatten)]
    pub resctrl_qos: ResctrlQoS,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ResourceQoS {
    #[serde(rename = "memoryQoS", default, skip_serializing_if = "Option::is_none")]
    pub memory_qos: Option<MemoryQoSCfg>,
    #[serde(rename = "resctrlQoS", default, skip_serializing_if = "Option::is_none")]
    pub resctrl_qos: Option<ResctrlQoSCfg>,
}

/// QoS configuration per workload tier
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceQoSStrategy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lsr: Option<ResourceQoS>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ls: Option<ResourceQoS>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub be: Option<ResourceQoS>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<ResourceQoS>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cgroup_root: Option<ResourceQoS>,
}

impl ResourceQoSStrategy {
    /// Mutable access to every class block, present or not
    pub fn classes_mut(&mut self) -> [&mut Option<ResourceQoS>; 5] {
        [
            &mut self.lsr,
            &mut self.ls,
            &mut self.be,
            &mut self.system,
            &mut self.cgroup_root,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum CpuSuppressPolicy {
    /// Shrink the cpuset available to best-effort pods
    #[serde(rename = "cpuset")]
    CpuSet,
    /// Lower the CFS quota of the best-effort cgroup
    #[serde(rename = "cfsQuota")]
    CfsQuota,
}

/// Best-effort resource limits applied when the node is busy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceThresholdStrategy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,
    /// (0, 100)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_suppress_threshold_percent: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_suppress_policy: Option<CpuSuppressPolicy>,
    /// Upper bound, (0, 100)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_evict_threshold_percent: Option<i64>,
    /// Release until usage drops below this; threshold - 2 when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_evict_lower_percent: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum CpuBurstPolicy {
    #[serde(rename = "none")]
    None,
    /// Only set `cpu.max.burst`
    #[serde(rename = "cpuBurstOnly")]
    CpuBurstOnly,
    /// Only scale up the CFS quota of throttled pods
    #[serde(rename = "cfsQuotaBurstOnly")]
    CfsQuotaBurstOnly,
    #[serde(rename = "auto")]
    Auto,
}

impl CpuBurstPolicy {
    pub fn cpu_burst_enabled(&self) -> bool {
        matches!(self, CpuBurstPolicy::CpuBurstOnly | CpuBurstPolicy::Auto)
    }

    pub fn cfs_quota_burst_enabled(&self) -> bool {
        matches!(self, CpuBurstPolicy::CfsQuotaBurstOnly | CpuBurstPolicy::Auto)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CpuBurstConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<CpuBurstPolicy>,
    /// Percentage of the quota granted as `cpu.max.burst`, [0, 10000]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_burst_percent: Option<i64>,
    /// Ceiling for quota scale-up, as a percentage of the original quota
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cfs_quota_burst_percent: Option<i64>,
    /// How long a pod may stay bursted, -1 for unlimited
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cfs_quota_burst_period_seconds: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CpuBurstStrategy {
    #[serde(flatten)]
    pub config: CpuBurstConfig,
    /// Scale quota back down once node CPU usage passes this percentage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_pool_threshold_percent: Option<i64>,
}

/// Desired QoS state of one node
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "slo.koordinator.sh",
    version = "v1alpha1",
    kind = "NodeSLO",
    status = "NodeSLOStatus",
    derive = "PartialEq",
    derive = "Default"
)]
pub struct NodeSLOSpec {
    /// BE pods are limited when node resource usage is overloaded
    #[serde(
        rename = "resourceUsedThresholdWithBE",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub resource_used_threshold_with_be: Option<ResourceThresholdStrategy>,
    #[serde(
        rename = "resourceQoSStrategy",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub resource_qos_strategy: Option<ResourceQoSStrategy>,
    #[serde(
        rename = "cpuBurstStrategy",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub cpu_burst_strategy: Option<CpuBurstStrategy>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct NodeSLOStatus {}

fn check_range(errors: &mut Vec<String>, field: &str, value: Option<i64>, min: i64, max: i64) {
    if let Some(v) = value {
        if v < min || v > max {
            errors.push(format!("{field}={v} out of range [{min}, {max}]"));
        }
    }
}

impl MemoryQoS {
    fn validate_into(&self, prefix: &str, errors: &mut Vec<String>) {
        check_range(errors, &format!("{prefix}.wmarkRatio"), self.wmark_ratio, 0, 100);
        check_range(
            errors,
            &format!("{prefix}.wmarkScalePermill"),
            self.wmark_scale_permill,
            1,
            1000,
        );
        check_range(errors, &format!("{prefix}.wmarkMinAdj"), self.wmark_min_adj, -25, 50);
        for (name, value) in [
            ("minLimitPercent", self.min_limit_percent),
            ("lowLimitPercent", self.low_limit_percent),
            ("throttlingPercent", self.throttling_percent),
        ] {
            check_range(errors, &format!("{prefix}.{name}"), value, 0, i64::MAX);
        }
    }
}

impl ResctrlQoS {
    fn validate_into(&self, prefix: &str, errors: &mut Vec<String>) {
        check_range(
            errors,
            &format!("{prefix}.catRangeStartPercent"),
            self.cat_range_start_percent,
            0,
            100,
        );
        check_range(
            errors,
            &format!("{prefix}.catRangeEndPercent"),
            self.cat_range_end_percent,
            0,
            100,
        );
        check_range(errors, &format!("{prefix}.mbaPercent"), self.mba_percent, 0, 100);
    }
}

impl NodeSLOSpec {
    /// Range-check every present percentage, returning one message per violation
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if let Some(t) = &self.resource_used_threshold_with_be {
            check_range(
                &mut errors,
                "cpuSuppressThresholdPercent",
                t.cpu_suppress_threshold_percent,
                0,
                100,
            );
            check_range(
                &mut errors,
                "memoryEvictThresholdPercent",
                t.memory_evict_threshold_percent,
                0,
                100,
            );
            check_range(
                &mut errors,
                "memoryEvictLowerPercent",
                t.memory_evict_lower_percent,
                0,
                100,
            );
        }

        if let Some(strategy) = &self.resource_qos_strategy {
            let classes = [
                ("lsr", &strategy.lsr),
                ("ls", &strategy.ls),
                ("be", &strategy.be),
                ("system", &strategy.system),
                ("cgroupRoot", &strategy.cgroup_root),
            ];
            for (name, class) in classes {
                let Some(class) = class else { continue };
                if let Some(memory) = &class.memory_qos {
                    memory
                        .memory_qos
                        .validate_into(&format!("{name}.memoryQoS"), &mut errors);
                }
                if let Some(resctrl) = &class.resctrl_qos {
                    resctrl
                        .resctrl_qos
                        .validate_into(&format!("{name}.resctrlQoS"), &mut errors);
                }
            }
        }

        if let Some(burst) = &self.cpu_burst_strategy {
            check_range(
                &mut errors,
                "cpuBurstPercent",
                burst.config.cpu_burst_percent,
                0,
                10000,
            );
            check_range(
                &mut errors,
                "cfsQuotaBurstPercent",
                burst.config.cfs_quota_burst_percent,
                100,
                i64::MAX,
            );
            check_range(
                &mut errors,
                "sharePoolThresholdPercent",
                burst.share_pool_threshold_percent,
                0,
                100,
            );
        }

        errors
    }
}
