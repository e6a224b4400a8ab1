//! Field-level merge of a pushed NodeSLO spec over the node defaults
//!
//! Each leaf present in the pushed spec wins; every absent leaf keeps the
//! default. Blocks are never replaced wholesale.

use super::defaults::{none_memory_qos, none_resctrl_qos};
use super::types::*;
use crate::features::{Feature, FeatureGates};

/// Overlay the present leaves of `other` onto `self`
pub trait Merge {
    fn merge_from(&mut self, other: &Self);
}

macro_rules! merge_leaves {
    ($ty:ty { $($field:ident),* $(,)? }) => {
        impl Merge for $ty {
            fn merge_from(&mut self, other: &Self) {
                $(
                    if other.$field.is_some() {
                        self.$field = other.$field.clone();
                    }
                )*
            }
        }
    };
}

merge_leaves!(ResourceThresholdStrategy {
    enable,
    cpu_suppress_threshold_percent,
    cpu_suppress_policy,
    memory_evict_threshold_percent,
    memory_evict_lower_percent,
});

merge_leaves!(MemoryQoS {
    min_limit_percent,
    low_limit_percent,
    throttling_percent,
    wmark_ratio,
    wmark_scale_permill,
    wmark_min_adj,
    priority_enable,
    priority,
    oom_kill_group,
});

merge_leaves!(ResctrlQoS {
    cat_range_start_percent,
    cat_range_end_percent,
    mba_percent,
});

merge_leaves!(CpuBurstConfig {
    policy,
    cpu_burst_percent,
    cfs_quota_burst_percent,
    cfs_quota_burst_period_seconds,
});

/// Merge an optional block: recurse when both sides exist, adopt `other`
/// when only it exists, keep `base` otherwise.
pub fn merge_option<T: Merge + Clone>(base: &mut Option<T>, other: &Option<T>) {
    match (base.as_mut(), other) {
        (Some(b), Some(o)) => b.merge_from(o),
        (None, Some(o)) => *base = Some(o.clone()),
        _ => {}
    }
}

impl Merge for MemoryQoSCfg {
    fn merge_from(&mut self, other: &Self) {
        if other.enable.is_some() {
            self.enable = other.enable;
        }
        self.memory_qos.merge_from(&other.memory_qos);
    }
}

impl Merge for ResctrlQoSCfg {
    fn merge_from(&mut self, other: &Self) {
        if other.enable.is_some() {
            self.enable = other.enable;
        }
        self.resctrl_qos.merge_from(&other.resctrl_qos);
    }
}

impl Merge for ResourceQoS {
    fn merge_from(&mut self, other: &Self) {
        merge_option(&mut self.memory_qos, &other.memory_qos);
        merge_option(&mut self.resctrl_qos, &other.resctrl_qos);
    }
}

impl Merge for ResourceQoSStrategy {
    fn merge_from(&mut self, other: &Self) {
        merge_option(&mut self.lsr, &other.lsr);
        merge_option(&mut self.ls, &other.ls);
        merge_option(&mut self.be, &other.be);
        merge_option(&mut self.system, &other.system);
        merge_option(&mut self.cgroup_root, &other.cgroup_root);
    }
}

impl Merge for CpuBurstStrategy {
    fn merge_from(&mut self, other: &Self) {
        self.config.merge_from(&other.config);
        if other.share_pool_threshold_percent.is_some() {
            self.share_pool_threshold_percent = other.share_pool_threshold_percent;
        }
    }
}

impl Merge for NodeSLOSpec {
    fn merge_from(&mut self, other: &Self) {
        merge_option(
            &mut self.resource_used_threshold_with_be,
            &other.resource_used_threshold_with_be,
        );
        merge_option(&mut self.resource_qos_strategy, &other.resource_qos_strategy);
        merge_option(&mut self.cpu_burst_strategy, &other.cpu_burst_strategy);
    }
}

/// Turn off disabled sub-policies and blank out their parameters.
///
/// With `resctrl_enabled == false` every class loses resctrl regardless of
/// what was pushed. A sub-policy whose `enable` is false carries the "none"
/// values afterwards.
pub fn disable_inactive_qos(strategy: &mut ResourceQoSStrategy, resctrl_enabled: bool) {
    for class in strategy.classes_mut().into_iter().flatten() {
        if let Some(memory) = class.memory_qos.as_mut() {
            if memory.enable != Some(true) {
                memory.enable = Some(false);
                memory.memory_qos = none_memory_qos();
            }
        }
        if let Some(resctrl) = class.resctrl_qos.as_mut() {
            if !resctrl_enabled {
                resctrl.enable = Some(false);
            }
            if resctrl.enable != Some(true) {
                resctrl.enable = Some(false);
                resctrl.resctrl_qos = none_resctrl_qos();
            }
        }
    }
}

/// Merge `incoming` over `defaults` and apply the disable pass
pub fn merge_node_slo_spec(
    defaults: &NodeSLOSpec,
    incoming: &NodeSLOSpec,
    gates: &FeatureGates,
) -> NodeSLOSpec {
    let mut merged = defaults.clone();
    merged.merge_from(incoming);
    if let Some(strategy) = merged.resource_qos_strategy.as_mut() {
        disable_inactive_qos(strategy, gates.is_enabled(Feature::RdtResctrl));
    }
    merged
}
