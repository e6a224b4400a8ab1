//! Reference policy reconcilers
//!
//! Each policy reads the merged NodeSLO spec on every tick and does nothing
//! until the first spec has been stored.

pub mod cgroup_reconcile;
pub mod cpu_burst;
pub mod cpu_suppress;
pub mod memory_evict;
pub mod resctrl;

pub use cgroup_reconcile::CgroupReconciler;
pub use cpu_burst::CpuBurstReconciler;
pub use cpu_suppress::CpuSuppressReconciler;
pub use memory_evict::MemoryEvictReconciler;
pub use resctrl::ResctrlReconciler;

use crate::cgroup::CgroupLayout;
use crate::evict::Evictor;
use crate::node_usage::NodeUsageReader;
use crate::observability::AgentMetrics;
use crate::runtime::RuntimeHandlerRegistry;
use crate::scheduler::PolicyRegistration;
use crate::slo::NodeSloStore;
use crate::states::StatesInformer;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Collaborators shared by all policies
#[derive(Clone)]
pub struct PolicyContext {
    pub store: Arc<NodeSloStore>,
    pub states: Arc<dyn StatesInformer>,
    pub cgroups: CgroupLayout,
    pub node_usage: Arc<NodeUsageReader>,
    pub metrics: AgentMetrics,
}

/// Cadence of each policy
#[derive(Debug, Clone)]
pub struct PolicyIntervals {
    pub reconcile: Duration,
    pub cpu_suppress: Duration,
    pub memory_evict: Duration,
}

impl Default for PolicyIntervals {
    fn default() -> Self {
        Self {
            reconcile: Duration::from_secs(1),
            cpu_suppress: Duration::from_secs(1),
            memory_evict: Duration::from_secs(1),
        }
    }
}

/// The five built-in policies, ready for the orchestrator
pub fn reference_policies(
    ctx: PolicyContext,
    evictor: Arc<Evictor>,
    runtimes: Arc<RuntimeHandlerRegistry>,
    resctrl_root: impl Into<PathBuf>,
    intervals: &PolicyIntervals,
) -> Vec<PolicyRegistration> {
    vec![
        PolicyRegistration::new(
            Arc::new(CgroupReconciler::new(ctx.clone())),
            intervals.reconcile,
        ),
        PolicyRegistration::new(
            Arc::new(CpuSuppressReconciler::new(ctx.clone())),
            intervals.cpu_suppress,
        ),
        PolicyRegistration::new(
            Arc::new(CpuBurstReconciler::new(ctx.clone())),
            intervals.reconcile,
        ),
        PolicyRegistration::new(
            Arc::new(MemoryEvictReconciler::new(ctx.clone(), evictor, runtimes)),
            intervals.memory_evict,
        ),
        PolicyRegistration::new(
            Arc::new(ResctrlReconciler::new(ctx, resctrl_root)),
            intervals.reconcile,
        ),
    ]
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::evict::test_support::{evictor, MockEvictionApi, MockRecorder};

    #[test]
    fn test_reference_policies_names() {
        let (ctx, _cg, _proc) = context(None, MockStatesInformer::default());
        let (evictor, _cache) = evictor(
            Arc::new(MockEvictionApi::default()),
            Arc::new(MockRecorder::default()),
            Duration::from_secs(300),
        );
        let policies = reference_policies(
            ctx,
            Arc::new(evictor),
            Arc::new(RuntimeHandlerRegistry::new()),
            "/sys/fs/resctrl",
            &PolicyIntervals::default(),
        );
        let names: Vec<_> = policies.iter().map(|p| p.reconciler.name()).collect();
        assert_eq!(
            names,
            vec!["cgroup-reconcile", "cpu-suppress", "cpu-burst", "memory-evict", "resctrl"]
        );
    }
}
