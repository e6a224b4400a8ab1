//! CPU burst for latency-sensitive containers
//!
//! Two mechanisms, selected by the burst policy:
//! - `cpu.max.burst` set to a percentage of the container quota
//! - CFS quota scale-up while the container keeps getting throttled, reverted
//!   once the node gets busy or the burst period runs out

use super::PolicyContext;
use crate::cgroup::{
    parse_cpu_max, parse_cpu_stat, read_file, write_file, CpuMax, CPU_MAX, CPU_MAX_BURST, CPU_STAT,
    DEFAULT_CFS_PERIOD_US,
};
use crate::features::Feature;
use crate::qos::{container_cpu_limit_millis, qos_class};
use crate::scheduler::Reconciler;
use crate::slo::defaults::{
    DEFAULT_CFS_QUOTA_BURST_PERCENT, DEFAULT_CPU_BURST_PERCENT, DEFAULT_SHARE_POOL_THRESHOLD_PERCENT,
};
use crate::slo::{CpuBurstPolicy, CpuBurstStrategy};
use anyhow::{bail, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Quota growth per throttled tick, in percent
const QUOTA_SCALE_UP_PERCENT: i64 = 20;

#[derive(Debug, Clone, Copy)]
struct BurstState {
    last_nr_throttled: u64,
    bursted_since: Option<Instant>,
}

pub struct CpuBurstReconciler {
    ctx: PolicyContext,
    containers: Mutex<HashMap<PathBuf, BurstState>>,
}

/// Resolved burst parameters
#[derive(Debug, Clone, Copy)]
struct BurstParams {
    policy: CpuBurstPolicy,
    cpu_burst_percent: i64,
    cfs_quota_burst_percent: i64,
    burst_period: Option<Duration>,
    share_pool_threshold_percent: i64,
}

impl BurstParams {
    fn from_strategy(strategy: &CpuBurstStrategy) -> Self {
        let config = &strategy.config;
        Self {
            policy: config.policy.unwrap_or(CpuBurstPolicy::None),
            cpu_burst_percent: config.cpu_burst_percent.unwrap_or(DEFAULT_CPU_BURST_PERCENT),
            cfs_quota_burst_percent: config
                .cfs_quota_burst_percent
                .unwrap_or(DEFAULT_CFS_QUOTA_BURST_PERCENT),
            burst_period: config
                .cfs_quota_burst_period_seconds
                .filter(|s| *s >= 0)
                .map(|s| Duration::from_secs(s as u64)),
            share_pool_threshold_percent: strategy
                .share_pool_threshold_percent
                .unwrap_or(DEFAULT_SHARE_POOL_THRESHOLD_PERCENT),
        }
    }
}

impl CpuBurstReconciler {
    pub fn new(ctx: PolicyContext) -> Self {
        Self {
            ctx,
            containers: Mutex::new(HashMap::new()),
        }
    }

    async fn node_cpu_percent(&self) -> Option<f64> {
        let cpus = self.ctx.node_usage.num_cpus().await.ok()?;
        let used = self.ctx.node_usage.cpu_used_cores().await.ok()??;
        (cpus > 0).then(|| used * 100.0 / cpus as f64)
    }

    /// `(container cgroup, base quota)` for every container with a CPU limit
    fn burstable_containers(&self, pod: &Pod) -> Vec<(PathBuf, i64)> {
        let statuses = pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_deref())
            .unwrap_or_default();
        let containers = pod.spec.as_ref().map(|s| s.containers.as_slice()).unwrap_or_default();

        containers
            .iter()
            .filter_map(|container| {
                let limit_millis = container_cpu_limit_millis(container)?;
                let id = statuses
                    .iter()
                    .find(|s| s.name == container.name)?
                    .container_id
                    .as_deref()?;
                let dir = self.ctx.cgroups.container_dir(pod, id)?;
                Some((dir, limit_millis * DEFAULT_CFS_PERIOD_US as i64 / 1000))
            })
            .collect()
    }

    async fn reconcile_container(
        &self,
        dir: &Path,
        base_quota: i64,
        params: &BurstParams,
        node_overloaded: bool,
    ) -> Result<()> {
        let burst = if params.policy.cpu_burst_enabled() {
            base_quota * params.cpu_burst_percent / 100
        } else {
            0
        };
        write_file(dir, CPU_MAX_BURST, &burst.to_string()).await?;

        let current = parse_cpu_max(&read_file(dir, CPU_MAX).await?)?;
        let nr_throttled = parse_cpu_stat(&read_file(dir, CPU_STAT).await?).nr_throttled;
        let now = Instant::now();

        let target = {
            let mut containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
            let state = containers.entry(dir.to_path_buf()).or_insert(BurstState {
                last_nr_throttled: nr_throttled,
                bursted_since: None,
            });
            let throttled = nr_throttled > state.last_nr_throttled;
            state.last_nr_throttled = nr_throttled;
            let expired = match (state.bursted_since, params.burst_period) {
                (Some(since), Some(period)) => now.duration_since(since) >= period,
                _ => false,
            };
            let current_quota = current.quota_us.unwrap_or(base_quota);

            let target = if !params.policy.cfs_quota_burst_enabled() || node_overloaded || expired {
                base_quota
            } else if throttled {
                let ceiling = base_quota * params.cfs_quota_burst_percent / 100;
                (current_quota + current_quota * QUOTA_SCALE_UP_PERCENT / 100).min(ceiling).max(base_quota)
            } else {
                current_quota.max(base_quota)
            };
            state.bursted_since = match (target > base_quota, state.bursted_since) {
                (true, None) => Some(now),
                (true, since) => since,
                (false, _) => None,
            };
            target
        };

        if current.quota_us != Some(target) {
            let quota = CpuMax {
                quota_us: Some(target),
                period_us: current.period_us,
            };
            write_file(dir, CPU_MAX, &quota.format()).await?;
            info!(path = %dir.display(), base_quota, quota = target, "Adjusted cfs quota");
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for CpuBurstReconciler {
    fn name(&self) -> &'static str {
        "cpu-burst"
    }

    fn features(&self) -> Vec<Feature> {
        vec![Feature::CpuBurst]
    }

    async fn init(&self, _shutdown: tokio::sync::broadcast::Receiver<()>) -> Result<()> {
        let probe = self.ctx.cgroups.kubepods_dir().join(CPU_MAX_BURST);
        if fs::metadata(&probe).await.is_err() {
            bail!("kernel does not support cpu.max.burst ({} missing)", probe.display());
        }
        Ok(())
    }

    async fn reconcile(&self) -> Result<()> {
        let Some(spec) = self.ctx.store.spec_snapshot() else {
            return Ok(());
        };
        let Some(strategy) = spec.cpu_burst_strategy else {
            return Ok(());
        };
        let params = BurstParams::from_strategy(&strategy);
        let node_overloaded = self
            .node_cpu_percent()
            .await
            .is_some_and(|p| p > params.share_pool_threshold_percent as f64);
        if node_overloaded {
            debug!(threshold = params.share_pool_threshold_percent, "Node over share pool threshold");
        }

        let mut live = Vec::new();
        for pod in self.ctx.states.get_all_pods() {
            if !qos_class(&pod).is_ls() {
                continue;
            }
            for (dir, base_quota) in self.burstable_containers(&pod) {
                if fs::metadata(&dir).await.is_err() {
                    continue;
                }
                if let Err(e) = self.reconcile_container(&dir, base_quota, &params, node_overloaded).await {
                    warn!(pod = %pod.name_any(), path = %dir.display(), error = %e, "Failed to apply cpu burst");
                }
                live.push(dir);
            }
        }
        self.containers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|dir, _| live.contains(dir));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::CgroupLayout;
    use crate::policy::test_support::*;
    use crate::qos::test_support::pod;
    use crate::slo::{CpuBurstConfig, NodeSLOSpec};
    use k8s_openapi::api::core::v1::{ContainerState, ContainerStateRunning, ContainerStatus, PodStatus};

    fn ls_pod() -> Pod {
        let mut p = pod("ls", "u1", Some("LS"), &[], &[("cpu", "2"), ("memory", "1Gi")]);
        p.status = Some(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: "main".to_string(),
                container_id: Some("containerd://abc".to_string()),
                state: Some(ContainerState {
                    running: Some(ContainerStateRunning::default()),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        });
        p
    }

    fn burst_spec(policy: CpuBurstPolicy) -> NodeSLOSpec {
        NodeSLOSpec {
            cpu_burst_strategy: Some(CpuBurstStrategy {
                config: CpuBurstConfig {
                    policy: Some(policy),
                    cfs_quota_burst_percent: Some(150),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn setup(policy: CpuBurstPolicy) -> (CpuBurstReconciler, tempfile::TempDir, PathBuf) {
        let p = ls_pod();
        let (ctx, cgroup_root, _proc) = context(Some(burst_spec(policy)), MockStatesInformer::with_pods(vec![p.clone()]));
        let dir = CgroupLayout::new(cgroup_root.path())
            .container_dir(&p, "containerd://abc")
            .unwrap();
        write(&dir, CPU_MAX, "200000 100000");
        write(&dir, CPU_MAX_BURST, "0");
        write(&dir, CPU_STAT, "nr_periods 10\nnr_throttled 0\n");
        (CpuBurstReconciler::new(ctx), cgroup_root, dir)
    }

    #[tokio::test]
    async fn test_cpu_burst_only() {
        let (reconciler, _root, dir) = setup(CpuBurstPolicy::CpuBurstOnly);
        write(&dir, CPU_STAT, "nr_periods 20\nnr_throttled 5\n");
        reconciler.reconcile().await.unwrap();

        // 2 cpus * 1000 %
        assert_eq!(read(&dir, CPU_MAX_BURST), "2000000");
        assert_eq!(read(&dir, CPU_MAX), "200000 100000");
    }

    #[tokio::test]
    async fn test_auto_scales_quota_while_throttled() {
        let (reconciler, _root, dir) = setup(CpuBurstPolicy::Auto);
        reconciler.reconcile().await.unwrap();
        assert_eq!(read(&dir, CPU_MAX), "200000 100000");

        write(&dir, CPU_STAT, "nr_periods 20\nnr_throttled 3\n");
        reconciler.reconcile().await.unwrap();
        assert_eq!(read(&dir, CPU_MAX), "240000 100000");

        write(&dir, CPU_STAT, "nr_periods 30\nnr_throttled 9\n");
        reconciler.reconcile().await.unwrap();
        // capped at 150 % of the base quota
        assert_eq!(read(&dir, CPU_MAX), "288000 100000");
        write(&dir, CPU_STAT, "nr_periods 40\nnr_throttled 12\n");
        reconciler.reconcile().await.unwrap();
        assert_eq!(read(&dir, CPU_MAX), "300000 100000");
    }

    #[tokio::test]
    async fn test_none_resets_burst_and_quota() {
        let (reconciler, _root, dir) = setup(CpuBurstPolicy::None);
        write(&dir, CPU_MAX, "300000 100000");
        write(&dir, CPU_MAX_BURST, "123");
        reconciler.reconcile().await.unwrap();

        assert_eq!(read(&dir, CPU_MAX_BURST), "0");
        assert_eq!(read(&dir, CPU_MAX), "200000 100000");
    }
}
