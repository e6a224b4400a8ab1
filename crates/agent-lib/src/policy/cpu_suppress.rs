//! Best-effort CPU suppression
//!
//! BE pods get what is left of the threshold after the non-BE usage:
//! `node_cpus * threshold / 100 - (node_used - be_used)`, never below
//! [`MIN_BE_CPUS`].

use super::PolicyContext;
use crate::cgroup::{
    format_cpuset, parse_cpu_stat, read_file, write_file, CpuMax, CPUSET_CPUS, CPU_MAX, CPU_STAT,
    DEFAULT_CFS_PERIOD_US,
};
use crate::features::{is_feature_disabled, Feature};
use crate::qos::KubeQoSClass;
use crate::scheduler::Reconciler;
use crate::slo::defaults::DEFAULT_CPU_SUPPRESS_THRESHOLD_PERCENT;
use crate::slo::CpuSuppressPolicy;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

pub const MIN_BE_CPUS: f64 = 2.0;

pub fn be_cpu_allowance(node_cpus: f64, threshold_percent: i64, node_used: f64, be_used: f64) -> f64 {
    let non_be_used = (node_used - be_used).max(0.0);
    let allowance = node_cpus * threshold_percent as f64 / 100.0 - non_be_used;
    allowance.max(MIN_BE_CPUS).min(node_cpus.max(MIN_BE_CPUS))
}

pub struct CpuSuppressReconciler {
    ctx: PolicyContext,
    last_be_sample: Mutex<Option<(u64, Instant)>>,
}

impl CpuSuppressReconciler {
    pub fn new(ctx: PolicyContext) -> Self {
        Self {
            ctx,
            last_be_sample: Mutex::new(None),
        }
    }

    /// Cores used by the BE tier since the previous sample
    async fn be_used_cores(&self) -> Result<Option<f64>> {
        let be_dir = self.ctx.cgroups.qos_dir(KubeQoSClass::BestEffort);
        let usage_usec = parse_cpu_stat(&read_file(&be_dir, CPU_STAT).await?).usage_usec;
        let now = Instant::now();
        let previous = self
            .last_be_sample
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace((usage_usec, now));
        let Some((last_usage, last_at)) = previous else {
            return Ok(None);
        };
        let elapsed_usec = now.duration_since(last_at).as_micros() as f64;
        if elapsed_usec <= 0.0 {
            return Ok(Some(0.0));
        }
        Ok(Some(usage_usec.saturating_sub(last_usage) as f64 / elapsed_usec))
    }

    async fn apply(&self, policy: CpuSuppressPolicy, allowance: f64, node_cpus: usize) -> Result<()> {
        let be_dir = self.ctx.cgroups.qos_dir(KubeQoSClass::BestEffort);
        let all_cpus: Vec<u32> = (0..node_cpus as u32).collect();
        match policy {
            CpuSuppressPolicy::CfsQuota => {
                let quota = CpuMax {
                    quota_us: Some((allowance * DEFAULT_CFS_PERIOD_US as f64).round() as i64),
                    period_us: DEFAULT_CFS_PERIOD_US,
                };
                if write_file(&be_dir, CPU_MAX, &quota.format()).await? {
                    info!(allowance, quota = %quota.format(), "Suppressed BE cfs quota");
                }
                write_file(&be_dir, CPUSET_CPUS, &format_cpuset(&all_cpus)).await?;
            }
            CpuSuppressPolicy::CpuSet => {
                let count = (allowance.ceil() as usize).clamp(1, node_cpus.max(1));
                let cpuset = format_cpuset(&all_cpus[..count.min(all_cpus.len())]);
                if write_file(&be_dir, CPUSET_CPUS, &cpuset).await? {
                    info!(allowance, cpuset = %cpuset, "Suppressed BE cpuset");
                }
                let unlimited = CpuMax {
                    quota_us: None,
                    period_us: DEFAULT_CFS_PERIOD_US,
                };
                write_file(&be_dir, CPU_MAX, &unlimited.format()).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for CpuSuppressReconciler {
    fn name(&self) -> &'static str {
        "cpu-suppress"
    }

    fn features(&self) -> Vec<Feature> {
        vec![Feature::BeCpuSuppress]
    }

    async fn reconcile(&self) -> Result<()> {
        let spec = self.ctx.store.spec_snapshot();
        match is_feature_disabled(spec.as_ref(), Feature::BeCpuSuppress) {
            Ok(false) => {}
            Ok(true) => {
                debug!("BE cpu suppress disabled by NodeSLO");
                return Ok(());
            }
            Err(e) => {
                debug!(error = %e, "Cannot determine BE cpu suppress config, skipping");
                return Ok(());
            }
        }
        let Some(threshold) = spec.and_then(|s| s.resource_used_threshold_with_be) else {
            return Ok(());
        };

        let node_cpus = self.ctx.node_usage.num_cpus().await?;
        let node_used = self.ctx.node_usage.cpu_used_cores().await?;
        let be_used = self.be_used_cores().await?;
        let (Some(node_used), Some(be_used)) = (node_used, be_used) else {
            debug!("Waiting for a second cpu usage sample");
            return Ok(());
        };

        let percent = threshold
            .cpu_suppress_threshold_percent
            .unwrap_or(DEFAULT_CPU_SUPPRESS_THRESHOLD_PERCENT);
        let allowance = be_cpu_allowance(node_cpus as f64, percent, node_used, be_used);
        let policy = threshold.cpu_suppress_policy.unwrap_or(CpuSuppressPolicy::CpuSet);
        self.apply(policy, allowance, node_cpus).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::CgroupLayout;
    use crate::policy::test_support::*;
    use crate::slo::{NodeSLOSpec, ResourceThresholdStrategy};

    fn proc_stat(user: u64, idle: u64) -> String {
        let mut content = format!("cpu  {user} 0 0 {idle} 0 0 0 0 0 0\n");
        for cpu in 0..4 {
            content.push_str(&format!("cpu{cpu} 0 0 0 0 0 0 0 0 0 0\n"));
        }
        content
    }

    fn spec(enable: bool, percent: i64, policy: CpuSuppressPolicy) -> NodeSLOSpec {
        NodeSLOSpec {
            resource_used_threshold_with_be: Some(ResourceThresholdStrategy {
                enable: Some(enable),
                cpu_suppress_threshold_percent: Some(percent),
                cpu_suppress_policy: Some(policy),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_allowance() {
        assert!((be_cpu_allowance(8.0, 50, 3.0, 1.0) - 2.0).abs() < 1e-9);
        assert!((be_cpu_allowance(16.0, 50, 3.0, 1.0) - 6.0).abs() < 1e-9);
        // floored
        assert_eq!(be_cpu_allowance(4.0, 10, 4.0, 0.0), MIN_BE_CPUS);
    }

    async fn run_two_samples(policy: CpuSuppressPolicy, enable: bool) -> (tempfile::TempDir, std::path::PathBuf) {
        let (ctx, cgroup_root, proc_root) = context(Some(spec(enable, 90, policy)), MockStatesInformer::default());
        let be_dir = CgroupLayout::new(cgroup_root.path()).qos_dir(KubeQoSClass::BestEffort);
        write(&be_dir, CPU_STAT, "usage_usec 1000\nnr_periods 0\nnr_throttled 0\n");
        write(&be_dir, CPU_MAX, "max 100000");
        write(&be_dir, CPUSET_CPUS, "0-3");

        let reconciler = CpuSuppressReconciler::new(ctx);
        write(proc_root.path(), "stat", &proc_stat(0, 0));
        reconciler.reconcile().await.unwrap();
        // 100 busy of 400 jiffies on 4 cpus: 1 core used, none of it BE
        write(proc_root.path(), "stat", &proc_stat(100, 300));
        reconciler.reconcile().await.unwrap();
        (cgroup_root, be_dir)
    }

    #[tokio::test]
    async fn test_cpuset_policy() {
        let (_root, be_dir) = run_two_samples(CpuSuppressPolicy::CpuSet, true).await;
        // 4 * 0.9 - 1 = 2.6 -> 3 cpus
        assert_eq!(read(&be_dir, CPUSET_CPUS), "0-2");
        assert_eq!(read(&be_dir, CPU_MAX), "max 100000");
    }

    #[tokio::test]
    async fn test_cfs_quota_policy() {
        let (_root, be_dir) = run_two_samples(CpuSuppressPolicy::CfsQuota, true).await;
        assert_eq!(read(&be_dir, CPU_MAX), "260000 100000");
        assert_eq!(read(&be_dir, CPUSET_CPUS), "0-3");
    }

    #[tokio::test]
    async fn test_disabled_in_spec_writes_nothing() {
        let (_root, be_dir) = run_two_samples(CpuSuppressPolicy::CpuSet, false).await;
        assert_eq!(read(&be_dir, CPUSET_CPUS), "0-3");
    }

    #[tokio::test]
    async fn test_fail_closed_without_spec() {
        let (ctx, _cg, proc_root) = context(None, MockStatesInformer::default());
        // would error on missing files if it got past the gate
        assert!(!proc_root.path().join("stat").exists());
        CpuSuppressReconciler::new(ctx).reconcile().await.unwrap();
    }
}
