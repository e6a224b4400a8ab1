//! Per-QoS-class memory cgroup protection and throttling

use super::PolicyContext;
use crate::cgroup::{write_file, MEMORY_HIGH, MEMORY_LOW, MEMORY_MIN};
use crate::features::Feature;
use crate::qos::{pod_memory_limit, pod_memory_request, qos_class, resource_qos_for};
use crate::scheduler::Reconciler;
use crate::slo::MemoryQoS;
use anyhow::{bail, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tokio::fs;
use tokio::sync::broadcast;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryValues {
    pub min: i64,
    pub low: i64,
    /// `None` renders as `max`
    pub high: Option<i64>,
}

impl MemoryValues {
    pub fn high_str(&self) -> String {
        self.high.map_or_else(|| "max".to_string(), |h| h.to_string())
    }
}

/// Derive the memory cgroup values of a pod from its requests and limits
pub fn memory_values(pod: &Pod, qos: &MemoryQoS) -> MemoryValues {
    let request = pod_memory_request(pod);
    let min = request * qos.min_limit_percent.unwrap_or(0) / 100;
    let low = request * qos.low_limit_percent.unwrap_or(0) / 100;
    let high = match (qos.throttling_percent.unwrap_or(0), pod_memory_limit(pod)) {
        (0, _) | (_, None) => None,
        (percent, Some(limit)) => Some(limit * percent / 100).filter(|h| *h > min),
    };
    MemoryValues { min, low, high }
}

pub struct CgroupReconciler {
    ctx: PolicyContext,
}

impl CgroupReconciler {
    pub fn new(ctx: PolicyContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Reconciler for CgroupReconciler {
    fn name(&self) -> &'static str {
        "cgroup-reconcile"
    }

    fn features(&self) -> Vec<Feature> {
        vec![Feature::CgroupReconcile]
    }

    async fn init(&self, _shutdown: broadcast::Receiver<()>) -> Result<()> {
        let kubepods = self.ctx.cgroups.kubepods_dir();
        if fs::metadata(&kubepods).await.is_err() {
            bail!("kubepods cgroup {} not found", kubepods.display());
        }
        Ok(())
    }

    async fn reconcile(&self) -> Result<()> {
        let Some(spec) = self.ctx.store.spec_snapshot() else {
            return Ok(());
        };
        let Some(strategy) = spec.resource_qos_strategy else {
            return Ok(());
        };

        for pod in self.ctx.states.get_all_pods() {
            let class = qos_class(&pod);
            let Some(cfg) = resource_qos_for(&strategy, class).and_then(|q| q.memory_qos.as_ref()) else {
                continue;
            };
            if cfg.enable != Some(true) {
                continue;
            }
            let Some(dir) = self.ctx.cgroups.pod_dir(&pod) else {
                continue;
            };
            if fs::metadata(&dir).await.is_err() {
                debug!(pod = %pod.name_any(), path = %dir.display(), "Pod cgroup not found");
                continue;
            }

            let values = memory_values(&pod, &cfg.memory_qos);
            for (file, value) in [
                (MEMORY_MIN, values.min.to_string()),
                (MEMORY_LOW, values.low.to_string()),
                (MEMORY_HIGH, values.high_str()),
            ] {
                if let Err(e) = write_file(&dir, file, &value).await {
                    warn!(pod = %pod.name_any(), qos = %class, file, error = %e, "Failed to update memory cgroup");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::CgroupLayout;
    use crate::policy::test_support::*;
    use crate::qos::test_support::pod;
    use crate::slo::{MemoryQoSCfg, NodeSLOSpec, ResourceQoS, ResourceQoSStrategy};

    const MI: i64 = 1024 * 1024;

    fn ls_memory_qos(min: i64, low: i64, throttling: i64) -> NodeSLOSpec {
        NodeSLOSpec {
            resource_qos_strategy: Some(ResourceQoSStrategy {
                ls: Some(ResourceQoS {
                    memory_qos: Some(MemoryQoSCfg {
                        enable: Some(true),
                        memory_qos: MemoryQoS {
                            min_limit_percent: Some(min),
                            low_limit_percent: Some(low),
                            throttling_percent: Some(throttling),
                            ..Default::default()
                        },
                    }),
                    resctrl_qos: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_memory_values() {
        let p = pod("ls", "u1", Some("LS"), &[("memory", "100Mi")], &[("memory", "200Mi")]);
        let qos = MemoryQoS {
            min_limit_percent: Some(50),
            low_limit_percent: Some(80),
            throttling_percent: Some(90),
            ..Default::default()
        };
        let values = memory_values(&p, &qos);
        assert_eq!(values.min, 50 * MI);
        assert_eq!(values.low, 80 * MI);
        assert_eq!(values.high, Some(180 * MI));

        let no_throttle = MemoryQoS {
            throttling_percent: Some(0),
            ..qos.clone()
        };
        assert_eq!(memory_values(&p, &no_throttle).high_str(), "max");

        // high at or below min falls back to max
        let tiny = MemoryQoS {
            min_limit_percent: Some(100),
            throttling_percent: Some(10),
            ..qos
        };
        assert_eq!(memory_values(&p, &tiny).high, None);
    }

    #[tokio::test]
    async fn test_writes_enabled_class_only() {
        let ls = pod("ls", "u1", Some("LS"), &[("memory", "100Mi")], &[("memory", "200Mi")]);
        let be = pod("be", "u2", Some("BE"), &[], &[]);
        let (ctx, cgroup_root, _proc) = context(
            Some(ls_memory_qos(100, 100, 80)),
            MockStatesInformer::with_pods(vec![ls.clone(), be.clone()]),
        );
        let layout = CgroupLayout::new(cgroup_root.path());
        let ls_dir = layout.pod_dir(&ls).unwrap();
        let be_dir = layout.pod_dir(&be).unwrap();
        for dir in [&ls_dir, &be_dir] {
            write(dir, MEMORY_MIN, "0");
            write(dir, MEMORY_LOW, "0");
            write(dir, MEMORY_HIGH, "max");
        }

        let reconciler = CgroupReconciler::new(ctx);
        reconciler.reconcile().await.unwrap();

        assert_eq!(read(&ls_dir, MEMORY_MIN), (100 * MI).to_string());
        assert_eq!(read(&ls_dir, MEMORY_LOW), (100 * MI).to_string());
        assert_eq!(read(&ls_dir, MEMORY_HIGH), (160 * MI).to_string());
        // BE memory QoS is disabled by default
        assert_eq!(read(&be_dir, MEMORY_MIN), "0");
    }

    #[tokio::test]
    async fn test_noop_without_spec() {
        let ls = pod("ls", "u1", Some("LS"), &[("memory", "100Mi")], &[("memory", "200Mi")]);
        let (ctx, cgroup_root, _proc) = context(None, MockStatesInformer::with_pods(vec![ls.clone()]));
        let dir = CgroupLayout::new(cgroup_root.path()).pod_dir(&ls).unwrap();
        write(&dir, MEMORY_MIN, "0");

        CgroupReconciler::new(ctx).reconcile().await.unwrap();
        assert_eq!(read(&dir, MEMORY_MIN), "0");
    }

    #[tokio::test]
    async fn test_init_requires_kubepods() {
        let (ctx, cgroup_root, _proc) = context(None, MockStatesInformer::default());
        let reconciler = CgroupReconciler::new(ctx);
        let (_tx, rx) = broadcast::channel(1);
        assert!(reconciler.init(rx.resubscribe()).await.is_err());

        std::fs::create_dir_all(cgroup_root.path().join("kubepods.slice")).unwrap();
        assert!(reconciler.init(rx).await.is_ok());
    }
}
