//! Best-effort pod eviction under node memory pressure

use super::PolicyContext;
use crate::cgroup::{read_u64, MEMORY_CURRENT};
use crate::evict::kill::kill_containers;
use crate::evict::Evictor;
use crate::features::{is_feature_disabled, Feature};
use crate::qos::{pod_priority, qos_class, QoSClass};
use crate::runtime::RuntimeHandlerRegistry;
use crate::scheduler::Reconciler;
use crate::slo::defaults::{DEFAULT_MEMORY_EVICT_THRESHOLD_PERCENT, MEMORY_EVICT_LOWER_GAP_PERCENT};
use anyhow::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const EVICT_REASON_MEMORY: &str = "EvictPodByNodeMemoryUsage";

/// Wait after an eviction round for the freed memory to show up
const EVICT_COOLDOWN: Duration = Duration::from_secs(4);

/// A BE pod and its current memory usage
#[derive(Debug, Clone)]
pub struct EvictCandidate {
    pub pod: Arc<Pod>,
    pub usage_bytes: u64,
}

/// Order candidates by priority (lowest first), then usage (largest first),
/// and keep the shortest prefix releasing at least `need_bytes`
pub fn select_victims(mut candidates: Vec<EvictCandidate>, need_bytes: u64) -> Vec<EvictCandidate> {
    candidates.sort_by(|a, b| {
        pod_priority(&a.pod)
            .cmp(&pod_priority(&b.pod))
            .then(b.usage_bytes.cmp(&a.usage_bytes))
    });
    let mut released = 0u64;
    candidates
        .into_iter()
        .take_while(|c| {
            let take = released < need_bytes;
            released += c.usage_bytes;
            take
        })
        .collect()
}

fn is_terminated(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

pub struct MemoryEvictReconciler {
    ctx: PolicyContext,
    evictor: Arc<Evictor>,
    runtimes: Arc<RuntimeHandlerRegistry>,
    last_evicted_at: Mutex<Option<Instant>>,
}

impl MemoryEvictReconciler {
    pub fn new(ctx: PolicyContext, evictor: Arc<Evictor>, runtimes: Arc<RuntimeHandlerRegistry>) -> Self {
        Self {
            ctx,
            evictor,
            runtimes,
            last_evicted_at: Mutex::new(None),
        }
    }

    async fn candidates(&self) -> Vec<EvictCandidate> {
        let mut candidates = Vec::new();
        for pod in self.ctx.states.get_all_pods() {
            if qos_class(&pod) != QoSClass::Be || is_terminated(&pod) {
                continue;
            }
            let usage_bytes = match self.ctx.cgroups.pod_dir(&pod) {
                Some(dir) => read_u64(&dir, MEMORY_CURRENT).await.unwrap_or(0),
                None => 0,
            };
            candidates.push(EvictCandidate { pod, usage_bytes });
        }
        candidates
    }

    fn cooling_down(&self) -> bool {
        self.last_evicted_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some_and(|at| at.elapsed() < EVICT_COOLDOWN)
    }
}

#[async_trait]
impl Reconciler for MemoryEvictReconciler {
    fn name(&self) -> &'static str {
        "memory-evict"
    }

    fn features(&self) -> Vec<Feature> {
        vec![Feature::BeMemoryEvict]
    }

    async fn reconcile(&self) -> Result<()> {
        let spec = self.ctx.store.spec_snapshot();
        match is_feature_disabled(spec.as_ref(), Feature::BeMemoryEvict) {
            Ok(false) => {}
            Ok(true) => {
                debug!("BE memory evict disabled by NodeSLO");
                return Ok(());
            }
            Err(e) => {
                debug!(error = %e, "Cannot determine BE memory evict config, skipping");
                return Ok(());
            }
        }
        if self.cooling_down() {
            return Ok(());
        }
        let Some(threshold) = spec.and_then(|s| s.resource_used_threshold_with_be) else {
            return Ok(());
        };
        let upper = threshold
            .memory_evict_threshold_percent
            .unwrap_or(DEFAULT_MEMORY_EVICT_THRESHOLD_PERCENT);
        let lower = threshold
            .memory_evict_lower_percent
            .unwrap_or(upper - MEMORY_EVICT_LOWER_GAP_PERCENT);
        if lower >= upper {
            warn!(upper, lower, "Memory evict lower percent must be below the threshold");
            return Ok(());
        }

        let memory = self.ctx.node_usage.memory().await?;
        let usage = memory.usage_percent();
        if usage < upper as f64 {
            return Ok(());
        }
        let need_bytes = (memory.total_bytes as f64 * (usage - lower as f64) / 100.0) as u64;

        let Some(node) = self.ctx.states.get_node() else {
            warn!("Node not available, cannot evict");
            return Ok(());
        };
        let victims = select_victims(self.candidates().await, need_bytes);
        if victims.is_empty() {
            info!(usage, threshold = upper, "Node memory over threshold but no BE pods to evict");
            return Ok(());
        }

        let message = format!("node memory usage {usage:.1}% exceeds threshold {upper}%, releasing to {lower}%");
        info!(usage, threshold = upper, need_bytes, victims = victims.len(), "Evicting BE pods for memory");
        for victim in &victims {
            let report = kill_containers(&victim.pod, &message, &self.runtimes, &self.ctx.metrics).await;
            debug!(pod = %victim.pod.name_any(), stopped = report.stopped.len(), failed = report.failed.len(), "Killed BE containers");
            self.evictor
                .evict_pod_if_not_evicted(&victim.pod, &node, EVICT_REASON_MEMORY, &message)
                .await;
        }
        *self.last_evicted_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        Ok(())
    }
}
