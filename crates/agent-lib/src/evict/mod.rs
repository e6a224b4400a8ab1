//! Pod eviction pipeline
//!
//! Deduplicates eviction requests through an expiring cache keyed by pod
//! UID, asks the API server for a graceful eviction, and reports the
//! outcome as a node event plus metrics. Direct container stops live in
//! [`kill`].

pub mod api;
pub mod kill;

pub use self::api::{KubeEventRecorder, KubeEvictionApi};
pub use self::kill::{kill_containers, KillReport};

use crate::audit::Auditor;
use crate::expire_cache::ExpireCache;
use crate::observability::{AgentMetrics, StructuredLogger};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const EVICT_POD_SUCCESS: &str = "evictPodSuccess";
pub const EVICT_POD_FAIL: &str = "evictPodFail";

#[derive(Debug, Error)]
pub enum EvictError {
    /// The pod is already gone
    #[error("pod {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },

    #[error("evict pod {namespace}/{name}: {source}")]
    Api {
        namespace: String,
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Graceful eviction through the pod disruption API
#[async_trait]
pub trait PodEvictionApi: Send + Sync {
    async fn evict(&self, namespace: &str, name: &str) -> Result<(), EvictError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

/// Fire-and-forget cluster event sink
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record_event(&self, node: &Node, event_type: EventType, reason: &str, message: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionOutcome {
    /// A live dedup entry exists; nothing was done
    AlreadyEvicted,
    Evicted,
    /// The API reported the pod absent; counted as success, not cached
    PodGone,
    Failed,
}

impl EvictionOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, EvictionOutcome::Failed)
    }
}

/// Dedup key: the pod UID, or namespace/name for pods without one
pub fn pod_key(pod: &Pod) -> String {
    match pod.metadata.uid.as_deref() {
        Some(uid) if !uid.is_empty() => uid.to_string(),
        _ => format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any()),
    }
}

pub struct Evictor {
    api: Arc<dyn PodEvictionApi>,
    recorder: Arc<dyn EventRecorder>,
    evicted: Arc<ExpireCache<String, String>>,
    auditor: Auditor,
    metrics: AgentMetrics,
    logger: StructuredLogger,
}

impl Evictor {
    pub fn new(
        api: Arc<dyn PodEvictionApi>,
        recorder: Arc<dyn EventRecorder>,
        evicted: Arc<ExpireCache<String, String>>,
        auditor: Auditor,
        metrics: AgentMetrics,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            api,
            recorder,
            evicted,
            auditor,
            metrics,
            logger,
        }
    }

    /// Evict `pod` unless it was evicted within the dedup window
    pub async fn evict_pod_if_not_evicted(
        &self,
        pod: &Pod,
        node: &Node,
        reason: &str,
        message: &str,
    ) -> EvictionOutcome {
        let key = pod_key(pod);
        if self.evicted.get(&key).is_some() {
            debug!(pod = %key, reason, "Pod has already been evicted");
            return EvictionOutcome::AlreadyEvicted;
        }

        let outcome = self.evict_pod(pod, node, reason, message).await;
        if outcome == EvictionOutcome::Evicted {
            if let Err(e) = self.evicted.set_default(key.clone(), key) {
                warn!(error = %e, "Failed to remember evicted pod");
            }
        }
        outcome
    }

    /// Apply [`Self::evict_pod_if_not_evicted`] to each pod independently
    pub async fn evict_pods_if_not_evicted(
        &self,
        pods: &[Arc<Pod>],
        node: &Node,
        reason: &str,
        message: &str,
    ) -> Vec<EvictionOutcome> {
        let mut outcomes = Vec::with_capacity(pods.len());
        for pod in pods {
            outcomes.push(self.evict_pod_if_not_evicted(pod, node, reason, message).await);
        }
        outcomes
    }

    async fn evict_pod(&self, pod: &Pod, node: &Node, reason: &str, message: &str) -> EvictionOutcome {
        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_any();
        let event_message = format!("evict Pod:{name}, reason: {reason}, message: {message}");

        self.auditor
            .pod(&namespace, &name)
            .reason(reason)
            .message(message)
            .record();

        match self.api.evict(&namespace, &name).await {
            Ok(()) => {
                self.recorder
                    .record_event(node, EventType::Warning, EVICT_POD_SUCCESS, &event_message)
                    .await;
                self.metrics.record_eviction(reason);
                self.logger.log_pod_evicted(&namespace, &name, reason);
                EvictionOutcome::Evicted
            }
            Err(EvictError::NotFound { .. }) => {
                info!(namespace = %namespace, pod = %name, reason, "Pod already gone, nothing to evict");
                EvictionOutcome::PodGone
            }
            Err(e) => {
                self.recorder
                    .record_event(node, EventType::Warning, EVICT_POD_FAIL, &event_message)
                    .await;
                self.metrics.record_eviction_failure(reason);
                error!(namespace = %namespace, pod = %name, reason, error = %e, "Failed to evict pod");
                EvictionOutcome::Failed
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_second_eviction_within_ttl_is_noop() {
        let api = Arc::new(MockEvictionApi::default());
        let recorder = Arc::new(MockRecorder::default());
        let (evictor, cache) = evictor(Arc::clone(&api), Arc::clone(&recorder), Duration::from_secs(300));
        let pod = pod("be-1", "uid-1");

        let first = evictor
            .evict_pod_if_not_evicted(&pod, &node(), "test-dedup", "memory pressure")
            .await;
        assert_eq!(first, EvictionOutcome::Evicted);
        assert_eq!(cache.get(&"uid-1".to_string()), Some("uid-1".to_string()));

        tokio::time::advance(Duration::from_secs(299)).await;
        let second = evictor
            .evict_pod_if_not_evicted(&pod, &node(), "test-dedup", "memory pressure")
            .await;
        assert_eq!(second, EvictionOutcome::AlreadyEvicted);

        assert_eq!(api.calls().len(), 1);
        let events = recorder.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0],
            (
                EventType::Warning,
                EVICT_POD_SUCCESS.to_string(),
                "evict Pod:be-1, reason: test-dedup, message: memory pressure".to_string()
            )
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_eligible_again_after_ttl() {
        let api = Arc::new(MockEvictionApi::default());
        let (evictor, _cache) = evictor(
            Arc::clone(&api),
            Arc::new(MockRecorder::default()),
            Duration::from_secs(300),
        );
        let pod = pod("be-1", "uid-1");

        evictor.evict_pod_if_not_evicted(&pod, &node(), "test-expiry", "").await;
        tokio::time::advance(Duration::from_secs(301)).await;
        let outcome = evictor.evict_pod_if_not_evicted(&pod, &node(), "test-expiry", "").await;

        assert_eq!(outcome, EvictionOutcome::Evicted);
        assert_eq!(api.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_not_found_is_success_without_cache_entry() {
        let api = Arc::new(MockEvictionApi {
            missing: ["gone".to_string()].into(),
            ..Default::default()
        });
        let recorder = Arc::new(MockRecorder::default());
        let (evictor, cache) = evictor(Arc::clone(&api), Arc::clone(&recorder), Duration::from_secs(300));
        let pod = pod("gone", "uid-gone");

        let outcome = evictor.evict_pod_if_not_evicted(&pod, &node(), "test-gone", "").await;
        assert_eq!(outcome, EvictionOutcome::PodGone);
        assert!(outcome.is_success());
        assert!(cache.get(&"uid-gone".to_string()).is_none());
        assert!(recorder.events.lock().unwrap().is_empty());

        // not cached, so the next call asks the API again
        evictor.evict_pod_if_not_evicted(&pod, &node(), "test-gone", "").await;
        assert_eq!(api.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_failure_records_event_and_skips_cache() {
        let api = Arc::new(MockEvictionApi {
            failing: ["a".to_string()].into(),
            ..Default::default()
        });
        let recorder = Arc::new(MockRecorder::default());
        let (evictor, cache) = evictor(Arc::clone(&api), Arc::clone(&recorder), Duration::from_secs(300));

        let outcome = evictor
            .evict_pod_if_not_evicted(&pod("a", "uid-a"), &node(), "test-fail", "")
            .await;
        assert_eq!(outcome, EvictionOutcome::Failed);
        assert!(cache.is_empty());

        let events = recorder.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, EventType::Warning);
        assert_eq!(events[0].1, EVICT_POD_FAIL);
    }

    #[tokio::test]
    async fn test_batch_continues_after_failure() {
        let api = Arc::new(MockEvictionApi {
            failing: ["a".to_string()].into(),
            ..Default::default()
        });
        let (evictor, _cache) = evictor(
            Arc::clone(&api),
            Arc::new(MockRecorder::default()),
            Duration::from_secs(300),
        );
        let pods = vec![Arc::new(pod("a", "uid-a")), Arc::new(pod("b", "uid-b"))];

        let outcomes = evictor
            .evict_pods_if_not_evicted(&pods, &node(), "test-batch", "")
            .await;

        assert_eq!(outcomes, vec![EvictionOutcome::Failed, EvictionOutcome::Evicted]);
        assert_eq!(api.calls(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_pod_key_falls_back_to_name() {
        let mut p = pod("web", "uid-9");
        assert_eq!(pod_key(&p), "uid-9");
        p.metadata.uid = None;
        assert_eq!(pod_key(&p), "default/web");
    }
}
