//! Direct container stop, bypassing graceful eviction

use crate::observability::AgentMetrics;
use crate::runtime::{parse_container_id, RuntimeHandlerRegistry};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{error, warn};

/// Grace period given to the runtime; the container is killed at once
const STOP_TIMEOUT_SECS: i64 = 0;

/// Per-container result of [`kill_containers`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KillReport {
    pub stopped: Vec<String>,
    /// Containers without a status, not running, or without an id
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

/// Stop every running container of `pod` through its runtime.
///
/// Each container is handled on its own: a failed lookup or stop is logged
/// and the remaining containers are still attempted.
pub async fn kill_containers(
    pod: &Pod,
    message: &str,
    registry: &RuntimeHandlerRegistry,
    metrics: &AgentMetrics,
) -> KillReport {
    let mut report = KillReport::default();
    let namespace = pod.namespace().unwrap_or_default();
    let pod_name = pod.name_any();
    let statuses = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_deref())
        .unwrap_or_default();
    let containers = pod.spec.as_ref().map(|s| s.containers.as_slice()).unwrap_or_default();

    for container in containers {
        let name = container.name.clone();
        let Some(status) = statuses.iter().find(|s| s.name == container.name) else {
            warn!(%message, namespace = %namespace, pod = %pod_name, container = %name, "No status for container");
            report.skipped.push(name);
            continue;
        };
        let running = status
            .state
            .as_ref()
            .is_some_and(|state| state.running.is_some());
        if !running {
            report.skipped.push(name);
            continue;
        }
        let Some(raw_id) = status.container_id.as_deref().filter(|id| !id.is_empty()) else {
            warn!(%message, namespace = %namespace, pod = %pod_name, container = %name, "Container has no id");
            report.skipped.push(name);
            continue;
        };

        let result = match parse_container_id(raw_id) {
            Ok((runtime_type, id)) => match registry.handler_for(&runtime_type) {
                Ok(handler) => handler.stop_container(&id, STOP_TIMEOUT_SECS).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => report.stopped.push(name),
            Err(e) => {
                error!(%message, container_id = %raw_id, error = %e, "Failed to stop container");
                report.failed.push(name);
            }
        }
    }

    for _ in &report.stopped {
        metrics.record_container_kill("stopped");
    }
    for _ in &report.skipped {
        metrics.record_container_kill("skipped");
    }
    for _ in &report.failed {
        metrics.record_container_kill("failed");
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{RuntimeError, RuntimeHandler, RUNTIME_CONTAINERD};
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{
        Container, ContainerState, ContainerStateRunning, ContainerStateTerminated,
        ContainerStatus, PodSpec, PodStatus,
    };
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingHandler {
        stopped: Mutex<Vec<(String, i64)>>,
    }

    #[async_trait]
    impl RuntimeHandler for RecordingHandler {
        async fn stop_container(&self, id: &str, timeout_secs: i64) -> Result<(), RuntimeError> {
            self.stopped.lock().unwrap().push((id.to_string(), timeout_secs));
            Ok(())
        }
    }

    fn status(name: &str, id: Option<&str>, running: bool) -> ContainerStatus {
        let state = if running {
            ContainerState {
                running: Some(ContainerStateRunning::default()),
                ..Default::default()
            }
        } else {
            ContainerState {
                terminated: Some(ContainerStateTerminated::default()),
                ..Default::default()
            }
        };
        ContainerStatus {
            name: name.to_string(),
            container_id: id.map(str::to_string),
            state: Some(state),
            ..Default::default()
        }
    }

    fn pod(statuses: Vec<ContainerStatus>) -> Pod {
        let containers = statuses
            .iter()
            .map(|s| Container {
                name: s.name.clone(),
                ..Default::default()
            })
            .collect();
        Pod {
            spec: Some(PodSpec {
                containers,
                ..Default::default()
            }),
            status: Some(PodStatus {
                container_statuses: Some(statuses),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_lookup_failure_does_not_block_siblings() {
        let handler = Arc::new(RecordingHandler::default());
        let registry = RuntimeHandlerRegistry::new();
        registry.register(RUNTIME_CONTAINERD, handler.clone());

        let pod = pod(vec![
            status("sidecar", Some("cri-o://aaa"), true),
            status("app", Some("containerd://bbb"), true),
        ]);

        let report = kill_containers(&pod, "memory evict", &registry, &AgentMetrics::new()).await;

        assert_eq!(report.failed, vec!["sidecar".to_string()]);
        assert_eq!(report.stopped, vec!["app".to_string()]);
        assert_eq!(*handler.stopped.lock().unwrap(), vec![("bbb".to_string(), 0)]);
    }

    #[tokio::test]
    async fn test_skips_non_running_and_missing_ids() {
        let handler = Arc::new(RecordingHandler::default());
        let registry = RuntimeHandlerRegistry::new();
        registry.register(RUNTIME_CONTAINERD, handler.clone());

        let mut pod = pod(vec![
            status("done", Some("containerd://aaa"), false),
            status("starting", None, true),
            status("app", Some("containerd://ccc"), true),
        ]);
        pod.spec.as_mut().unwrap().containers.push(Container {
            name: "no-status".to_string(),
            ..Default::default()
        });

        let report = kill_containers(&pod, "memory evict", &registry, &AgentMetrics::new()).await;

        assert_eq!(
            report.skipped,
            vec!["done".to_string(), "starting".to_string(), "no-status".to_string()]
        );
        assert_eq!(report.stopped, vec!["app".to_string()]);
        assert!(report.failed.is_empty());
    }
}
