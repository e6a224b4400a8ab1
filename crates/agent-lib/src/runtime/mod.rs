//! Container runtime handlers used for direct container stops

mod cri;

pub use cri::CriRuntimeHandler;

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const RUNTIME_CONTAINERD: &str = "containerd";
pub const RUNTIME_DOCKER: &str = "docker";

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("no handler registered for runtime {0:?}")]
    UnknownRuntime(String),

    #[error("malformed container id {0:?}, expected <runtime>://<id>")]
    MalformedContainerId(String),

    #[error("failed to connect to runtime endpoint {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("failed to stop container {container_id}: {source}")]
    Stop {
        container_id: String,
        #[source]
        source: tonic::Status,
    },
}

/// Split a pod status container id (`containerd://abc`) into runtime type
/// and runtime-local id
pub fn parse_container_id(raw: &str) -> Result<(String, String), RuntimeError> {
    match raw.split_once("://") {
        Some((runtime, id)) if !runtime.is_empty() && !id.is_empty() => {
            Ok((runtime.to_string(), id.to_string()))
        }
        _ => Err(RuntimeError::MalformedContainerId(raw.to_string())),
    }
}

#[async_trait]
pub trait RuntimeHandler: Send + Sync {
    /// Stop a container, force-killing it after `timeout_secs`
    async fn stop_container(&self, container_id: &str, timeout_secs: i64)
        -> Result<(), RuntimeError>;
}

/// Runtime handlers keyed by runtime type
#[derive(Default)]
pub struct RuntimeHandlerRegistry {
    handlers: DashMap<String, Arc<dyn RuntimeHandler>>,
}

impl RuntimeHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with CRI clients for containerd and cri-dockerd
    pub fn with_cri_endpoints(containerd: &str, docker: &str, request_timeout: Duration) -> Self {
        let registry = Self::new();
        registry.register(
            RUNTIME_CONTAINERD,
            Arc::new(CriRuntimeHandler::new(containerd, request_timeout)),
        );
        registry.register(
            RUNTIME_DOCKER,
            Arc::new(CriRuntimeHandler::new(docker, request_timeout)),
        );
        registry
    }

    pub fn register(&self, runtime_type: &str, handler: Arc<dyn RuntimeHandler>) {
        self.handlers.insert(runtime_type.to_string(), handler);
    }

    pub fn handler_for(&self, runtime_type: &str) -> Result<Arc<dyn RuntimeHandler>, RuntimeError> {
        self.handlers
            .get(runtime_type)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| RuntimeError::UnknownRuntime(runtime_type.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    #[async_trait]
    impl RuntimeHandler for NoopHandler {
        async fn stop_container(&self, _: &str, _: i64) -> Result<(), RuntimeError> {
            Ok(())
        }
    }

    #[test]
    fn test_parse_container_id() {
        let (runtime, id) = parse_container_id("containerd://0123abcd").unwrap();
        assert_eq!(runtime, "containerd");
        assert_eq!(id, "0123abcd");

        assert!(matches!(
            parse_container_id("0123abcd"),
            Err(RuntimeError::MalformedContainerId(_))
        ));
        assert!(parse_container_id("docker://").is_err());
        assert!(parse_container_id("://abc").is_err());
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let registry = RuntimeHandlerRegistry::new();
        registry.register(RUNTIME_CONTAINERD, Arc::new(NoopHandler));

        let handler = registry.handler_for(RUNTIME_CONTAINERD).unwrap();
        handler.stop_container("abc", 0).await.unwrap();

        assert!(matches!(
            registry.handler_for("cri-o"),
            Err(RuntimeError::UnknownRuntime(name)) if name == "cri-o"
        ));
    }

    #[tokio::test]
    async fn test_cri_endpoints_registered() {
        let registry = RuntimeHandlerRegistry::with_cri_endpoints(
            "/nonexistent/containerd.sock",
            "/nonexistent/cri-dockerd.sock",
            Duration::from_secs(1),
        );
        assert!(registry.handler_for(RUNTIME_CONTAINERD).is_ok());
        assert!(registry.handler_for(RUNTIME_DOCKER).is_ok());
    }
}
