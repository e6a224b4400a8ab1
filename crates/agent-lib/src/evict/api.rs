//! Kubernetes-backed eviction API and event recorder

use super::{EventRecorder, EventType, EvictError, PodEvictionApi};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::EvictParams;
use kube::runtime::events::{self, Event, Recorder, Reporter};
use kube::{Api, Client, Resource};
use tracing::{debug, warn};

/// Component name events are reported under
pub const EVENT_REPORTER: &str = "slo-agent-reporter";

pub struct KubeEvictionApi {
    client: Client,
}

impl KubeEvictionApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodEvictionApi for KubeEvictionApi {
    async fn evict(&self, namespace: &str, name: &str) -> Result<(), EvictError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match pods.evict(name, &EvictParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Err(EvictError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
            Err(e) => Err(EvictError::Api {
                namespace: namespace.to_string(),
                name: name.to_string(),
                source: Box::new(e),
            }),
        }
    }
}

pub struct KubeEventRecorder {
    client: Client,
    reporter: Reporter,
}

impl KubeEventRecorder {
    pub fn new(client: Client, node_name: &str) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: EVENT_REPORTER.to_string(),
                instance: Some(node_name.to_string()),
            },
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record_event(&self, node: &Node, event_type: EventType, reason: &str, message: &str) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), node.object_ref(&()));
        let type_ = match event_type {
            EventType::Normal => events::EventType::Normal,
            EventType::Warning => events::EventType::Warning,
        };
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: "Evict".to_string(),
            secondary: None,
        };
        match recorder.publish(event).await {
            Ok(()) => debug!(reason, "Published node event"),
            Err(e) => warn!(reason, error = %e, "Failed to publish node event"),
        }
    }
}
