//! Health check infrastructure for the QoS agent
//!
//! Tracks the NodeSLO watch, the states informer and every policy, and
//! answers the Kubernetes liveness and readiness probes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Health status of a component, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is functioning normally
    Healthy,
    /// Component is not doing its job but the agent keeps enforcing the rest
    Degraded,
    /// Component has failed
    Unhealthy,
}

impl ComponentStatus {
    /// Returns true if the component is at least partially operational
    pub fn is_operational(&self) -> bool {
        matches!(self, ComponentStatus::Healthy | ComponentStatus::Degraded)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ComponentHealth {
    fn with_status(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            updated_at: Utc::now(),
        }
    }

    pub fn healthy() -> Self {
        Self::with_status(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

/// Overall health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status across all components
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .map(|h| h.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy)
    }
}

/// Startup gate the resource manager is currently waiting on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupStage {
    NodeSloSync,
    StatesSync,
    NodeSloReady,
    /// Every gate passed and the policies are launched
    Running,
}

impl StartupStage {
    fn waiting_reason(&self) -> Option<&'static str> {
        match self {
            StartupStage::NodeSloSync => Some("Waiting for the NodeSLO watch to list"),
            StartupStage::StatesSync => Some("Waiting for node and pod state to sync"),
            StartupStage::NodeSloReady => Some("Waiting for a NodeSLO with resource thresholds"),
            StartupStage::Running => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub stage: StartupStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const NODE_SLO_WATCH: &str = "node_slo_watch";
    pub const STATES_INFORMER: &str = "states_informer";
    pub const EVICT_CACHE: &str = "evict_cache";

    /// Health entry name of a policy reconciler
    pub fn policy(name: &str) -> String {
        format!("policy/{name}")
    }
}

/// Health registry for tracking component health
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    stage: Arc<RwLock<StartupStage>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            components: Arc::new(RwLock::new(HashMap::new())),
            stage: Arc::new(RwLock::new(StartupStage::NodeSloSync)),
        }
    }

    /// Register a component with initial healthy status
    pub async fn register(&self, name: &str) {
        let mut components = self.components.write().await;
        components.insert(name.to_string(), ComponentHealth::healthy());
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        let mut components = self.components.write().await;
        components.insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    pub async fn set_stage(&self, stage: StartupStage) {
        *self.stage.write().await = stage;
    }

    pub async fn stage(&self) -> StartupStage {
        *self.stage.read().await
    }

    pub async fn status_of(&self, name: &str) -> Option<ComponentStatus> {
        self.components.read().await.get(name).map(|h| h.status)
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let stage = self.stage().await;
        if let Some(waiting) = stage.waiting_reason() {
            return ReadinessResponse {
                ready: false,
                stage,
                reason: Some(waiting.to_string()),
            };
        }

        let components = self.components.read().await;
        let mut unhealthy: Vec<&str> = components
            .iter()
            .filter(|(_, h)| h.status == ComponentStatus::Unhealthy)
            .map(|(name, _)| name.as_str())
            .collect();
        if unhealthy.is_empty() {
            return ReadinessResponse {
                ready: true,
                stage,
                reason: None,
            };
        }
        unhealthy.sort_unstable();
        ReadinessResponse {
            ready: false,
            stage,
            reason: Some(format!("Unhealthy: {}", unhealthy.join(", "))),
        }
    }
}
