//! Integration tests for the agent API endpoints

#[path = "../src/api.rs"]
#[allow(dead_code)]
mod api;

use agent_lib::{
    features::FeatureGates,
    health::{components, HealthRegistry, StartupStage},
    observability::AgentMetrics,
    slo::{default_node_slo_spec, NodeSLO, NodeSLOSpec, NodeSloStore, ResourceThresholdStrategy},
};
use api::{create_router, AppState};
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use std::sync::Arc;
use tower::ServiceExt;

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let health_registry = HealthRegistry::new();
    health_registry.register(components::NODE_SLO_WATCH).await;
    health_registry.register(components::STATES_INFORMER).await;

    let metrics = AgentMetrics::new();
    let store = Arc::new(NodeSloStore::new(
        default_node_slo_spec(),
        Arc::new(FeatureGates::new()),
    ));
    let state = Arc::new(AppState::new(health_registry, metrics, store));
    let router = create_router(state.clone());

    (router, state)
}

async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app().await;

    let (status, body) = get(app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);

    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "healthy");
    assert!(health["components"]["node_slo_watch"].is_object());
    assert!(health["components"]["states_informer"].is_object());
}

#[tokio::test]
async fn test_healthz_returns_ok_when_policy_degraded() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_degraded(&components::policy("resctrl"), "init failed: resctrl not mounted")
        .await;

    let (status, body) = get(app, "/healthz").await;
    // Degraded still returns 200 (operational)
    assert_eq!(status, StatusCode::OK);

    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "degraded");
    assert!(health["components"]["policy/resctrl"].is_object());
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_unhealthy(components::STATES_INFORMER, "reflector stream ended")
        .await;

    let (status, body) = get(app, "/healthz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_follows_startup_sync() {
    let (app, state) = setup_test_app().await;

    let (status, body) = get(app.clone(), "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let readiness: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(readiness["ready"], false);
    assert_eq!(readiness["stage"], "node_slo_sync");

    state.health_registry.set_stage(StartupStage::Running).await;
    let (status, body) = get(app, "/readyz").await;
    assert_eq!(status, StatusCode::OK);
    let readiness: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(readiness["ready"], true);
    assert_eq!(readiness["stage"], "running");
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, state) = setup_test_app().await;

    state.metrics.record_eviction("EvictPodByNodeMemoryUsage");
    state.metrics.observe_reconcile_duration("cpu-burst", 0.002);
    state.metrics.set_policy_state("cpu-burst", 2);
    state.metrics.inc_node_slo_updates();

    let (status, body) = get(app, "/metrics").await;
    assert_eq!(status, StatusCode::OK);

    let metrics_text = String::from_utf8(body).unwrap();
    assert!(metrics_text.contains("qos_agent_pod_evictions_total"));
    assert!(metrics_text.contains("qos_agent_reconcile_duration_seconds_bucket"));
    assert!(metrics_text.contains("qos_agent_policy_state"));
    assert!(metrics_text.contains("qos_agent_node_slo_updates_total"));
}

#[tokio::test]
async fn test_nodeslo_unavailable_before_first_spec() {
    let (app, _state) = setup_test_app().await;

    let (status, _body) = get(app, "/nodeslo").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_nodeslo_returns_merged_spec() {
    let (app, state) = setup_test_app().await;

    state.store.on_create(&NodeSLO::new(
        "node-1",
        NodeSLOSpec {
            resource_used_threshold_with_be: Some(ResourceThresholdStrategy {
                cpu_suppress_threshold_percent: Some(80),
                ..Default::default()
            }),
            ..Default::default()
        },
    ));

    let (status, body) = get(app, "/nodeslo").await;
    assert_eq!(status, StatusCode::OK);

    let spec: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let threshold = &spec["resourceUsedThresholdWithBE"];
    assert_eq!(threshold["cpuSuppressThresholdPercent"], 80);
    assert_eq!(threshold["enable"], true);
    assert_eq!(threshold["memoryEvictThresholdPercent"], 70);
    assert_eq!(spec["cpuBurstStrategy"]["policy"], "none");
}
