//! QoS Agent - node resource QoS enforcement
//!
//! This binary runs as a DaemonSet on each Kubernetes node, following the
//! node's NodeSLO and enforcing it through cgroups, resctrl and evictions.

use agent_lib::{
    audit::Auditor,
    cgroup::CgroupLayout,
    evict::{
        api::{KubeEventRecorder, KubeEvictionApi},
        Evictor,
    },
    expire_cache::ExpireCache,
    features::FeatureGates,
    health::{components, HealthRegistry},
    node_usage::NodeUsageReader,
    observability::{AgentMetrics, StructuredLogger},
    policy::{reference_policies, PolicyContext},
    resmanager::{ResManager, ResManagerDeps, ResManagerError},
    runtime::RuntimeHandlerRegistry,
    scheduler::PolicyScheduler,
    slo::{default_node_slo_spec, KubeNodeSloSource, NodeSloStore},
    states::KubeStatesInformer,
};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting qos-agent");

    let config = config::AgentConfig::load()?;
    let gates = Arc::new(FeatureGates::parse(&config.feature_gates).context("Invalid feature gates")?);
    info!(node_name = %config.node_name, "Agent configured");

    let health_registry = HealthRegistry::new();
    health_registry.register(components::NODE_SLO_WATCH).await;
    health_registry.register(components::STATES_INFORMER).await;

    let metrics = AgentMetrics::new();
    let logger = StructuredLogger::new(&config.node_name);
    logger.log_startup(AGENT_VERSION, &config.feature_gates);

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);

    let store = Arc::new(NodeSloStore::new(default_node_slo_spec(), Arc::clone(&gates)));
    let states = KubeStatesInformer::start(
        client.clone(),
        &config.node_name,
        health_registry.clone(),
        &shutdown_rx,
    );

    let evict_cache = Arc::new(ExpireCache::new(config.evict_dedup_ttl(), config.evict_cache_sweep()));
    let evictor = Arc::new(Evictor::new(
        Arc::new(KubeEvictionApi::new(client.clone())),
        Arc::new(KubeEventRecorder::new(client.clone(), &config.node_name)),
        Arc::clone(&evict_cache),
        Auditor::new(Arc::clone(&gates)),
        metrics.clone(),
        logger.clone(),
    ));
    let runtimes = Arc::new(RuntimeHandlerRegistry::with_cri_endpoints(
        &config.containerd_endpoint,
        &config.docker_endpoint,
        config.runtime_request_timeout(),
    ));

    let policy_ctx = PolicyContext {
        store: Arc::clone(&store),
        states: states.clone(),
        cgroups: CgroupLayout::new(&config.cgroup_root),
        node_usage: Arc::new(NodeUsageReader::new(&config.proc_root)),
        metrics: metrics.clone(),
    };
    let policies = reference_policies(
        policy_ctx,
        evictor,
        runtimes,
        &config.resctrl_root,
        &config.policy_intervals(),
    );

    let manager = ResManager::new(ResManagerDeps {
        node_name: config.node_name.clone(),
        config: config.res_manager(),
        store: Arc::clone(&store),
        node_slo_source: Arc::new(KubeNodeSloSource::new(client)),
        states,
        evict_cache,
        scheduler: PolicyScheduler::new(Arc::clone(&gates), metrics.clone(), logger.clone())
            .with_health(health_registry.clone()),
        policies,
        health: health_registry.clone(),
        metrics: metrics.clone(),
        logger: logger.clone(),
    });

    let api_port = config.api_port;
    let app_state = Arc::new(api::AppState::new(health_registry, metrics, store));
    let _api_handle = tokio::spawn(async move {
        if let Err(e) = api::serve(api_port, app_state).await {
            error!(error = %e, "API server failed");
        }
    });

    let signal_logger = logger.clone();
    tokio::spawn(async move {
        let reason = match wait_for_signal().await {
            Ok(reason) => reason,
            Err(e) => {
                warn!(error = %e, "Signal handler failed, shutting down");
                "signal handler error"
            }
        };
        signal_logger.log_shutdown(reason);
        let _ = shutdown_tx.send(());
    });

    match manager.run(shutdown_rx).await {
        Ok(()) | Err(ResManagerError::Shutdown) => {
            info!("Shutting down");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Resource manager failed to start");
            Err(e.into())
        }
    }
}

async fn wait_for_signal() -> Result<&'static str> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            Ok("SIGINT received")
        }
        _ = terminate.recv() => Ok("SIGTERM received"),
    }
}
