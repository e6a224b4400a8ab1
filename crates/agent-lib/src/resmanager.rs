//! Node resource manager
//!
//! Boots the node QoS machinery in a fixed order and then blocks until
//! shutdown:
//! 1. dedup cache sweep
//! 2. NodeSLO watch and its updater
//! 3. wait for the NodeSLO watch to sync
//! 4. wait for the states informer to sync
//! 5. wait for the store to hold a usable spec
//! 6. launch every policy through the scheduler
//! 7. wait for shutdown

use crate::expire_cache::ExpireCache;
use crate::health::{components, HealthRegistry, StartupStage};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::scheduler::{PolicyHandle, PolicyRegistration, PolicyScheduler, PolicyState};
use crate::slo::watch::EVENT_CHANNEL_CAPACITY;
use crate::slo::{NodeSLOSpec, NodeSloSource, NodeSloStore, NodeSloWatcher, SloUpdater};
use crate::states::StatesInformer;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{error, info};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResManagerError {
    #[error("timed out after {0:?} waiting for NodeSLO watch to sync")]
    NodeSloSyncTimeout(Duration),
    #[error("timed out after {0:?} waiting for states informer to sync")]
    StatesInformerSyncTimeout(Duration),
    #[error("timed out after {0:?} waiting for a usable NodeSLO spec")]
    NodeSloNotReady(Duration),
    #[error("shutdown requested during startup")]
    Shutdown,
}

/// Shortest poll period for the startup waits; smaller values are raised to it
pub const MIN_SYNC_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Startup bounds
#[derive(Debug, Clone)]
pub struct ResManagerConfig {
    /// Upper bound for each startup sync wait
    pub sync_timeout: Duration,
    pub sync_poll_interval: Duration,
}

impl Default for ResManagerConfig {
    fn default() -> Self {
        Self {
            sync_timeout: Duration::from_secs(300),
            sync_poll_interval: Duration::from_millis(100),
        }
    }
}

pub struct ResManagerDeps {
    pub node_name: String,
    pub config: ResManagerConfig,
    pub store: Arc<NodeSloStore>,
    pub node_slo_source: Arc<dyn NodeSloSource>,
    pub states: Arc<dyn StatesInformer>,
    pub evict_cache: Arc<ExpireCache<String, String>>,
    pub scheduler: PolicyScheduler,
    pub policies: Vec<PolicyRegistration>,
    pub health: HealthRegistry,
    pub metrics: AgentMetrics,
    pub logger: StructuredLogger,
}

pub struct ResManager {
    deps: ResManagerDeps,
    handles: Mutex<Vec<PolicyHandle>>,
}

impl ResManager {
    pub fn new(deps: ResManagerDeps) -> Self {
        Self {
            deps,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Current merged NodeSLO spec, `None` until the first one is stored
    pub fn node_slo(&self) -> Option<NodeSLOSpec> {
        self.deps.store.spec_snapshot()
    }

    /// State of every launched policy
    pub fn policy_states(&self) -> Vec<(String, PolicyState)> {
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|h| (h.name.clone(), h.state()))
            .collect()
    }

    /// Run until shutdown. Only startup failures are returned as errors.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ResManagerError> {
        let deps = &self.deps;
        let timeout = deps.config.sync_timeout;

        let _sweeper = deps.evict_cache.run(shutdown.resubscribe());
        deps.health.register(components::EVICT_CACHE).await;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let watcher = NodeSloWatcher::new(deps.node_name.clone(), tx).with_health(deps.health.clone());
        let slo_synced = watcher.synced();
        let stream = deps.node_slo_source.watch(&deps.node_name);
        tokio::spawn(watcher.run(stream, shutdown.resubscribe()));
        let updater = SloUpdater::new(Arc::clone(&deps.store), deps.metrics.clone(), deps.logger.clone());
        tokio::spawn(updater.run(rx, shutdown.resubscribe()));

        deps.health.set_stage(StartupStage::NodeSloSync).await;
        info!(node = %deps.node_name, "Waiting for NodeSLO watch to sync");
        self.wait_for(|| slo_synced.is_synced(), ResManagerError::NodeSloSyncTimeout(timeout), &mut shutdown)
            .await?;

        deps.health.set_stage(StartupStage::StatesSync).await;
        info!("Waiting for states informer to sync");
        let states = Arc::clone(&deps.states);
        self.wait_for(
            move || states.has_synced(),
            ResManagerError::StatesInformerSyncTimeout(timeout),
            &mut shutdown,
        )
        .await?;

        deps.health.set_stage(StartupStage::NodeSloReady).await;
        info!("Waiting for NodeSLO to be ready");
        let store = Arc::clone(&deps.store);
        self.wait_for(move || store.is_ready(), ResManagerError::NodeSloNotReady(timeout), &mut shutdown)
            .await?;

        // Policies subscribe to shutdown before the next await point
        info!(policies = deps.policies.len(), "Starting policy reconcilers");
        {
            let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            for registration in &deps.policies {
                handles.push(deps.scheduler.run_reconciler(
                    Arc::clone(&registration.reconciler),
                    registration.interval,
                    shutdown.resubscribe(),
                ));
            }
        }
        deps.health.set_stage(StartupStage::Running).await;

        let _ = shutdown.recv().await;
        info!("Resource manager shutting down");
        Ok(())
    }

    async fn wait_for<F>(
        &self,
        condition: F,
        on_timeout: ResManagerError,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ResManagerError>
    where
        F: Fn() -> bool,
    {
        let deadline = Instant::now() + self.deps.config.sync_timeout;
        let mut ticker = interval(self.deps.config.sync_poll_interval.max(MIN_SYNC_POLL_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if condition() {
                        return Ok(());
                    }
                    if Instant::now() >= deadline {
                        error!(error = %on_timeout, "Startup sync failed");
                        return Err(on_timeout);
                    }
                }
                _ = shutdown.recv() => return Err(ResManagerError::Shutdown),
            }
        }
    }
}
