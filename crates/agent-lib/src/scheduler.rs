//! Feature-gated periodic scheduler for the policy reconcilers
//!
//! Every policy gets its own task and ticker. The feature gates are checked
//! once when the policy is wired and again on every tick; a policy whose
//! one-time init fails stays disabled for the rest of the process.

use crate::features::{Feature, FeatureGates};
use crate::health::{components, HealthRegistry};
use crate::observability::{AgentMetrics, StructuredLogger};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyState {
    Disabled,
    Initializing,
    Running,
}

impl PolicyState {
    /// Value exported on the policy state gauge
    pub fn as_metric(&self) -> i64 {
        match self {
            PolicyState::Disabled => 0,
            PolicyState::Initializing => 1,
            PolicyState::Running => 2,
        }
    }
}

/// A pluggable policy driven by the scheduler
#[async_trait]
pub trait Reconciler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Gates that must all be enabled for the policy to run
    fn features(&self) -> Vec<Feature>;

    /// One-time setup; an error disables the policy permanently
    async fn init(&self, _shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        Ok(())
    }

    /// One tick of the policy
    async fn reconcile(&self) -> anyhow::Result<()>;
}

/// A reconciler and the cadence it should run at
#[derive(Clone)]
pub struct PolicyRegistration {
    pub reconciler: Arc<dyn Reconciler>,
    pub interval: Duration,
}

impl PolicyRegistration {
    pub fn new(reconciler: Arc<dyn Reconciler>, interval: Duration) -> Self {
        Self {
            reconciler,
            interval,
        }
    }
}

/// Observes a scheduled policy
pub struct PolicyHandle {
    pub name: String,
    state: watch::Receiver<PolicyState>,
    task: Option<JoinHandle<()>>,
}

impl PolicyHandle {
    pub fn state(&self) -> PolicyState {
        *self.state.borrow()
    }

    /// Wait until the state differs from `from`
    pub async fn changed_from(&mut self, from: PolicyState) -> PolicyState {
        while *self.state.borrow() == from {
            if self.state.changed().await.is_err() {
                break;
            }
        }
        *self.state.borrow()
    }

    /// Wait for the policy task to exit
    pub async fn join(self) {
        if let Some(task) = self.task {
            if let Err(e) = task.await {
                warn!(policy = %self.name, error = %e, "Policy task panicked");
            }
        }
    }
}

#[derive(Clone)]
pub struct PolicyScheduler {
    gates: Arc<FeatureGates>,
    metrics: AgentMetrics,
    health: Option<HealthRegistry>,
    logger: StructuredLogger,
}

impl PolicyScheduler {
    pub fn new(gates: Arc<FeatureGates>, metrics: AgentMetrics, logger: StructuredLogger) -> Self {
        Self {
            gates,
            metrics,
            health: None,
            logger,
        }
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Run `f` every `interval` while all `features` are enabled
    pub fn run_feature<F, Fut>(
        &self,
        name: impl Into<String>,
        f: F,
        features: Vec<Feature>,
        interval: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> PolicyHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.run_feature_with_init(name, || async { Ok(()) }, f, features, interval, shutdown)
    }

    /// Like [`Self::run_feature`], but call `init` once first. If `init`
    /// fails, `f` is never scheduled.
    pub fn run_feature_with_init<I, IFut, F, Fut>(
        &self,
        name: impl Into<String>,
        init: I,
        f: F,
        features: Vec<Feature>,
        period: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> PolicyHandle
    where
        I: FnOnce() -> IFut + Send + 'static,
        IFut: Future<Output = anyhow::Result<()>> + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();

        if !self.gates.all_enabled(&features) {
            let (_, state_rx) = watch::channel(PolicyState::Disabled);
            info!(policy = %name, features = ?features, "Feature disabled, policy will not run");
            self.metrics
                .set_policy_state(&name, PolicyState::Disabled.as_metric());
            return PolicyHandle {
                name,
                state: state_rx,
                task: None,
            };
        }

        if period.is_zero() {
            let reason = "reconcile interval must be non-zero";
            error!(policy = %name, "Policy has a zero interval, disabling");
            self.metrics
                .set_policy_state(&name, PolicyState::Disabled.as_metric());
            self.logger.log_policy_disabled(&name, reason);
            let (_, state_rx) = watch::channel(PolicyState::Disabled);
            let task = self.health.clone().map(|health| {
                let component = components::policy(&name);
                tokio::spawn(async move { health.set_degraded(&component, reason).await })
            });
            return PolicyHandle {
                name,
                state: state_rx,
                task,
            };
        }

        let (state_tx, state_rx) = watch::channel(PolicyState::Initializing);
        let scheduler = self.clone();
        let task_name = name.clone();
        let task = tokio::spawn(async move {
            let name = task_name;
            scheduler.transition(&name, &state_tx, PolicyState::Initializing);

            let init_result = tokio::select! {
                result = init() => result,
                _ = shutdown.recv() => {
                    debug!(policy = %name, "Shutdown during policy init");
                    return;
                }
            };
            if let Err(e) = init_result {
                error!(policy = %name, error = %e, "Policy init failed, disabling");
                scheduler.transition(&name, &state_tx, PolicyState::Disabled);
                scheduler.logger.log_policy_disabled(&name, &e.to_string());
                if let Some(health) = &scheduler.health {
                    health
                        .set_degraded(&components::policy(&name), format!("init failed: {e}"))
                        .await;
                }
                return;
            }

            scheduler.transition(&name, &state_tx, PolicyState::Running);
            if let Some(health) = &scheduler.health {
                health.set_healthy(&components::policy(&name)).await;
            }
            info!(policy = %name, interval_ms = period.as_millis() as u64, "Policy running");

            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !scheduler.gates.all_enabled(&features) {
                            debug!(policy = %name, "Feature disabled, skipping tick");
                            continue;
                        }
                        let start = Instant::now();
                        f().await;
                        scheduler
                            .metrics
                            .observe_reconcile_duration(&name, start.elapsed().as_secs_f64());
                    }
                    _ = shutdown.recv() => {
                        info!(policy = %name, "Stopping policy");
                        break;
                    }
                }
            }
        });

        PolicyHandle {
            name,
            state: state_rx,
            task: Some(task),
        }
    }

    /// Drive a [`Reconciler`] through [`Self::run_feature_with_init`]
    pub fn run_reconciler(
        &self,
        reconciler: Arc<dyn Reconciler>,
        period: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> PolicyHandle {
        let init_reconciler = Arc::clone(&reconciler);
        let init_shutdown = shutdown.resubscribe();
        let tick_reconciler = Arc::clone(&reconciler);

        self.run_feature_with_init(
            reconciler.name(),
            move || async move { init_reconciler.init(init_shutdown).await },
            move || {
                let reconciler = Arc::clone(&tick_reconciler);
                async move {
                    if let Err(e) = reconciler.reconcile().await {
                        warn!(policy = reconciler.name(), error = %e, "Reconcile failed");
                    }
                }
            },
            reconciler.features(),
            period,
            shutdown,
        )
    }

    fn transition(&self, name: &str, state_tx: &watch::Sender<PolicyState>, state: PolicyState) {
        state_tx.send_replace(state);
        self.metrics.set_policy_state(name, state.as_metric());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scheduler(gates: Arc<FeatureGates>) -> PolicyScheduler {
        PolicyScheduler::new(gates, AgentMetrics::new(), StructuredLogger::new("node-1"))
    }

    fn counting(counter: &Arc<AtomicUsize>) -> impl Fn() -> std::future::Ready<()> + Send + Sync + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_feature_never_invokes() {
        let gates = Arc::new(FeatureGates::new());
        gates.set(Feature::BeMemoryEvict, false);
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = broadcast::channel(1);

        let handle = scheduler(gates).run_feature(
            "test-disabled",
            counting(&counter),
            vec![Feature::BeMemoryEvict],
            Duration::from_secs(1),
            rx,
        );
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(handle.state(), PolicyState::Disabled);
        tx.send(()).ok();
        handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_enabled_feature_ticks() {
        let gates = Arc::new(FeatureGates::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = broadcast::channel(1);

        let handle = scheduler(gates).run_feature(
            "test-ticks",
            counting(&counter),
            vec![Feature::CpuBurst],
            Duration::from_secs(1),
            rx,
        );
        tokio::time::sleep(Duration::from_millis(3500)).await;

        let ticks = counter.load(Ordering::SeqCst);
        assert!((3..=4).contains(&ticks), "unexpected tick count {ticks}");
        assert_eq!(handle.state(), PolicyState::Running);

        tx.send(()).unwrap();
        handle.join().await;
        let after_stop = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_init_never_runs_periodic() {
        let gates = Arc::new(FeatureGates::new());
        let health = HealthRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let (_tx, rx) = broadcast::channel(1);

        let mut handle = scheduler(gates).with_health(health.clone()).run_feature_with_init(
            "test-init-fails",
            || async { Err(anyhow::anyhow!("resctrl not mounted")) },
            counting(&counter),
            vec![Feature::RdtResctrl],
            Duration::from_secs(1),
            rx,
        );

        handle.changed_from(PolicyState::Initializing).await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(handle.state(), PolicyState::Disabled);
        assert_eq!(
            health.status_of("policy/test-init-fails").await,
            Some(crate::health::ComponentStatus::Degraded)
        );
        handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_disables_policy() {
        let gates = Arc::new(FeatureGates::new());
        let health = HealthRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let (_tx, rx) = broadcast::channel(1);

        let handle = scheduler(gates).with_health(health.clone()).run_feature(
            "test-zero-interval",
            counting(&counter),
            vec![Feature::CpuBurst],
            Duration::ZERO,
            rx,
        );
        assert_eq!(handle.state(), PolicyState::Disabled);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(handle.state(), PolicyState::Disabled);
        handle.join().await;
        assert_eq!(
            health.status_of("policy/test-zero-interval").await,
            Some(crate::health::ComponentStatus::Degraded)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_turned_off_skips_ticks() {
        let gates = Arc::new(FeatureGates::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = broadcast::channel(1);

        let handle = scheduler(Arc::clone(&gates)).run_feature(
            "test-toggle",
            counting(&counter),
            vec![Feature::BeCpuSuppress],
            Duration::from_secs(1),
            rx,
        );
        tokio::time::sleep(Duration::from_millis(1500)).await;
        gates.set(Feature::BeCpuSuppress, false);
        let before = counter.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), before);
        assert!(before > 0);

        tx.send(()).unwrap();
        handle.join().await;
    }

    struct CountingReconciler {
        inits: AtomicUsize,
        ticks: AtomicUsize,
    }

    #[async_trait]
    impl Reconciler for CountingReconciler {
        fn name(&self) -> &'static str {
            "test-reconciler"
        }

        fn features(&self) -> Vec<Feature> {
            vec![Feature::CpuBurst]
        }

        async fn init(&self, _shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn reconcile(&self) -> anyhow::Result<()> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("reconcile errors are logged, not fatal")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_reconciler() {
        let reconciler = Arc::new(CountingReconciler {
            inits: AtomicUsize::new(0),
            ticks: AtomicUsize::new(0),
        });
        let (tx, rx) = broadcast::channel(1);

        let handle = scheduler(Arc::new(FeatureGates::new())).run_reconciler(
            reconciler.clone(),
            Duration::from_secs(1),
            rx,
        );
        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert_eq!(reconciler.inits.load(Ordering::SeqCst), 1);
        assert!(reconciler.ticks.load(Ordering::SeqCst) >= 2);
        assert_eq!(handle.state(), PolicyState::Running);

        tx.send(()).unwrap();
        handle.join().await;
    }
}
