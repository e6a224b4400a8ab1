//! NodeSLO watch adapter
//!
//! Turns the raw kube watch stream for this node's NodeSLO into typed
//! `Created` / `Updated` notifications, and applies them to the store from
//! a single consumer task.

use super::store::NodeSloStore;
use super::types::NodeSLO;
use crate::health::{components, HealthRegistry};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::states::SyncFlag;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Safety-net resync period for the NodeSLO watch
pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(12 * 60 * 60);

/// Channel depth between the watcher and the updater
pub const EVENT_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub enum NodeSloEvent {
    Created(NodeSLO),
    Updated { old: NodeSLO, new: NodeSLO },
}

pub type NodeSloWatchStream = BoxStream<'static, Result<watcher::Event<NodeSLO>, watcher::Error>>;

/// Where NodeSLO watch events come from
pub trait NodeSloSource: Send + Sync {
    /// List-then-watch the NodeSLO named `node_name`
    fn watch(&self, node_name: &str) -> NodeSloWatchStream;
}

pub struct KubeNodeSloSource {
    client: Client,
}

impl KubeNodeSloSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl NodeSloSource for KubeNodeSloSource {
    fn watch(&self, node_name: &str) -> NodeSloWatchStream {
        let api: Api<NodeSLO> = Api::all(self.client.clone());
        let config = watcher::Config::default().fields(&format!("metadata.name={node_name}"));
        watcher(api, config).default_backoff().boxed()
    }
}

/// Converts watch events into `NodeSloEvent`s for one node
pub struct NodeSloWatcher {
    node_name: String,
    resync_period: Duration,
    events: mpsc::Sender<NodeSloEvent>,
    synced: SyncFlag,
    health: Option<HealthRegistry>,
    last_seen: Option<NodeSLO>,
}

impl NodeSloWatcher {
    pub fn new(node_name: impl Into<String>, events: mpsc::Sender<NodeSloEvent>) -> Self {
        Self {
            node_name: node_name.into(),
            resync_period: DEFAULT_RESYNC_PERIOD,
            events,
            synced: SyncFlag::new(),
            health: None,
            last_seen: None,
        }
    }

    pub fn with_resync_period(mut self, period: Duration) -> Self {
        self.resync_period = period;
        self
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Flag flipped after the first full list
    pub fn synced(&self) -> SyncFlag {
        self.synced.clone()
    }

    /// Pump `stream` until it ends, the receiver goes away, or shutdown fires
    pub async fn run(mut self, mut stream: NodeSloWatchStream, mut shutdown: broadcast::Receiver<()>) {
        info!(node = %self.node_name, "Starting NodeSLO watch");
        let mut resync = interval_at(Instant::now() + self.resync_period, self.resync_period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let outgoing = tokio::select! {
                event = stream.next() => match event {
                    Some(Ok(event)) => self.handle(event).await,
                    Some(Err(e)) => {
                        warn!(error = %e, "NodeSLO watch error, retrying");
                        if let Some(health) = &self.health {
                            health
                                .set_degraded(components::NODE_SLO_WATCH, format!("watch error: {e}"))
                                .await;
                        }
                        Vec::new()
                    }
                    None => {
                        warn!("NodeSLO watch stream ended");
                        break;
                    }
                },
                _ = resync.tick() => self.resync_event().into_iter().collect(),
                _ = shutdown.recv() => {
                    info!("Shutting down NodeSLO watch");
                    break;
                }
            };

            for event in outgoing {
                if self.events.send(event).await.is_err() {
                    warn!("NodeSLO updater has gone away, stopping watch");
                    return;
                }
            }
        }
    }

    async fn handle(&mut self, event: watcher::Event<NodeSLO>) -> Vec<NodeSloEvent> {
        match event {
            watcher::Event::Applied(obj) => self.observe(obj).into_iter().collect(),
            watcher::Event::Deleted(obj) => {
                warn!(name = %obj.name_any(), "NodeSLO deleted, keeping last applied spec");
                self.last_seen = None;
                Vec::new()
            }
            watcher::Event::Restarted(objects) => {
                let out: Vec<_> = objects
                    .into_iter()
                    .filter_map(|obj| self.observe(obj))
                    .collect();
                if !self.synced.is_synced() {
                    info!(objects = out.len(), "NodeSLO watch synced");
                }
                self.synced.mark_synced();
                if let Some(health) = &self.health {
                    health.set_healthy(components::NODE_SLO_WATCH).await;
                }
                out
            }
        }
    }

    fn observe(&mut self, obj: NodeSLO) -> Option<NodeSloEvent> {
        if obj.name_any() != self.node_name {
            debug!(name = %obj.name_any(), "Ignoring NodeSLO of another node");
            return None;
        }
        let event = match self.last_seen.replace(obj.clone()) {
            None => NodeSloEvent::Created(obj),
            Some(old) => NodeSloEvent::Updated { old, new: obj },
        };
        Some(event)
    }

    fn resync_event(&self) -> Option<NodeSloEvent> {
        self.last_seen.as_ref().map(|obj| {
            debug!("Resyncing NodeSLO");
            NodeSloEvent::Updated {
                old: obj.clone(),
                new: obj.clone(),
            }
        })
    }
}

/// Single writer of the store
#[derive(Clone)]
pub struct SloUpdater {
    store: Arc<NodeSloStore>,
    metrics: AgentMetrics,
    logger: StructuredLogger,
}

impl SloUpdater {
    pub fn new(store: Arc<NodeSloStore>, metrics: AgentMetrics, logger: StructuredLogger) -> Self {
        Self {
            store,
            metrics,
            logger,
        }
    }

    /// Apply one event, returning whether the store changed
    pub fn apply(&self, event: NodeSloEvent) -> bool {
        match event {
            NodeSloEvent::Created(obj) => {
                info!(name = %obj.name_any(), "NodeSLO created");
                self.store.on_create(&obj);
                self.accepted(true);
                true
            }
            NodeSloEvent::Updated { old, new } => {
                if old.spec == new.spec {
                    debug!(name = %new.name_any(), "NodeSLO spec has not changed");
                    return false;
                }
                let changed = self.store.on_update(&new);
                if changed {
                    self.accepted(false);
                }
                changed
            }
        }
    }

    fn accepted(&self, created: bool) {
        self.metrics.inc_node_slo_updates();
        self.logger
            .log_node_slo_updated(self.store.revision(), created);
    }

    pub async fn run(self, mut events: mpsc::Receiver<NodeSloEvent>, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        self.apply(event);
                    }
                    None => break,
                },
                _ = shutdown.recv() => break,
            }
        }
        debug!("NodeSLO updater stopped");
    }
}
