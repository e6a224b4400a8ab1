//! Node and pod metadata for the policies
//!
//! Backed by two kube reflectors: the node object by name and the pods
//! scheduled onto it.

use crate::health::{components, HealthRegistry};
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::runtime::reflector::{self, store::Writer, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One-way "initial list completed" marker shared between a watch task and
/// whoever waits on it
#[derive(Debug, Clone, Default)]
pub struct SyncFlag(Arc<AtomicBool>);

impl SyncFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_synced(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_synced(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Read-only view of the node and its pods
pub trait StatesInformer: Send + Sync {
    /// True once both the node and the pod list have been fully listed
    fn has_synced(&self) -> bool;

    fn get_node(&self) -> Option<Arc<Node>>;

    fn get_all_pods(&self) -> Vec<Arc<Pod>>;
}

pub struct KubeStatesInformer {
    node_name: String,
    node_store: Store<Node>,
    pod_store: Store<Pod>,
    node_synced: SyncFlag,
    pods_synced: SyncFlag,
}

impl KubeStatesInformer {
    /// Start the node and pod reflectors and return the informer reading them
    pub fn start(
        client: Client,
        node_name: &str,
        health: HealthRegistry,
        shutdown: &broadcast::Receiver<()>,
    ) -> Arc<Self> {
        let (node_store, node_writer) = reflector::store();
        let (pod_store, pod_writer) = reflector::store();
        let informer = Arc::new(Self {
            node_name: node_name.to_string(),
            node_store,
            pod_store,
            node_synced: SyncFlag::new(),
            pods_synced: SyncFlag::new(),
        });

        let nodes: Api<Node> = Api::all(client.clone());
        let node_config = watcher::Config::default().fields(&format!("metadata.name={node_name}"));
        spawn_reflector(
            "node",
            nodes,
            node_config,
            node_writer,
            informer.node_synced.clone(),
            health.clone(),
            shutdown.resubscribe(),
        );

        let pods: Api<Pod> = Api::all(client);
        let pod_config = watcher::Config::default().fields(&format!("spec.nodeName={node_name}"));
        spawn_reflector(
            "pod",
            pods,
            pod_config,
            pod_writer,
            informer.pods_synced.clone(),
            health,
            shutdown.resubscribe(),
        );

        informer
    }

    #[cfg(test)]
    fn from_parts(
        node_name: &str,
        node_store: Store<Node>,
        pod_store: Store<Pod>,
        node_synced: SyncFlag,
        pods_synced: SyncFlag,
    ) -> Self {
        Self {
            node_name: node_name.to_string(),
            node_store,
            pod_store,
            node_synced,
            pods_synced,
        }
    }
}

impl StatesInformer for KubeStatesInformer {
    fn has_synced(&self) -> bool {
        self.node_synced.is_synced() && self.pods_synced.is_synced()
    }

    fn get_node(&self) -> Option<Arc<Node>> {
        self.node_store.get(&ObjectRef::new(&self.node_name))
    }

    fn get_all_pods(&self) -> Vec<Arc<Pod>> {
        self.pod_store.state()
    }
}

fn spawn_reflector<K>(
    kind: &'static str,
    api: Api<K>,
    config: watcher::Config,
    writer: Writer<K>,
    synced: SyncFlag,
    health: HealthRegistry,
    shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Default + Send + Sync,
{
    tokio::spawn(async move {
        info!(kind, "Starting reflector");
        let stream = reflector::reflector(writer, watcher(api, config)).default_backoff();
        drive_reflector(kind, stream, synced, Some(health), shutdown).await;
    })
}

/// Pump a reflector stream until it ends or shutdown fires, marking
/// `synced` after every completed (re)list
pub async fn drive_reflector<K, S>(
    kind: &'static str,
    stream: S,
    synced: SyncFlag,
    health: Option<HealthRegistry>,
    mut shutdown: broadcast::Receiver<()>,
) where
    S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send,
{
    futures::pin_mut!(stream);
    loop {
        tokio::select! {
            event = stream.next() => match event {
                Some(Ok(watcher::Event::Restarted(objects))) => {
                    debug!(kind, count = objects.len(), "Reflector listed objects");
                    if !synced.is_synced() {
                        info!(kind, "Reflector synced");
                    }
                    synced.mark_synced();
                    if let Some(health) = &health {
                        health.set_healthy(components::STATES_INFORMER).await;
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(kind, error = %e, "Reflector watch error");
                    if let Some(health) = &health {
                        health
                            .set_degraded(components::STATES_INFORMER, format!("{kind} watch error: {e}"))
                            .await;
                    }
                }
                None => {
                    warn!(kind, "Reflector stream ended");
                    break;
                }
            },
            _ = shutdown.recv() => {
                info!(kind, "Shutting down reflector");
                break;
            }
        }
    }
}
