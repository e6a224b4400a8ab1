//! Shared desired-state store for the node's merged NodeSLO
//!
//! One writer (the SLO updater task), many readers (the reconcilers).
//! Readers only ever get owned copies taken under the read lock.

use super::merge::merge_node_slo_spec;
use super::types::{NodeSLO, NodeSLOSpec};
use crate::features::FeatureGates;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct StoreState {
    /// Merged object as seen by reconcilers
    current: Option<NodeSLO>,
    /// Spec exactly as pushed, used for no-op detection
    last_pushed: Option<NodeSLOSpec>,
}

#[derive(Debug)]
pub struct NodeSloStore {
    state: RwLock<StoreState>,
    revision: AtomicU64,
    defaults: NodeSLOSpec,
    gates: Arc<FeatureGates>,
}

impl NodeSloStore {
    pub fn new(defaults: NodeSLOSpec, gates: Arc<FeatureGates>) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            revision: AtomicU64::new(0),
            defaults,
            gates,
        }
    }

    /// Store the first sighting of the object, merged over the defaults
    pub fn on_create(&self, node_slo: &NodeSLO) {
        warn_invalid(&node_slo.spec);
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let old = dump(&state.current);

        let mut merged = node_slo.clone();
        merged.spec = merge_node_slo_spec(&self.defaults, &node_slo.spec, &self.gates);
        state.current = Some(merged);
        state.last_pushed = Some(node_slo.spec.clone());
        let revision = self.revision.fetch_add(1, Ordering::AcqRel) + 1;

        info!(
            revision,
            old = %old,
            new = %dump(&state.current),
            "Created NodeSLO"
        );
    }

    /// Replace the spec (not the object identity) of the stored NodeSLO.
    ///
    /// Returns false when the pushed spec equals the last one stored; in that
    /// case nothing is written and nothing is logged.
    pub fn on_update(&self, node_slo: &NodeSLO) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if state.last_pushed.as_ref() == Some(&node_slo.spec) {
            return false;
        }
        warn_invalid(&node_slo.spec);
        let old = dump(&state.current);

        let merged = merge_node_slo_spec(&self.defaults, &node_slo.spec, &self.gates);
        match state.current.as_mut() {
            Some(current) => current.spec = merged,
            None => {
                debug!("NodeSLO updated before it was created, storing whole object");
                let mut object = node_slo.clone();
                object.spec = merged;
                state.current = Some(object);
            }
        }
        state.last_pushed = Some(node_slo.spec.clone());
        let revision = self.revision.fetch_add(1, Ordering::AcqRel) + 1;

        info!(
            revision,
            old = %old,
            new = %dump(&state.current),
            "Updated NodeSLO spec"
        );
        true
    }

    /// Deep copy of the merged object, `None` until the first create
    pub fn snapshot(&self) -> Option<NodeSLO> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .current
            .clone()
    }

    pub fn spec_snapshot(&self) -> Option<NodeSLOSpec> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .current
            .as_ref()
            .map(|slo| slo.spec.clone())
    }

    /// True once a spec with a threshold block has been stored
    pub fn is_ready(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .current
            .as_ref()
            .is_some_and(|slo| slo.spec.resource_used_threshold_with_be.is_some())
    }

    /// Number of accepted writes so far
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }
}

fn dump(node_slo: &Option<NodeSLO>) -> String {
    serde_json::to_string(node_slo).unwrap_or_else(|e| format!("<unserializable: {e}>"))
}

fn warn_invalid(spec: &NodeSLOSpec) {
    let errors = spec.validate();
    if !errors.is_empty() {
        warn!(errors = ?errors, "NodeSLO spec has out-of-range fields");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slo::defaults::default_node_slo_spec;
    use crate::slo::types::ResourceThresholdStrategy;

    fn store() -> NodeSloStore {
        NodeSloStore::new(default_node_slo_spec(), Arc::new(FeatureGates::new()))
    }

    fn node_slo(spec: NodeSLOSpec) -> NodeSLO {
        NodeSLO::new("node-1", spec)
    }

    fn threshold_spec(cpu: i64) -> NodeSLOSpec {
        NodeSLOSpec {
            resource_used_threshold_with_be: Some(ResourceThresholdStrategy {
                cpu_suppress_threshold_percent: Some(cpu),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_store() {
        let store = store();
        assert!(store.snapshot().is_none());
        assert!(!store.is_ready());
        assert_eq!(store.revision(), 0);
    }

    #[test]
    fn test_create_merges_defaults() {
        let store = store();
        store.on_create(&node_slo(NodeSLOSpec::default()));

        assert!(store.is_ready());
        assert_eq!(store.revision(), 1);
        assert_eq!(store.spec_snapshot().unwrap(), default_node_slo_spec_merged());
    }

    fn default_node_slo_spec_merged() -> NodeSLOSpec {
        merge_node_slo_spec(
            &default_node_slo_spec(),
            &NodeSLOSpec::default(),
            &FeatureGates::new(),
        )
    }

    #[test]
    fn test_update_replaces_spec_keeps_identity() {
        let store = store();
        let mut created = node_slo(threshold_spec(60));
        created.metadata.uid = Some("uid-1".to_string());
        store.on_create(&created);

        let mut updated = node_slo(threshold_spec(80));
        updated.metadata.uid = Some("uid-2".to_string());
        assert!(store.on_update(&updated));

        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.metadata.uid.as_deref(), Some("uid-1"));
        let threshold = snapshot.spec.resource_used_threshold_with_be.unwrap();
        assert_eq!(threshold.cpu_suppress_threshold_percent, Some(80));
        assert_eq!(threshold.enable, Some(true));
        assert_eq!(store.revision(), 2);
    }

    #[test]
    fn test_identical_update_is_noop() {
        let store = store();
        store.on_create(&node_slo(threshold_spec(80)));
        let before = store.snapshot();

        assert!(!store.on_update(&node_slo(threshold_spec(80))));
        assert_eq!(store.snapshot(), before);
        assert_eq!(store.revision(), 1);
    }

    #[test]
    fn test_concurrent_identical_updates() {
        let store = Arc::new(store());
        store.on_create(&node_slo(threshold_spec(50)));
        assert!(store.on_update(&node_slo(threshold_spec(75))));
        let before = store.snapshot();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.on_update(&node_slo(threshold_spec(75))))
            })
            .collect();
        for handle in handles {
            assert!(!handle.join().unwrap());
        }

        assert_eq!(store.snapshot(), before);
        assert_eq!(store.revision(), 2);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let store = store();
        store.on_create(&node_slo(threshold_spec(60)));

        let mut copy = store.spec_snapshot().unwrap();
        copy.resource_used_threshold_with_be = None;

        assert!(store.is_ready());
        assert!(store.spec_snapshot().unwrap().resource_used_threshold_with_be.is_some());
    }
}
