//! NodeSLO desired state: CRD types, defaults, merge, store and watch

pub mod defaults;
pub mod merge;
pub mod store;
pub mod types;
pub mod watch;

pub use defaults::default_node_slo_spec;
pub use merge::{merge_node_slo_spec, Merge};
pub use store::NodeSloStore;
pub use types::*;
pub use watch::{
    KubeNodeSloSource, NodeSloEvent, NodeSloSource, NodeSloWatchStream, NodeSloWatcher,
    SloUpdater,
};
