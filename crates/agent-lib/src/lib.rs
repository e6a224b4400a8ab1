//! Node QoS agent library
//!
//! This crate provides the core functionality for:
//! - NodeSLO watch, merge-over-defaults and the shared spec store
//! - Feature-gated periodic policy scheduling
//! - Pod eviction with dedup and direct container stop
//! - Reference QoS policies (cgroup, CPU suppress/burst, memory evict, resctrl)
//! - Health checks and observability

pub mod audit;
pub mod cgroup;
pub mod evict;
pub mod expire_cache;
pub mod features;
pub mod health;
pub mod node_usage;
pub mod observability;
pub mod policy;
pub mod proto;
pub mod qos;
pub mod resmanager;
pub mod runtime;
pub mod scheduler;
pub mod slo;
pub mod states;

pub use expire_cache::{CacheError, ExpireCache};
pub use features::{Feature, FeatureGates};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
    StartupStage,
};
pub use observability::{AgentMetrics, StructuredLogger};
pub use resmanager::{ResManager, ResManagerConfig, ResManagerDeps, ResManagerError};
pub use scheduler::{PolicyRegistration, PolicyScheduler, PolicyState, Reconciler};
