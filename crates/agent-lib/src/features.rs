//! Feature gates controlling which node QoS policies may run

use crate::slo::NodeSLOSpec;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Agent features that can be switched on or off at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Feature {
    /// Reconcile per-QoS-class memory cgroup parameters
    CgroupReconcile,
    /// Suppress best-effort CPU when the node is busy
    #[serde(rename = "BECPUSuppress")]
    BeCpuSuppress,
    /// Tune CPU burst and CFS quota burst for latency-sensitive pods
    #[serde(rename = "CPUBurst")]
    CpuBurst,
    /// Evict best-effort pods under node memory pressure
    #[serde(rename = "BEMemoryEvict")]
    BeMemoryEvict,
    /// Partition LLC and memory bandwidth through resctrl
    RdtResctrl,
    /// Record eviction decisions to the audit log
    AuditEvents,
}

impl Feature {
    pub const ALL: [Feature; 6] = [
        Feature::CgroupReconcile,
        Feature::BeCpuSuppress,
        Feature::CpuBurst,
        Feature::BeMemoryEvict,
        Feature::RdtResctrl,
        Feature::AuditEvents,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::CgroupReconcile => "CgroupReconcile",
            Feature::BeCpuSuppress => "BECPUSuppress",
            Feature::CpuBurst => "CPUBurst",
            Feature::BeMemoryEvict => "BEMemoryEvict",
            Feature::RdtResctrl => "RdtResctrl",
            Feature::AuditEvents => "AuditEvents",
        }
    }

    /// Compiled-in default for the gate
    pub fn default_enabled(&self) -> bool {
        match self {
            Feature::CgroupReconcile => false,
            Feature::BeCpuSuppress => true,
            Feature::CpuBurst => true,
            Feature::BeMemoryEvict => false,
            Feature::RdtResctrl => true,
            Feature::AuditEvents => false,
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = FeatureGateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Feature::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| FeatureGateError::UnknownFeature(s.to_string()))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FeatureGateError {
    #[error("unknown feature gate {0:?}")]
    UnknownFeature(String),
    #[error("malformed feature gate setting {0:?}, expected Name=true|false")]
    Malformed(String),
}

/// Runtime registry of feature gate values
#[derive(Debug)]
pub struct FeatureGates {
    gates: DashMap<Feature, bool>,
}

impl Default for FeatureGates {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureGates {
    /// Gates populated with their compiled-in defaults
    pub fn new() -> Self {
        let gates = DashMap::new();
        for feature in Feature::ALL {
            gates.insert(feature, feature.default_enabled());
        }
        Self { gates }
    }

    /// Parse overrides of the form `CPUBurst=false,BEMemoryEvict=true`
    pub fn parse(settings: &str) -> Result<Self, FeatureGateError> {
        let gates = Self::new();
        for pair in settings.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, value) = pair
                .split_once('=')
                .ok_or_else(|| FeatureGateError::Malformed(pair.to_string()))?;
            let feature: Feature = name.trim().parse()?;
            let enabled: bool = value
                .trim()
                .parse()
                .map_err(|_| FeatureGateError::Malformed(pair.to_string()))?;
            gates.set(feature, enabled);
        }
        Ok(gates)
    }

    pub fn set(&self, feature: Feature, enabled: bool) {
        self.gates.insert(feature, enabled);
    }

    pub fn is_enabled(&self, feature: Feature) -> bool {
        self.gates
            .get(&feature)
            .map(|v| *v)
            .unwrap_or_else(|| feature.default_enabled())
    }

    pub fn all_enabled(&self, features: &[Feature]) -> bool {
        features.iter().all(|f| self.is_enabled(*f))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SloError {
    #[error("cannot parse feature config for invalid nodeSLO spec")]
    InvalidSpec,
    #[error("cannot parse feature config for unsupported feature {0}")]
    UnsupportedFeature(Feature),
}

/// Whether the NodeSLO spec switches `feature` off.
///
/// Only the threshold-driven features are answerable from the spec. Any
/// error means "cannot determine" and callers must treat it as disabled.
pub fn is_feature_disabled(spec: Option<&NodeSLOSpec>, feature: Feature) -> Result<bool, SloError> {
    let spec = match spec {
        Some(spec) if *spec != NodeSLOSpec::default() => spec,
        _ => return Err(SloError::InvalidSpec),
    };

    match feature {
        Feature::BeCpuSuppress | Feature::BeMemoryEvict => spec
            .resource_used_threshold_with_be
            .as_ref()
            .and_then(|t| t.enable)
            .map(|enable| !enable)
            .ok_or(SloError::InvalidSpec),
        other => Err(SloError::UnsupportedFeature(other)),
    }
}
