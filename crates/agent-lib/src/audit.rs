//! Audit trail for actions taken against pods
//!
//! Records go to the `audit` tracing target so they can be routed
//! separately from operational logs. Recording never fails the caller.

use crate::features::{Feature, FeatureGates};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone)]
pub struct Auditor {
    gates: Arc<FeatureGates>,
}

impl Auditor {
    pub fn new(gates: Arc<FeatureGates>) -> Self {
        Self { gates }
    }

    pub fn is_enabled(&self) -> bool {
        self.gates.is_enabled(Feature::AuditEvents)
    }

    /// Start an audit record about a pod
    pub fn pod<'a>(&'a self, namespace: &'a str, name: &'a str) -> AuditRecord<'a> {
        AuditRecord {
            auditor: self,
            namespace,
            name,
            reason: "",
            message: "",
        }
    }
}

#[must_use = "an audit record does nothing until record() is called"]
pub struct AuditRecord<'a> {
    auditor: &'a Auditor,
    namespace: &'a str,
    name: &'a str,
    reason: &'a str,
    message: &'a str,
}

impl<'a> AuditRecord<'a> {
    pub fn reason(mut self, reason: &'a str) -> Self {
        self.reason = reason;
        self
    }

    pub fn message(mut self, message: &'a str) -> Self {
        self.message = message;
        self
    }

    /// Emit the record; returns whether anything was written
    pub fn record(self) -> bool {
        if !self.auditor.is_enabled() {
            return false;
        }
        info!(
            target: "audit",
            kind = "pod",
            namespace = %self.namespace,
            name = %self.name,
            reason = %self.reason,
            message = %self.message,
            "audit"
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_gated_by_feature() {
        let gates = Arc::new(FeatureGates::new());
        let auditor = Auditor::new(Arc::clone(&gates));

        assert!(!auditor
            .pod("default", "be-pod")
            .reason("EvictPodByNodeMemoryUsage")
            .record());

        gates.set(Feature::AuditEvents, true);
        assert!(auditor
            .pod("default", "be-pod")
            .reason("EvictPodByNodeMemoryUsage")
            .message("node memory usage 85%")
            .record());
    }
}
