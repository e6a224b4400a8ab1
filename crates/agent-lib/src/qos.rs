//! Pod QoS classification and resource quantity helpers

use k8s_openapi::api::core::v1::{Container, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use std::fmt;

use crate::slo::{ResourceQoS, ResourceQoSStrategy};

/// Pod label carrying the node-level QoS class
pub const LABEL_POD_QOS: &str = "koordinator.sh/qosClass";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QoSClass {
    Lsr,
    Ls,
    Be,
    System,
    None,
}

impl QoSClass {
    pub fn from_label(value: &str) -> Option<Self> {
        match value {
            "LSE" | "LSR" => Some(QoSClass::Lsr),
            "LS" => Some(QoSClass::Ls),
            "BE" => Some(QoSClass::Be),
            "SYSTEM" => Some(QoSClass::System),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QoSClass::Lsr => "LSR",
            QoSClass::Ls => "LS",
            QoSClass::Be => "BE",
            QoSClass::System => "SYSTEM",
            QoSClass::None => "NONE",
        }
    }

    /// Latency-sensitive classes
    pub fn is_ls(&self) -> bool {
        matches!(self, QoSClass::Lsr | QoSClass::Ls)
    }
}

impl fmt::Display for QoSClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kubernetes QoS class, used for the cgroup layout and as a fallback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KubeQoSClass {
    Guaranteed,
    Burstable,
    BestEffort,
}

pub fn kube_qos_class(pod: &Pod) -> KubeQoSClass {
    match pod.status.as_ref().and_then(|s| s.qos_class.as_deref()) {
        Some("Guaranteed") => return KubeQoSClass::Guaranteed,
        Some("Burstable") => return KubeQoSClass::Burstable,
        Some("BestEffort") => return KubeQoSClass::BestEffort,
        _ => {}
    }

    let containers = pod_containers(pod);
    let mut any_set = false;
    let mut guaranteed = !containers.is_empty();
    for container in containers {
        let resources = container.resources.as_ref();
        let requests = resources.and_then(|r| r.requests.as_ref());
        let limits = resources.and_then(|r| r.limits.as_ref());
        any_set |= requests.is_some_and(|r| !r.is_empty()) || limits.is_some_and(|l| !l.is_empty());
        for resource in ["cpu", "memory"] {
            let limit = limits.and_then(|l| l.get(resource));
            let request = requests.and_then(|r| r.get(resource)).or(limit);
            if limit.is_none() || request != limit {
                guaranteed = false;
            }
        }
    }

    if !any_set {
        KubeQoSClass::BestEffort
    } else if guaranteed {
        KubeQoSClass::Guaranteed
    } else {
        KubeQoSClass::Burstable
    }
}

/// QoS class from the pod label, falling back to the Kubernetes class
pub fn qos_class(pod: &Pod) -> QoSClass {
    if let Some(class) = pod.labels().get(LABEL_POD_QOS).and_then(|v| QoSClass::from_label(v)) {
        return class;
    }
    match kube_qos_class(pod) {
        KubeQoSClass::Guaranteed | KubeQoSClass::Burstable => QoSClass::Ls,
        KubeQoSClass::BestEffort => QoSClass::Be,
    }
}

/// Per-class block of the QoS strategy
pub fn resource_qos_for(strategy: &ResourceQoSStrategy, class: QoSClass) -> Option<&ResourceQoS> {
    match class {
        QoSClass::Lsr => strategy.lsr.as_ref(),
        QoSClass::Ls => strategy.ls.as_ref(),
        QoSClass::Be => strategy.be.as_ref(),
        QoSClass::System => strategy.system.as_ref(),
        QoSClass::None => None,
    }
}

pub fn pod_priority(pod: &Pod) -> i32 {
    pod.spec.as_ref().and_then(|s| s.priority).unwrap_or(0)
}

fn pod_containers(pod: &Pod) -> &[Container] {
    pod.spec.as_ref().map(|s| s.containers.as_slice()).unwrap_or_default()
}

/// Parse a quantity into its value scaled by `scale` (1000 for millicores)
fn parse_scaled(quantity: &str, scale: f64) -> Option<i64> {
    let q = quantity.trim();
    if q.is_empty() {
        return None;
    }
    let split = q
        .find(|c: char| c.is_ascii_alphabetic() && c != 'e' && c != 'E')
        .unwrap_or(q.len());
    let (number, suffix) = q.split_at(split);
    let multiplier: f64 = match suffix {
        "" => 1.0,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024.0,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        _ => return None,
    };
    let value: f64 = number.parse().ok()?;
    Some((value * multiplier * scale).ceil() as i64)
}

pub fn cpu_millis(quantity: &Quantity) -> Option<i64> {
    parse_scaled(&quantity.0, 1000.0)
}

pub fn memory_bytes(quantity: &Quantity) -> Option<i64> {
    parse_scaled(&quantity.0, 1.0)
}

pub fn container_cpu_limit_millis(container: &Container) -> Option<i64> {
    container
        .resources
        .as_ref()
        .and_then(|r| r.limits.as_ref())
        .and_then(|l| l.get("cpu"))
        .and_then(cpu_millis)
}

/// Sum of container memory requests
pub fn pod_memory_request(pod: &Pod) -> i64 {
    pod_containers(pod)
        .iter()
        .filter_map(|c| {
            c.resources
                .as_ref()
                .and_then(|r| r.requests.as_ref())
                .and_then(|r| r.get("memory"))
                .and_then(memory_bytes)
        })
        .sum()
}

/// Sum of container memory limits, `None` when any container is unbounded
pub fn pod_memory_limit(pod: &Pod) -> Option<i64> {
    let containers = pod_containers(pod);
    if containers.is_empty() {
        return None;
    }
    containers
        .iter()
        .map(|c| {
            c.resources
                .as_ref()
                .and_then(|r| r.limits.as_ref())
                .and_then(|l| l.get("memory"))
                .and_then(memory_bytes)
        })
        .sum()
}
