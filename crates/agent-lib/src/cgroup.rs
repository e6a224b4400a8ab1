//! cgroup v2 access for the kubepods hierarchy
//!
//! Paths follow the kubelet systemd cgroup driver:
//! - kubepods.slice/kubepods-pod<uid>.slice for Guaranteed pods
//! - kubepods.slice/kubepods-burstable.slice/kubepods-burstable-pod<uid>.slice
//! - kubepods.slice/kubepods-besteffort.slice/kubepods-besteffort-pod<uid>.slice
//! - <pod>/cri-containerd-<id>.scope or <pod>/docker-<id>.scope for containers

use crate::qos::{kube_qos_class, KubeQoSClass};
use crate::runtime::{parse_container_id, RUNTIME_DOCKER};
use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Pod;
use std::path::{Path, PathBuf};
use tokio::fs;

pub const KUBEPODS_SLICE: &str = "kubepods.slice";

pub const CPU_STAT: &str = "cpu.stat";
pub const CPU_MAX: &str = "cpu.max";
pub const CPU_MAX_BURST: &str = "cpu.max.burst";
pub const CPUSET_CPUS: &str = "cpuset.cpus";
pub const MEMORY_CURRENT: &str = "memory.current";
pub const MEMORY_MIN: &str = "memory.min";
pub const MEMORY_LOW: &str = "memory.low";
pub const MEMORY_HIGH: &str = "memory.high";

/// Kernel default CFS period
pub const DEFAULT_CFS_PERIOD_US: u64 = 100_000;

#[derive(Debug, Clone)]
pub struct CgroupLayout {
    root: PathBuf,
}

impl CgroupLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Check if the root is a cgroup v2 mount
    pub async fn is_available(&self) -> bool {
        fs::metadata(self.root.join("cgroup.controllers")).await.is_ok()
    }

    pub fn kubepods_dir(&self) -> PathBuf {
        self.root.join(KUBEPODS_SLICE)
    }

    /// Parent directory of all pods of a Kubernetes QoS class
    pub fn qos_dir(&self, class: KubeQoSClass) -> PathBuf {
        match class {
            KubeQoSClass::Guaranteed => self.kubepods_dir(),
            KubeQoSClass::Burstable => self.kubepods_dir().join("kubepods-burstable.slice"),
            KubeQoSClass::BestEffort => self.kubepods_dir().join("kubepods-besteffort.slice"),
        }
    }

    pub fn pod_dir(&self, pod: &Pod) -> Option<PathBuf> {
        let uid = pod.metadata.uid.as_deref()?.replace('-', "_");
        let class = kube_qos_class(pod);
        let slice = match class {
            KubeQoSClass::Guaranteed => format!("kubepods-pod{uid}.slice"),
            KubeQoSClass::Burstable => format!("kubepods-burstable-pod{uid}.slice"),
            KubeQoSClass::BestEffort => format!("kubepods-besteffort-pod{uid}.slice"),
        };
        Some(self.qos_dir(class).join(slice))
    }

    /// Container scope from a status id such as `containerd://<id>`
    pub fn container_dir(&self, pod: &Pod, raw_container_id: &str) -> Option<PathBuf> {
        let (runtime_type, id) = parse_container_id(raw_container_id).ok()?;
        let scope = if runtime_type == RUNTIME_DOCKER {
            format!("docker-{id}.scope")
        } else {
            format!("cri-containerd-{id}.scope")
        };
        Some(self.pod_dir(pod)?.join(scope))
    }
}

pub async fn read_file(dir: &Path, file: &str) -> Result<String> {
    let path = dir.join(file);
    let content = fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(content.trim().to_string())
}

pub async fn read_u64(dir: &Path, file: &str) -> Result<u64> {
    read_file(dir, file)
        .await?
        .parse()
        .with_context(|| format!("Failed to parse {} value", file))
}

/// Write `value` into a cgroup file, skipping the write when unchanged.
/// Returns whether the file was written.
pub async fn write_file(dir: &Path, file: &str, value: &str) -> Result<bool> {
    let path = dir.join(file);
    if let Ok(current) = fs::read_to_string(&path).await {
        if current.trim() == value {
            return Ok(false);
        }
    }
    fs::write(&path, value)
        .await
        .with_context(|| format!("Failed to write {} to {}", value, path.display()))?;
    Ok(true)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CpuStat {
    pub usage_usec: u64,
    pub nr_periods: u64,
    pub nr_throttled: u64,
}

pub fn parse_cpu_stat(content: &str) -> CpuStat {
    let mut stat = CpuStat::default();
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let value = value.parse().unwrap_or(0);
        match key {
            "usage_usec" => stat.usage_usec = value,
            "nr_periods" => stat.nr_periods = value,
            "nr_throttled" => stat.nr_throttled = value,
            _ => {}
        }
    }
    stat
}

/// `cpu.max` contents; `quota_us` is `None` for `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuMax {
    pub quota_us: Option<i64>,
    pub period_us: u64,
}

impl CpuMax {
    pub fn format(&self) -> String {
        match self.quota_us {
            Some(quota) => format!("{} {}", quota, self.period_us),
            None => format!("max {}", self.period_us),
        }
    }
}

pub fn parse_cpu_max(content: &str) -> Result<CpuMax> {
    let mut parts = content.split_whitespace();
    let quota = parts.next().context("empty cpu.max")?;
    let period_us = match parts.next() {
        Some(p) => p.parse().with_context(|| format!("invalid cpu.max period {p:?}"))?,
        None => DEFAULT_CFS_PERIOD_US,
    };
    let quota_us = if quota == "max" {
        None
    } else {
        Some(quota.parse().with_context(|| format!("invalid cpu.max quota {quota:?}"))?)
    };
    Ok(CpuMax { quota_us, period_us })
}

/// Parse a memory limit file; `max` is `None`
pub fn parse_memory_limit(content: &str) -> Result<Option<u64>> {
    let value = content.trim();
    if value == "max" {
        return Ok(None);
    }
    Ok(Some(value.parse().with_context(|| format!("invalid memory value {value:?}"))?))
}

/// Render a cpuset list such as `0-3`
pub fn format_cpuset(cpus: &[u32]) -> String {
    let mut ranges: Vec<String> = Vec::new();
    let mut iter = cpus.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        if start == end {
            ranges.push(start.to_string());
        } else {
            ranges.push(format!("{start}-{end}"));
        }
    }
    ranges.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qos::test_support::pod;
    use tempfile::TempDir;

    #[test]
    fn test_parse_cpu_stat() {
        let content = "usage_usec 123456\nuser_usec 100000\nsystem_usec 23456\nnr_periods 50\nnr_throttled 7\nthrottled_usec 900\n";
        let stat = parse_cpu_stat(content);
        assert_eq!(stat.usage_usec, 123456);
        assert_eq!(stat.nr_periods, 50);
        assert_eq!(stat.nr_throttled, 7);
        assert_eq!(parse_cpu_stat(""), CpuStat::default());
    }

    #[test]
    fn test_parse_cpu_max() {
        let limited = parse_cpu_max("200000 100000\n").unwrap();
        assert_eq!(limited.quota_us, Some(200000));
        assert_eq!(limited.format(), "200000 100000");

        let unlimited = parse_cpu_max("max 100000").unwrap();
        assert_eq!(unlimited.quota_us, None);
        assert_eq!(unlimited.format(), "max 100000");

        assert!(parse_cpu_max("").is_err());
        assert!(parse_cpu_max("abc 100000").is_err());
    }

    #[test]
    fn test_parse_memory_limit() {
        assert_eq!(parse_memory_limit("max\n").unwrap(), None);
        assert_eq!(parse_memory_limit("1048576").unwrap(), Some(1048576));
    }

    #[test]
    fn test_format_cpuset() {
        assert_eq!(format_cpuset(&[0, 1, 2, 3]), "0-3");
        assert_eq!(format_cpuset(&[0, 2, 3, 5]), "0,2-3,5");
        assert_eq!(format_cpuset(&[]), "");
    }

    #[test]
    fn test_pod_and_container_dirs() {
        let layout = CgroupLayout::new("/sys/fs/cgroup");

        let be = pod("be", "1234-abcd", Some("BE"), &[], &[]);
        assert_eq!(
            layout.pod_dir(&be).unwrap(),
            PathBuf::from("/sys/fs/cgroup/kubepods.slice/kubepods-besteffort.slice/kubepods-besteffort-pod1234_abcd.slice")
        );

        let guaranteed = pod("g", "ffff", None, &[], &[("cpu", "1"), ("memory", "1Gi")]);
        assert_eq!(
            layout.container_dir(&guaranteed, "containerd://abc").unwrap(),
            PathBuf::from("/sys/fs/cgroup/kubepods.slice/kubepods-podffff.slice/cri-containerd-abc.scope")
        );
        assert_eq!(
            layout.container_dir(&guaranteed, "docker://abc").unwrap(),
            PathBuf::from("/sys/fs/cgroup/kubepods.slice/kubepods-podffff.slice/docker-abc.scope")
        );
        assert!(layout.container_dir(&guaranteed, "abc").is_none());
    }

    #[tokio::test]
    async fn test_write_skips_unchanged_value() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(MEMORY_MIN), "0\n").unwrap();

        assert!(write_file(dir.path(), MEMORY_MIN, "1024").await.unwrap());
        assert!(!write_file(dir.path(), MEMORY_MIN, "1024").await.unwrap());
        assert_eq!(read_u64(dir.path(), MEMORY_MIN).await.unwrap(), 1024);
        assert!(read_u64(dir.path(), MEMORY_HIGH).await.is_err());
    }
}
