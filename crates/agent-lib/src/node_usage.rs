//! Node-level CPU and memory usage from procfs

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::fs;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl MemInfo {
    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.available_bytes)
    }

    pub fn usage_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.used_bytes() as f64 * 100.0 / self.total_bytes as f64
    }
}

/// Parse `/proc/meminfo`; values are reported in kB
pub fn parse_meminfo(content: &str) -> Result<MemInfo> {
    let mut total = None;
    let mut available = None;
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let target = match parts.next() {
            Some("MemTotal:") => &mut total,
            Some("MemAvailable:") => &mut available,
            _ => continue,
        };
        let kb: u64 = parts
            .next()
            .context("missing meminfo value")?
            .parse()
            .context("invalid meminfo value")?;
        *target = Some(kb * 1024);
    }
    Ok(MemInfo {
        total_bytes: total.context("MemTotal not found in meminfo")?,
        available_bytes: available.context("MemAvailable not found in meminfo")?,
    })
}

/// Aggregate jiffies from the `cpu` line of `/proc/stat`
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub total: u64,
    pub idle: u64,
}

pub fn parse_proc_stat(content: &str) -> Result<(CpuTimes, usize)> {
    let mut times = None;
    let mut cpus = 0;
    for line in content.lines() {
        let Some(label) = line.split_whitespace().next() else {
            continue;
        };
        if label == "cpu" {
            let fields: Vec<u64> = line
                .split_whitespace()
                .skip(1)
                .map(|v| v.parse().unwrap_or(0))
                .collect();
            // idle + iowait
            let idle = fields.get(3).copied().unwrap_or(0) + fields.get(4).copied().unwrap_or(0);
            // guest time is already included in user/nice
            let total = fields.iter().take(8).sum();
            times = Some(CpuTimes { total, idle });
        } else if label.starts_with("cpu") && label[3..].chars().all(|c| c.is_ascii_digit()) {
            cpus += 1;
        }
    }
    Ok((times.context("cpu line not found in /proc/stat")?, cpus))
}

/// Reads node usage, keeping the previous `/proc/stat` sample for deltas
#[derive(Debug)]
pub struct NodeUsageReader {
    proc_root: PathBuf,
    last_cpu: Mutex<Option<CpuTimes>>,
}

impl NodeUsageReader {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            last_cpu: Mutex::new(None),
        }
    }

    pub async fn memory(&self) -> Result<MemInfo> {
        let path = self.proc_root.join("meminfo");
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        parse_meminfo(&content)
    }

    pub async fn num_cpus(&self) -> Result<usize> {
        let (_, cpus) = self.read_proc_stat().await?;
        Ok(cpus)
    }

    /// Cores in use since the previous call; `None` on the first sample
    pub async fn cpu_used_cores(&self) -> Result<Option<f64>> {
        let (times, cpus) = self.read_proc_stat().await?;
        let previous = self
            .last_cpu
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(times);
        let Some(previous) = previous else {
            return Ok(None);
        };
        let total = times.total.saturating_sub(previous.total);
        if total == 0 {
            return Ok(Some(0.0));
        }
        let busy = total.saturating_sub(times.idle.saturating_sub(previous.idle));
        Ok(Some(busy as f64 / total as f64 * cpus as f64))
    }

    async fn read_proc_stat(&self) -> Result<(CpuTimes, usize)> {
        let path = self.proc_root.join("stat");
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        parse_proc_stat(&content)
    }
}
