//! LLC and memory bandwidth partitioning through resctrl

use super::PolicyContext;
use crate::cgroup::write_file;
use crate::features::Feature;
use crate::qos::{resource_qos_for, QoSClass};
use crate::scheduler::Reconciler;
use crate::slo::ResctrlQoS;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::OnceLock;
use tokio::fs;
use tokio::sync::broadcast;
use tracing::{info, warn};

const SCHEMATA: &str = "schemata";

/// Resctrl groups managed by the agent
pub const RESCTRL_GROUPS: [(QoSClass, &str); 3] =
    [(QoSClass::Lsr, "LSR"), (QoSClass::Ls, "LS"), (QoSClass::Be, "BE")];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResctrlInfo {
    /// Bits in the L3 capacity bitmask
    pub cbm_width: u32,
    pub l3_ids: Vec<u32>,
    pub mb_ids: Vec<u32>,
}

/// Domain ids of a schemata line such as `L3:0=fff;1=fff`
fn parse_domain_ids(schemata: &str, resource: &str) -> Vec<u32> {
    schemata
        .lines()
        .filter_map(|line| line.trim().split_once(':'))
        .filter(|(name, _)| name.trim() == resource)
        .flat_map(|(_, domains)| {
            domains
                .split(';')
                .filter_map(|d| d.split_once('=').and_then(|(id, _)| id.trim().parse().ok()))
                .collect::<Vec<u32>>()
        })
        .collect()
}

pub fn parse_resctrl_info(root_schemata: &str, cbm_mask: &str) -> Result<ResctrlInfo> {
    let mask = u64::from_str_radix(cbm_mask.trim(), 16)
        .with_context(|| format!("invalid cbm_mask {:?}", cbm_mask.trim()))?;
    let l3_ids = parse_domain_ids(root_schemata, "L3");
    if l3_ids.is_empty() {
        bail!("no L3 domains in resctrl schemata");
    }
    Ok(ResctrlInfo {
        cbm_width: mask.count_ones(),
        l3_ids,
        mb_ids: parse_domain_ids(root_schemata, "MB"),
    })
}

/// Contiguous capacity bitmask covering `[start%, end%)` of the cache ways
pub fn cat_mask(cbm_width: u32, start_percent: i64, end_percent: i64) -> Option<u64> {
    let way = |percent: i64| ((cbm_width as i64 * percent.clamp(0, 100)) as f64 / 100.0).ceil() as u32;
    let (start, end) = (way(start_percent), way(end_percent));
    if end <= start {
        return None;
    }
    Some((1u64 << end) - (1u64 << start))
}

/// Render the schemata of one group
pub fn schemata_for(info: &ResctrlInfo, qos: &ResctrlQoS) -> Option<String> {
    let mask = cat_mask(
        info.cbm_width,
        qos.cat_range_start_percent.unwrap_or(0),
        qos.cat_range_end_percent.unwrap_or(100),
    )?;
    let l3 = info
        .l3_ids
        .iter()
        .map(|id| format!("{id}={mask:x}"))
        .collect::<Vec<_>>()
        .join(";");
    let mut schemata = format!("L3:{l3}\n");
    if !info.mb_ids.is_empty() {
        let mba = qos.mba_percent.unwrap_or(100);
        let mb = info
            .mb_ids
            .iter()
            .map(|id| format!("{id}={mba}"))
            .collect::<Vec<_>>()
            .join(";");
        schemata.push_str(&format!("MB:{mb}\n"));
    }
    Some(schemata)
}

pub struct ResctrlReconciler {
    ctx: PolicyContext,
    root: PathBuf,
    info: OnceLock<ResctrlInfo>,
}

impl ResctrlReconciler {
    pub fn new(ctx: PolicyContext, root: impl Into<PathBuf>) -> Self {
        Self {
            ctx,
            root: root.into(),
            info: OnceLock::new(),
        }
    }
}

#[async_trait]
impl Reconciler for ResctrlReconciler {
    fn name(&self) -> &'static str {
        "resctrl"
    }

    fn features(&self) -> Vec<Feature> {
        vec![Feature::RdtResctrl]
    }

    async fn init(&self, _shutdown: broadcast::Receiver<()>) -> Result<()> {
        let schemata = fs::read_to_string(self.root.join(SCHEMATA))
            .await
            .with_context(|| format!("resctrl not mounted at {}", self.root.display()))?;
        let cbm_mask = fs::read_to_string(self.root.join("info/L3/cbm_mask"))
            .await
            .context("L3 CAT not supported")?;
        let info = parse_resctrl_info(&schemata, &cbm_mask)?;

        for (_, group) in RESCTRL_GROUPS {
            let dir = self.root.join(group);
            fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to create resctrl group {}", dir.display()))?;
        }
        info!(cbm_width = info.cbm_width, l3_domains = info.l3_ids.len(), "Resctrl initialized");
        // init runs once per process, a second set is a no-op
        let _ = self.info.set(info);
        Ok(())
    }

    async fn reconcile(&self) -> Result<()> {
        let Some(info) = self.info.get() else {
            return Ok(());
        };
        let Some(spec) = self.ctx.store.spec_snapshot() else {
            return Ok(());
        };
        let Some(strategy) = spec.resource_qos_strategy else {
            return Ok(());
        };

        for (class, group) in RESCTRL_GROUPS {
            let Some(cfg) = resource_qos_for(&strategy, class).and_then(|q| q.resctrl_qos.as_ref()) else {
                continue;
            };
            if cfg.enable != Some(true) {
                continue;
            }
            let Some(schemata) = schemata_for(info, &cfg.resctrl_qos) else {
                warn!(group, "Empty CAT range, skipping resctrl group");
                continue;
            };
            let dir = self.root.join(group);
            match write_file(&dir, SCHEMATA, schemata.trim_end()).await {
                Ok(true) => info!(group, schemata = %schemata.trim_end(), "Updated resctrl schemata"),
                Ok(false) => {}
                Err(e) => warn!(group, error = %e, "Failed to write resctrl schemata"),
            }
        }
        Ok(())
    }
}
