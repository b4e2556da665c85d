//! Compressor thread budget derived from container CPU limits.
//!
//! Inside a Kubernetes pod the host CPU count says nothing about how much CPU
//! the pod may use, so the CFS quota is turned into a whole number of cores.

use anyhow::{bail, Context, Result};
use std::fs;
use std::io;
use std::path::PathBuf;

/// Substring of the cgroup membership that marks a constrained pod.
pub const CONSTRAINT_MARKER: &str = "kubepods";

const MEMBERSHIP_PATH: &str = "/proc/1/cgroup";
const CGROUP_V1_CPU_DIR: &str = "/sys/fs/cgroup/cpu";
const CGROUP_V2_CPU_MAX: &str = "/sys/fs/cgroup/cpu.max";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeItem {
    Membership,
    CpuQuota,
    CpuPeriod,
}

/// Source of cgroup values.
pub trait ConstraintProbe {
    fn read(&self, item: ProbeItem) -> io::Result<String>;
}

/// Reads the running host's cgroup files.
///
/// Quota and period come from cgroup v1 `cpu.cfs_*_us`, falling back to the
/// cgroup v2 `cpu.max` pair.
#[derive(Debug, Clone)]
pub struct HostProbe {
    membership: PathBuf,
    v1_dir: PathBuf,
    v2_cpu_max: PathBuf,
}

impl Default for HostProbe {
    fn default() -> Self {
        Self {
            membership: PathBuf::from(MEMBERSHIP_PATH),
            v1_dir: PathBuf::from(CGROUP_V1_CPU_DIR),
            v2_cpu_max: PathBuf::from(CGROUP_V2_CPU_MAX),
        }
    }
}

impl HostProbe {
    /// Probe rooted somewhere other than `/`.
    pub fn with_root(root: &std::path::Path) -> Self {
        Self {
            membership: root.join("proc/1/cgroup"),
            v1_dir: root.join("sys/fs/cgroup/cpu"),
            v2_cpu_max: root.join("sys/fs/cgroup/cpu.max"),
        }
    }

    fn read_v2_field(&self, index: usize) -> io::Result<String> {
        let text = fs::read_to_string(&self.v2_cpu_max)?;
        let field = text.split_whitespace().nth(index).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed '{}': {:?}", self.v2_cpu_max.display(), text),
            )
        })?;
        Ok(if field == "max" { "-1".to_string() } else { field.to_string() })
    }
}

impl ConstraintProbe for HostProbe {
    fn read(&self, item: ProbeItem) -> io::Result<String> {
        match item {
            ProbeItem::Membership => fs::read_to_string(&self.membership),
            ProbeItem::CpuQuota => fs::read_to_string(self.v1_dir.join("cpu.cfs_quota_us"))
                .or_else(|_| self.read_v2_field(0)),
            ProbeItem::CpuPeriod => fs::read_to_string(self.v1_dir.join("cpu.cfs_period_us"))
                .or_else(|_| self.read_v2_field(1)),
        }
    }
}

pub struct ThreadBudgetEstimator<P: ConstraintProbe> {
    probe: P,
}

impl Default for ThreadBudgetEstimator<HostProbe> {
    fn default() -> Self {
        Self::new(HostProbe::default())
    }
}

impl<P: ConstraintProbe> ThreadBudgetEstimator<P> {
    pub fn new(probe: P) -> Self {
        Self { probe }
    }

    /// Thread hint for the compressor; 0 lets it choose its own default.
    pub fn estimate(&self) -> u32 {
        match self.try_estimate() {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("cannot read CPU quota ({e:#}); leaving compressor threads unset");
                0
            }
        }
    }

    fn try_estimate(&self) -> Result<u32> {
        // Without the marker the quota files are not read at all; many hosts
        // lack them.
        let membership = match self.probe.read(ProbeItem::Membership) {
            Ok(text) => text,
            Err(_) => return Ok(0),
        };
        if !membership.contains(CONSTRAINT_MARKER) {
            return Ok(0);
        }

        let quota = self.read_int(ProbeItem::CpuQuota)?;
        let period = self.read_int(ProbeItem::CpuPeriod)?;
        tracing::debug!(quota, period, "container CPU limits");
        Ok(threads_for_quota(quota, period))
    }

    fn read_int(&self, item: ProbeItem) -> Result<i64> {
        let raw = self
            .probe
            .read(item)
            .with_context(|| format!("Failed to read {item:?}"))?;
        let value = raw.trim();
        if value == "max" {
            return Ok(-1);
        }
        match value.parse::<i64>() {
            Ok(v) => Ok(v),
            Err(_) => bail!("unparseable {item:?} value {value:?}"),
        }
    }
}

/// `ceil(quota / period)`, or 0 when the quota is unlimited.
pub fn threads_for_quota(quota: i64, period: i64) -> u32 {
    if quota < 0 || period <= 0 {
        return 0;
    }
    let cores = quota.unsigned_abs().div_ceil(period.unsigned_abs());
    u32::try_from(cores).unwrap_or(u32::MAX)
}
