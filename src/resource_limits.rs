/// Resource limit management through cgroup control files
/// Writes CPU, memory, pids and block I/O limits in the format of the detected cgroup version.
use crate::cgroup::{CgroupFile, CgroupHandle, CgroupManager, CgroupVersion};
use crate::metrics::parse_limit;
use crate::pseudofs::FsError;
use crate::types::{ProbeError, Result};
use nix::sys::stat::{major, minor, stat, SFlag};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Quota period used when none is given
pub const DEFAULT_CPU_PERIOD_US: u64 = 100_000;
/// Unlimited value of every v2 limit file (and of v1 pids.max)
pub const UNLIMITED_SENTINEL: &str = "max";
/// Unlimited value of v1 quota and memory limit files
const V1_UNLIMITED: &str = "-1";

/// A numeric limit or the absence of one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitValue {
    Value(u64),
    Unlimited,
}

impl LimitValue {
    /// Byte limits treat zero as "no limit", never as a zero-byte cap
    pub fn from_bytes(bytes: u64) -> Self {
        if bytes == 0 {
            LimitValue::Unlimited
        } else {
            LimitValue::Value(bytes)
        }
    }

    pub fn as_option(self) -> Option<u64> {
        match self {
            LimitValue::Value(value) => Some(value),
            LimitValue::Unlimited => None,
        }
    }
}

impl fmt::Display for LimitValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitValue::Value(value) => write!(f, "{}", value),
            LimitValue::Unlimited => f.write_str(UNLIMITED_SENTINEL),
        }
    }
}

impl FromStr for LimitValue {
    type Err = ProbeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "max" | "unlimited" => Ok(LimitValue::Unlimited),
            value => value
                .parse()
                .map(LimitValue::Value)
                .map_err(|_| ProbeError::Config(format!("invalid limit '{}'", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CpuLimit {
    /// Fraction of CPUs; quota = round(cores * period)
    Cores { cores: f64, period_us: Option<u64> },
    /// Explicit CFS bandwidth
    Quota { quota_us: u64, period_us: u64 },
    Unlimited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLimit {
    pub limit: LimitValue,
    /// Swap allowance on top of `limit`
    pub swap: Option<LimitValue>,
}

impl MemoryLimit {
    pub fn bytes(bytes: u64) -> Self {
        Self {
            limit: LimitValue::from_bytes(bytes),
            swap: None,
        }
    }

    pub fn unlimited() -> Self {
        Self {
            limit: LimitValue::Unlimited,
            swap: None,
        }
    }

    pub fn with_swap(mut self, swap: LimitValue) -> Self {
        self.swap = Some(swap);
        self
    }
}

/// Block device number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceId {
    pub major: u64,
    pub minor: u64,
}

impl DeviceId {
    pub fn new(major: u64, minor: u64) -> Self {
        Self { major, minor }
    }

    /// Device of a block special file, or the device holding any other path
    pub fn from_path(path: &Path) -> Result<Self> {
        let st = stat(path).map_err(|errno| match errno {
            nix::errno::Errno::ENOENT => ProbeError::NotFound(path.display().to_string()),
            nix::errno::Errno::EACCES => ProbeError::PermissionDenied(path.display().to_string()),
            other => ProbeError::Io(other.into()),
        })?;
        let kind = SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT;
        let dev = if kind == SFlag::S_IFBLK {
            st.st_rdev
        } else {
            st.st_dev
        };
        Ok(Self::new(major(dev), minor(dev)))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

impl FromStr for DeviceId {
    type Err = ProbeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid =
            || ProbeError::Config(format!("invalid device '{}', expected MAJOR:MINOR", s));
        let (major, minor) = s.trim().split_once(':').ok_or_else(invalid)?;
        Ok(Self {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoLimit {
    pub device: DeviceId,
    pub write_bps: LimitValue,
    pub read_bps: Option<LimitValue>,
}

/// Limits to apply to one group; absent fields are left untouched
#[derive(Debug, Clone, Default)]
pub struct ResourceLimitSpec {
    pub cpu: Option<CpuLimit>,
    pub memory: Option<MemoryLimit>,
    pub pids: Option<LimitValue>,
    pub io: Option<IoLimit>,
}

/// Version-aware limit writer
pub struct ResourceLimitController<'a> {
    cgroups: &'a CgroupManager,
    default_period_us: u64,
}

impl<'a> ResourceLimitController<'a> {
    pub fn new(cgroups: &'a CgroupManager) -> Self {
        Self {
            cgroups,
            default_period_us: DEFAULT_CPU_PERIOD_US,
        }
    }

    pub fn with_default_period(mut self, period_us: u64) -> Self {
        self.default_period_us = period_us;
        self
    }

    fn control_file(&self, handle: &CgroupHandle, file: CgroupFile) -> Result<PathBuf> {
        let path = self.cgroups.resolve_file(handle, file).ok_or_else(|| {
            ProbeError::UnsupportedController(format!(
                "{:?} has no control file under cgroup {}",
                file,
                handle.version()
            ))
        })?;
        if !self.cgroups.fs().exists(&path) {
            return Err(ProbeError::UnsupportedController(path.display().to_string()));
        }
        Ok(path)
    }

    fn write(&self, path: &Path, content: &str) -> Result<()> {
        log::debug!("Writing '{}' to {}", content, path.display());
        self.cgroups
            .fs()
            .write_text(path, content)
            .map_err(|e| match e {
                FsError::NotFound(path) => {
                    ProbeError::UnsupportedController(path.display().to_string())
                }
                other => other.into(),
            })
    }

    fn render_memory(&self, limit: LimitValue) -> String {
        match (limit, self.cgroups.version()) {
            (LimitValue::Value(bytes), _) if bytes > 0 => bytes.to_string(),
            (_, CgroupVersion::V2) => UNLIMITED_SENTINEL.to_string(),
            (_, CgroupVersion::V1) => V1_UNLIMITED.to_string(),
        }
    }

    pub fn set_cpu_limit(&self, name: &str, limit: CpuLimit) -> Result<()> {
        let handle = self.cgroups.require(name)?;

        let (quota_us, period_us) = match limit {
            CpuLimit::Cores { cores, period_us } => {
                if !cores.is_finite() || cores <= 0.0 {
                    return Err(ProbeError::Config(format!(
                        "CPU cores must be a positive number, got {}",
                        cores
                    )));
                }
                let period_us = period_us.unwrap_or(self.default_period_us);
                let quota_us = (cores * period_us as f64).round() as u64;
                if quota_us == 0 {
                    return Err(ProbeError::Config(format!(
                        "{} cores is below one microsecond per {} us period",
                        cores, period_us
                    )));
                }
                (Some(quota_us), period_us)
            }
            CpuLimit::Quota { quota_us: 0, .. } => {
                return Err(ProbeError::Config("CPU quota must be greater than 0".to_string()));
            }
            CpuLimit::Quota { quota_us, period_us } => (Some(quota_us), period_us),
            CpuLimit::Unlimited => (None, self.default_period_us),
        };
        if period_us == 0 {
            return Err(ProbeError::Config("CPU period must be greater than 0".to_string()));
        }

        match handle.version() {
            CgroupVersion::V2 => {
                let path = self.control_file(&handle, CgroupFile::CpuLimit)?;
                let quota =
                    quota_us.map_or_else(|| UNLIMITED_SENTINEL.to_string(), |q| q.to_string());
                self.write(&path, &format!("{} {}", quota, period_us))?;
            }
            CgroupVersion::V1 => {
                let period_path = self.control_file(&handle, CgroupFile::CpuPeriod)?;
                let quota_path = self.control_file(&handle, CgroupFile::CpuLimit)?;
                // The kernel validates the quota against the current period
                self.write(&period_path, &period_us.to_string())?;
                let quota = quota_us.map_or_else(|| V1_UNLIMITED.to_string(), |q| q.to_string());
                self.write(&quota_path, &quota)?;
            }
        }

        log::info!("Set CPU limit of '{}' to {:?}", name, limit);
        Ok(())
    }

    pub fn set_memory_limit(&self, name: &str, limit: MemoryLimit) -> Result<()> {
        let handle = self.cgroups.require(name)?;
        let path = self.control_file(&handle, CgroupFile::MemoryLimit)?;
        let content = self.render_memory(limit.limit);

        let swap = match limit.swap {
            Some(swap) => {
                let swap_path = self.control_file(&handle, CgroupFile::SwapLimit)?;
                let swap_content = match handle.version() {
                    CgroupVersion::V2 => self.render_memory(swap),
                    // v1 memsw is memory plus swap combined
                    CgroupVersion::V1 => match (limit.limit.as_option(), swap.as_option()) {
                        (Some(memory), Some(swap)) if memory > 0 => {
                            memory.saturating_add(swap).to_string()
                        }
                        _ => V1_UNLIMITED.to_string(),
                    },
                };
                Some((swap_path, swap_content))
            }
            None => None,
        };

        // v1 rejects any write that leaves memsw below the memory limit
        let memsw_first = match (&swap, handle.version()) {
            (Some((swap_path, swap_content)), CgroupVersion::V1) => {
                self.raises_memsw(swap_path, swap_content)
            }
            _ => false,
        };

        if memsw_first {
            if let Some((swap_path, swap_content)) = &swap {
                self.write(swap_path, swap_content)?;
            }
            self.write(&path, &content)?;
        } else {
            self.write(&path, &content)?;
            if let Some((swap_path, swap_content)) = &swap {
                self.write(swap_path, swap_content)?;
            }
        }

        log::info!("Set memory limit of '{}' to {}", name, limit.limit);
        Ok(())
    }

    /// Whether `new` lifts memory.memsw.limit_in_bytes above its current value
    fn raises_memsw(&self, path: &Path, new: &str) -> bool {
        let current = match self.cgroups.fs().read_text(path) {
            Ok(content) => parse_limit(&content),
            Err(e) => {
                log::debug!("Cannot read {}: {}", path.display(), e);
                return false;
            }
        };
        match (parse_limit(new), current) {
            (_, Ok(None)) | (_, Err(_)) => false,
            (Ok(None), Ok(Some(_))) => true,
            (Ok(Some(new)), Ok(Some(current))) => new > current,
            (Err(_), _) => false,
        }
    }

    pub fn set_pids_limit(&self, name: &str, limit: LimitValue) -> Result<()> {
        let handle = self.cgroups.require(name)?;
        let path = self.control_file(&handle, CgroupFile::PidsLimit)?;
        self.write(&path, &limit.to_string())?;
        log::info!("Set pids limit of '{}' to {}", name, limit);
        Ok(())
    }

    /// Throttle block I/O on one device
    ///
    /// Every call writes the full key set it was given (`wbps`, plus `rbps`
    /// when a read limit is present); keys not given are left to the kernel.
    pub fn set_io_limit(&self, name: &str, limit: IoLimit) -> Result<()> {
        let handle = self.cgroups.require(name)?;

        match handle.version() {
            CgroupVersion::V2 => {
                let path = self.control_file(&handle, CgroupFile::IoWriteLimit)?;
                let mut line = limit.device.to_string();
                if let Some(read_bps) = limit.read_bps {
                    line.push_str(&format!(" rbps={}", read_bps));
                }
                line.push_str(&format!(" wbps={}", limit.write_bps));
                self.write(&path, &line)?;
            }
            CgroupVersion::V1 => {
                // A zero rate removes the device rule in v1
                let render = |value: LimitValue| value.as_option().unwrap_or(0);
                let path = self.control_file(&handle, CgroupFile::IoWriteLimit)?;
                self.write(&path, &format!("{} {}", limit.device, render(limit.write_bps)))?;
                if let Some(read_bps) = limit.read_bps {
                    let path = self.control_file(&handle, CgroupFile::IoReadLimit)?;
                    self.write(&path, &format!("{} {}", limit.device, render(read_bps)))?;
                }
            }
        }

        log::info!("Set I/O limit of '{}' on {} to wbps={}", name, limit.device, limit.write_bps);
        Ok(())
    }

    /// Apply every limit present in `spec`, CPU first and I/O last; returns how many were set
    pub fn apply(&self, name: &str, spec: &ResourceLimitSpec) -> Result<usize> {
        let mut applied = 0;
        if let Some(cpu) = spec.cpu {
            self.set_cpu_limit(name, cpu)?;
            applied += 1;
        }
        if let Some(memory) = spec.memory {
            self.set_memory_limit(name, memory)?;
            applied += 1;
        }
        if let Some(pids) = spec.pids {
            self.set_pids_limit(name, pids)?;
            applied += 1;
        }
        if let Some(io) = spec.io {
            self.set_io_limit(name, io)?;
            applied += 1;
        }
        Ok(applied)
    }
}
