/// Cgroup metrics collection
/// Reads usage counters, limits, I/O totals and pressure stall information for a group.
use crate::cgroup::{CgroupFile, CgroupHandle, CgroupManager, CgroupVersion, PressureResource};
use crate::pseudofs::FsError;
use crate::types::{PollOptions, ProbeError, Result};
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

/// v1 reports "no limit" as the page counter maximum rounded down to a page
const V1_LIMIT_CEILING: u64 = 0x7FFF_FFFF_FFFF_F000;

/// Value of `key` in a `key value` per-line file such as cpu.stat or memory.events
pub fn parse_keyed_value(content: &str, key: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        if parts.next()? != key {
            return None;
        }
        parts.next()?.parse().ok()
    })
}

/// Single-number file such as memory.current or cpuacct.usage
pub fn parse_single_value(content: &str) -> Option<u64> {
    content.trim().parse().ok()
}

/// Limit file content; `Ok(None)` means unlimited
pub fn parse_limit(content: &str) -> std::result::Result<Option<u64>, String> {
    match content.trim() {
        "max" | "-1" => Ok(None),
        value => match value.parse::<u64>() {
            Ok(limit) if limit >= V1_LIMIT_CEILING => Ok(None),
            Ok(limit) => Ok(Some(limit)),
            Err(_) => Err(format!("unexpected limit value '{}'", value)),
        },
    }
}

/// Bytes transferred, summed over every device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoTotals {
    pub read_bytes: u64,
    pub write_bytes: u64,
}

/// Sum `rbytes=`/`wbytes=` over the per-device lines of io.stat
pub fn parse_io_stat(content: &str) -> IoTotals {
    let mut totals = IoTotals::default();
    for line in content.lines() {
        // First token is the device number
        for field in line.split_whitespace().skip(1) {
            let Some((key, value)) = field.split_once('=') else {
                continue;
            };
            let Ok(value) = value.parse::<u64>() else {
                continue;
            };
            match key {
                "rbytes" => totals.read_bytes = totals.read_bytes.saturating_add(value),
                "wbytes" => totals.write_bytes = totals.write_bytes.saturating_add(value),
                _ => {}
            }
        }
    }
    totals
}

/// Sum the `<dev> Read <n>` and `<dev> Write <n>` lines of a v1 blkio stat file
pub fn parse_io_service_bytes(content: &str) -> IoTotals {
    let mut totals = IoTotals::default();
    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        // The trailing "Total <n>" line has no device column
        if parts.len() != 3 {
            continue;
        }
        let Ok(value) = parts[2].parse::<u64>() else {
            continue;
        };
        match parts[1] {
            "Read" => totals.read_bytes = totals.read_bytes.saturating_add(value),
            "Write" => totals.write_bytes = totals.write_bytes.saturating_add(value),
            _ => {}
        }
    }
    totals
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PressureStats {
    pub avg10: f64,
    pub avg60: f64,
    pub avg300: f64,
    pub total_stall_us: u64,
}

/// Parse the `some` line of a pressure file; the `full` line is ignored
pub fn parse_pressure(content: &str) -> Option<PressureStats> {
    let line = content
        .lines()
        .find(|line| line.split_whitespace().next() == Some("some"))?;

    let (mut avg10, mut avg60, mut avg300, mut total) = (None, None, None, None);
    for field in line.split_whitespace().skip(1) {
        let (key, value) = field.split_once('=')?;
        match key {
            "avg10" => avg10 = value.parse().ok(),
            "avg60" => avg60 = value.parse().ok(),
            "avg300" => avg300 = value.parse().ok(),
            "total" => total = value.parse().ok(),
            _ => {}
        }
    }

    Some(PressureStats {
        avg10: avg10?,
        avg60: avg60?,
        avg300: avg300?,
        total_stall_us: total?,
    })
}

/// Pressure state of one resource
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum PressureReading {
    /// The hierarchy has no pressure files at all (v1)
    Unsupported,
    /// Missing or unreadable file on a hierarchy that normally has one
    Unavailable,
    Stats(PressureStats),
}

/// Value read from a limit file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitReading {
    Limited(u64),
    /// "max", the v1 ceiling, or no limit file at all
    Unlimited,
    /// The file exists but could not be read or parsed
    Unknown,
}

impl fmt::Display for LimitReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitReading::Limited(value) => write!(f, "{}", value),
            LimitReading::Unlimited => f.write_str("max"),
            LimitReading::Unknown => f.write_str("unknown"),
        }
    }
}

/// A number when limited, `null` when unlimited, `"unknown"` otherwise
impl Serialize for LimitReading {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            LimitReading::Limited(value) => serializer.serialize_u64(*value),
            LimitReading::Unlimited => serializer.serialize_none(),
            LimitReading::Unknown => serializer.serialize_str("unknown"),
        }
    }
}

/// Point-in-time metrics of one control group
#[derive(Debug, Clone, Serialize)]
pub struct CgroupMetricsSnapshot {
    pub name: String,
    pub version: CgroupVersion,
    pub captured_at: DateTime<Utc>,
    pub cpu_usage_ns: u64,
    pub memory_current_bytes: u64,
    pub memory_peak_bytes: u64,
    pub memory_limit_bytes: LimitReading,
    pub memory_fail_count: u64,
    pub pids_current: u64,
    pub pids_max: LimitReading,
    pub blkio_read_bytes: u64,
    pub blkio_write_bytes: u64,
    pub pressure: BTreeMap<PressureResource, PressureReading>,
}

impl CgroupMetricsSnapshot {
    /// Flat (metric, value) pairs in a fixed order, shared by the CSV and text renderings
    pub fn metric_rows(&self) -> Vec<(String, String)> {
        let mut rows = vec![
            ("cpu_usage_ns".to_string(), self.cpu_usage_ns.to_string()),
            ("memory_current_bytes".to_string(), self.memory_current_bytes.to_string()),
            ("memory_peak_bytes".to_string(), self.memory_peak_bytes.to_string()),
            ("memory_limit_bytes".to_string(), self.memory_limit_bytes.to_string()),
            ("memory_fail_count".to_string(), self.memory_fail_count.to_string()),
            ("pids_current".to_string(), self.pids_current.to_string()),
            ("pids_max".to_string(), self.pids_max.to_string()),
            ("blkio_read_bytes".to_string(), self.blkio_read_bytes.to_string()),
            ("blkio_write_bytes".to_string(), self.blkio_write_bytes.to_string()),
        ];

        for (resource, reading) in &self.pressure {
            let prefix = format!("{}_pressure", resource.label());
            match reading {
                PressureReading::Stats(stats) => {
                    rows.push((format!("{}_avg10", prefix), format!("{:.2}", stats.avg10)));
                    rows.push((format!("{}_avg60", prefix), format!("{:.2}", stats.avg60)));
                    rows.push((format!("{}_avg300", prefix), format!("{:.2}", stats.avg300)));
                    rows.push((format!("{}_total_us", prefix), stats.total_stall_us.to_string()));
                }
                PressureReading::Unsupported => rows.push((prefix, "unsupported".to_string())),
                PressureReading::Unavailable => rows.push((prefix, "unavailable".to_string())),
            }
        }
        rows
    }
}

pub struct CgroupMetricsReader<'a> {
    cgroups: &'a CgroupManager,
}

impl<'a> CgroupMetricsReader<'a> {
    pub fn new(cgroups: &'a CgroupManager) -> Self {
        Self { cgroups }
    }

    pub fn snapshot(&self, name: &str) -> Result<CgroupMetricsSnapshot> {
        let handle = self.cgroups.require(name)?;
        Ok(self.collect(&handle))
    }

    /// System-wide metrics from the root group
    pub fn snapshot_root(&self) -> Result<CgroupMetricsSnapshot> {
        let handle = self.cgroups.root_handle();
        if !self.cgroups.fs().exists(handle.path()) {
            return Err(ProbeError::NotFound(format!(
                "cgroup root {}",
                handle.path().display()
            )));
        }
        Ok(self.collect(&handle))
    }

    fn collect(&self, handle: &CgroupHandle) -> CgroupMetricsSnapshot {
        let cpu_usage_ns = match handle.version() {
            CgroupVersion::V2 => self
                .read_counter(handle, CgroupFile::CpuUsage, |c| parse_keyed_value(c, "usage_usec"))
                .saturating_mul(1000),
            CgroupVersion::V1 => {
                self.read_counter(handle, CgroupFile::CpuUsage, parse_single_value)
            }
        };
        let memory_fail_count = match handle.version() {
            CgroupVersion::V2 => {
                self.read_counter(handle, CgroupFile::MemoryFailures, |c| {
                    parse_keyed_value(c, "max")
                })
            }
            CgroupVersion::V1 => {
                self.read_counter(handle, CgroupFile::MemoryFailures, parse_single_value)
            }
        };
        let io = match self.read(handle, CgroupFile::IoStat) {
            Some((_, content)) => match handle.version() {
                CgroupVersion::V2 => parse_io_stat(&content),
                CgroupVersion::V1 => parse_io_service_bytes(&content),
            },
            None => IoTotals::default(),
        };
        let pressure = PressureResource::ALL
            .iter()
            .map(|&resource| (resource, self.read_pressure(handle, resource)))
            .collect();

        CgroupMetricsSnapshot {
            name: handle.name().to_string(),
            version: handle.version(),
            captured_at: Utc::now(),
            cpu_usage_ns,
            memory_current_bytes: self.read_counter(
                handle,
                CgroupFile::MemoryCurrent,
                parse_single_value,
            ),
            memory_peak_bytes: self.read_counter(
                handle,
                CgroupFile::MemoryPeak,
                parse_single_value,
            ),
            memory_limit_bytes: self.read_limit(handle, CgroupFile::MemoryLimit),
            memory_fail_count,
            pids_current: self.read_counter(handle, CgroupFile::PidsCurrent, parse_single_value),
            pids_max: self.read_limit(handle, CgroupFile::PidsLimit),
            blkio_read_bytes: io.read_bytes,
            blkio_write_bytes: io.write_bytes,
            pressure,
        }
    }

    /// Pressure stall information; v1 has none and is answered without touching the filesystem
    pub fn read_pressure(
        &self,
        handle: &CgroupHandle,
        resource: PressureResource,
    ) -> PressureReading {
        if handle.version() == CgroupVersion::V1 {
            return PressureReading::Unsupported;
        }
        match self.read(handle, CgroupFile::Pressure(resource)) {
            Some((path, content)) => match parse_pressure(&content) {
                Some(stats) => PressureReading::Stats(stats),
                None => {
                    log::warn!("Malformed pressure data in {}", path.display());
                    PressureReading::Unavailable
                }
            },
            None => PressureReading::Unavailable,
        }
    }

    fn read(&self, handle: &CgroupHandle, file: CgroupFile) -> Option<(PathBuf, String)> {
        let path = self.cgroups.resolve_file(handle, file)?;
        match self.cgroups.fs().read_text(&path) {
            Ok(content) => Some((path, content)),
            Err(FsError::NotFound(_)) => {
                log::debug!("{} not present", path.display());
                None
            }
            Err(e) => {
                log::warn!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    fn read_counter<F>(&self, handle: &CgroupHandle, file: CgroupFile, parse: F) -> u64
    where
        F: Fn(&str) -> Option<u64>,
    {
        let Some((path, content)) = self.read(handle, file) else {
            return 0;
        };
        parse(&content).unwrap_or_else(|| {
            log::warn!("Malformed counter in {}: '{}'", path.display(), content.trim());
            0
        })
    }

    fn read_limit(&self, handle: &CgroupHandle, file: CgroupFile) -> LimitReading {
        let Some(path) = self.cgroups.resolve_file(handle, file) else {
            return LimitReading::Unlimited;
        };
        match self.cgroups.fs().read_text(&path) {
            Ok(content) => match parse_limit(&content) {
                Ok(Some(limit)) => LimitReading::Limited(limit),
                Ok(None) => LimitReading::Unlimited,
                Err(detail) => {
                    log::warn!("Malformed limit in {}: {}", path.display(), detail);
                    LimitReading::Unknown
                }
            },
            Err(FsError::NotFound(_)) => {
                log::debug!("{} not present", path.display());
                LimitReading::Unlimited
            }
            Err(e) => {
                log::warn!("Failed to read {}: {}", path.display(), e);
                LimitReading::Unknown
            }
        }
    }

    /// Poll pids.current until the same value is seen `stable_reads` times in a row
    pub fn wait_for_pids_settled(&self, name: &str, options: PollOptions) -> Result<u64> {
        let handle = self.cgroups.require(name)?;
        let path = self
            .cgroups
            .resolve_file(&handle, CgroupFile::PidsCurrent)
            .ok_or_else(|| ProbeError::UnsupportedController("pids.current".to_string()))?;
        let deadline = Instant::now() + options.timeout;

        let mut last = None;
        let mut stable = 0;
        loop {
            let content = self.cgroups.fs().read_text(&path).map_err(|e| match e {
                FsError::NotFound(path) => {
                    ProbeError::UnsupportedController(path.display().to_string())
                }
                other => other.into(),
            })?;
            let value = parse_single_value(&content).ok_or_else(|| {
                ProbeError::MalformedKernelOutput {
                    path: path.display().to_string(),
                    detail: format!("expected a count, got '{}'", content.trim()),
                }
            })?;

            if last == Some(value) {
                stable += 1;
            } else {
                last = Some(value);
                stable = 1;
            }
            if stable >= options.stable_reads {
                log::debug!("pids.current of '{}' settled at {}", name, value);
                return Ok(value);
            }

            if Instant::now() >= deadline {
                return Err(ProbeError::Timeout(format!(
                    "pids.current of '{}' did not settle within {:?} (last value {})",
                    name, options.timeout, value
                )));
            }
            std::thread::sleep(options.interval);
        }
    }
}
