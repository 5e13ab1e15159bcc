/// Core types, configuration and errors shared across isoscope
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Runtime configuration for namespace and cgroup operations
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Prefix prepended to every kernel path (use a temp tree for testing)
    pub fs_root: PathBuf,
    /// Location of the process table
    pub proc_root: PathBuf,
    /// Mount point of the cgroup hierarchy (unified for v2, parent of controllers for v1)
    pub cgroup_root: PathBuf,
    /// CPU period used when a limit is given in cores without an explicit period
    pub default_cpu_period_us: u64,
    /// Enable available controllers in the parent's subtree_control on create (v2)
    pub enable_subtree_controllers: bool,
    /// Interval between pids.current polls
    pub pids_poll_interval_ms: u64,
    /// Upper bound for waiting on pids.current to settle
    pub pids_poll_timeout_ms: u64,
    /// Identical consecutive reads required before pids.current counts as settled
    pub pids_stable_reads: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            fs_root: PathBuf::from("/"),
            proc_root: PathBuf::from("/proc"),
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            default_cpu_period_us: 100_000,
            enable_subtree_controllers: true,
            pids_poll_interval_ms: 100,
            pids_poll_timeout_ms: 5_000,
            pids_stable_reads: 3,
        }
    }
}

impl ProbeConfig {
    /// Load configuration from a JSON file; missing fields keep their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProbeError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: ProbeConfig = serde_json::from_str(&content).map_err(|e| {
            ProbeError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_cpu_period_us == 0 {
            return Err(ProbeError::Config(
                "default_cpu_period_us must be greater than 0".to_string(),
            ));
        }
        if self.pids_stable_reads == 0 {
            return Err(ProbeError::Config(
                "pids_stable_reads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_options(&self) -> PollOptions {
        PollOptions {
            interval: Duration::from_millis(self.pids_poll_interval_ms),
            timeout: Duration::from_millis(self.pids_poll_timeout_ms),
            stable_reads: self.pids_stable_reads,
        }
    }
}

/// Bounds for polling a cgroup counter until it stops changing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollOptions {
    pub interval: Duration,
    pub timeout: Duration,
    pub stable_reads: u32,
}

impl Default for PollOptions {
    fn default() -> Self {
        ProbeConfig::default().poll_options()
    }
}

/// Error taxonomy for isoscope operations
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("controller file unavailable: {0}")]
    UnsupportedController(String),

    #[error("malformed kernel output in {path}: {detail}")]
    MalformedKernelOutput { path: String, detail: String },

    #[error("cgroup busy: {0}")]
    Busy(String),

    #[error("invalid cgroup name '{0}'")]
    InvalidName(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProbeError {
    /// Short stable label used when reporting errors on the command line
    pub fn kind(&self) -> &'static str {
        match self {
            ProbeError::NotFound(_) => "not-found",
            ProbeError::PermissionDenied(_) => "permission-denied",
            ProbeError::UnsupportedController(_) => "unsupported-controller",
            ProbeError::MalformedKernelOutput { .. } => "malformed-kernel-output",
            ProbeError::Busy(_) => "busy",
            ProbeError::InvalidName(_) => "invalid-name",
            ProbeError::Timeout(_) => "timeout",
            ProbeError::Config(_) => "config",
            ProbeError::Io(_) => "io",
        }
    }
}

/// Result type alias for isoscope operations
pub type Result<T> = std::result::Result<T, ProbeError>;
