/// Cgroup version detection, control file resolution and group lifecycle
/// Handles both the legacy per-controller hierarchies (v1) and the unified hierarchy (v2).
use crate::pseudofs::{FsError, PseudoFs};
use crate::types::{ProbeConfig, ProbeError, Result};
use serde::Serialize;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Present at the root of a unified (v2) hierarchy only
pub const V2_MARKER_FILE: &str = "cgroup.controllers";
/// Process membership file, same name in both versions
pub const MEMBERSHIP_FILE: &str = "cgroup.procs";
const SUBTREE_CONTROL_FILE: &str = "cgroup.subtree_control";
/// v1 hierarchy used for the handle path and for files with no controller
const PRIMARY_V1_HIERARCHY: &str = "memory";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CgroupVersion {
    V1,
    V2,
}

impl fmt::Display for CgroupVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CgroupVersion::V1 => f.write_str("v1"),
            CgroupVersion::V2 => f.write_str("v2"),
        }
    }
}

/// Detect the hierarchy layout mounted at `root`
pub fn detect_version(fs: &dyn PseudoFs, root: &Path) -> CgroupVersion {
    if fs.exists(&root.join(V2_MARKER_FILE)) {
        CgroupVersion::V2
    } else {
        CgroupVersion::V1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Controller {
    Cpu,
    CpuAcct,
    Memory,
    Pids,
    Io,
}

impl Controller {
    pub const ALL: [Controller; 5] = [
        Controller::Cpu,
        Controller::CpuAcct,
        Controller::Memory,
        Controller::Pids,
        Controller::Io,
    ];

    /// Directory of this controller's hierarchy under the v1 cgroup root
    pub fn v1_hierarchy(self) -> &'static str {
        match self {
            Controller::Cpu => "cpu",
            Controller::CpuAcct => "cpuacct",
            Controller::Memory => "memory",
            Controller::Pids => "pids",
            Controller::Io => "blkio",
        }
    }

    /// Name in cgroup.controllers; cpuacct accounting is part of `cpu` in v2
    pub fn v2_name(self) -> Option<&'static str> {
        match self {
            Controller::Cpu => Some("cpu"),
            Controller::CpuAcct => None,
            Controller::Memory => Some("memory"),
            Controller::Pids => Some("pids"),
            Controller::Io => Some("io"),
        }
    }
}

/// Resources reporting pressure stall information
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureResource {
    Cpu,
    Memory,
    Io,
}

impl PressureResource {
    pub const ALL: [PressureResource; 3] = [
        PressureResource::Cpu,
        PressureResource::Memory,
        PressureResource::Io,
    ];

    pub fn label(self) -> &'static str {
        match self {
            PressureResource::Cpu => "cpu",
            PressureResource::Memory => "memory",
            PressureResource::Io => "io",
        }
    }
}

/// Logical control file; the concrete file name depends on the version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupFile {
    Membership,
    CpuLimit,
    CpuPeriod,
    CpuUsage,
    MemoryLimit,
    SwapLimit,
    MemoryCurrent,
    MemoryPeak,
    MemoryFailures,
    PidsLimit,
    PidsCurrent,
    IoWriteLimit,
    IoReadLimit,
    IoStat,
    Pressure(PressureResource),
}

impl CgroupFile {
    pub fn controller(self) -> Option<Controller> {
        match self {
            CgroupFile::Membership | CgroupFile::Pressure(_) => None,
            CgroupFile::CpuLimit | CgroupFile::CpuPeriod => Some(Controller::Cpu),
            CgroupFile::CpuUsage => Some(Controller::CpuAcct),
            CgroupFile::MemoryLimit
            | CgroupFile::SwapLimit
            | CgroupFile::MemoryCurrent
            | CgroupFile::MemoryPeak
            | CgroupFile::MemoryFailures => Some(Controller::Memory),
            CgroupFile::PidsLimit | CgroupFile::PidsCurrent => Some(Controller::Pids),
            CgroupFile::IoWriteLimit | CgroupFile::IoReadLimit | CgroupFile::IoStat => {
                Some(Controller::Io)
            }
        }
    }

    /// File name under the given version, `None` if the version has no such file
    pub fn file_name(self, version: CgroupVersion) -> Option<&'static str> {
        let name = match (self, version) {
            (CgroupFile::Membership, _) => MEMBERSHIP_FILE,
            (CgroupFile::CpuLimit, CgroupVersion::V2) => "cpu.max",
            (CgroupFile::CpuLimit, CgroupVersion::V1) => "cpu.cfs_quota_us",
            (CgroupFile::CpuPeriod, CgroupVersion::V2) => "cpu.max",
            (CgroupFile::CpuPeriod, CgroupVersion::V1) => "cpu.cfs_period_us",
            (CgroupFile::CpuUsage, CgroupVersion::V2) => "cpu.stat",
            (CgroupFile::CpuUsage, CgroupVersion::V1) => "cpuacct.usage",
            (CgroupFile::MemoryLimit, CgroupVersion::V2) => "memory.max",
            (CgroupFile::MemoryLimit, CgroupVersion::V1) => "memory.limit_in_bytes",
            (CgroupFile::SwapLimit, CgroupVersion::V2) => "memory.swap.max",
            (CgroupFile::SwapLimit, CgroupVersion::V1) => "memory.memsw.limit_in_bytes",
            (CgroupFile::MemoryCurrent, CgroupVersion::V2) => "memory.current",
            (CgroupFile::MemoryCurrent, CgroupVersion::V1) => "memory.usage_in_bytes",
            (CgroupFile::MemoryPeak, CgroupVersion::V2) => "memory.peak",
            (CgroupFile::MemoryPeak, CgroupVersion::V1) => "memory.max_usage_in_bytes",
            (CgroupFile::MemoryFailures, CgroupVersion::V2) => "memory.events",
            (CgroupFile::MemoryFailures, CgroupVersion::V1) => "memory.failcnt",
            (CgroupFile::PidsLimit, _) => "pids.max",
            (CgroupFile::PidsCurrent, _) => "pids.current",
            (CgroupFile::IoWriteLimit, CgroupVersion::V2) => "io.max",
            (CgroupFile::IoWriteLimit, CgroupVersion::V1) => "blkio.throttle.write_bps_device",
            (CgroupFile::IoReadLimit, CgroupVersion::V2) => "io.max",
            (CgroupFile::IoReadLimit, CgroupVersion::V1) => "blkio.throttle.read_bps_device",
            (CgroupFile::IoStat, CgroupVersion::V2) => "io.stat",
            (CgroupFile::IoStat, CgroupVersion::V1) => "blkio.throttle.io_service_bytes",
            (CgroupFile::Pressure(resource), CgroupVersion::V2) => match resource {
                PressureResource::Cpu => "cpu.pressure",
                PressureResource::Memory => "memory.pressure",
                PressureResource::Io => "io.pressure",
            },
            (CgroupFile::Pressure(_), CgroupVersion::V1) => return None,
        };
        Some(name)
    }
}

/// Lightweight reference to a control group; does not own the kernel directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CgroupHandle {
    name: String,
    path: PathBuf,
    version: CgroupVersion,
}

impl CgroupHandle {
    /// Relative group name, empty for the root group
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Group directory (the memory hierarchy's directory under v1)
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn version(&self) -> CgroupVersion {
        self.version
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExisted,
}

fn validate_name(name: &str) -> Result<()> {
    let path = Path::new(name);
    let valid = !name.is_empty()
        && !path.is_absolute()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if valid {
        Ok(())
    } else {
        Err(ProbeError::InvalidName(name.to_string()))
    }
}

/// Cgroup lifecycle management for one hierarchy root
pub struct CgroupManager {
    fs: Arc<dyn PseudoFs>,
    root: PathBuf,
    version: CgroupVersion,
    enable_subtree_controllers: bool,
}

impl CgroupManager {
    /// Create a manager, detecting the version once from the marker file
    pub fn new<P: Into<PathBuf>>(fs: Arc<dyn PseudoFs>, root: P) -> Self {
        let root = root.into();
        let version = detect_version(fs.as_ref(), &root);
        log::debug!("Detected cgroup {} at {}", version, root.display());
        Self::with_version(fs, root, version)
    }

    pub fn with_version<P: Into<PathBuf>>(
        fs: Arc<dyn PseudoFs>,
        root: P,
        version: CgroupVersion,
    ) -> Self {
        Self {
            fs,
            root: root.into(),
            version,
            enable_subtree_controllers: true,
        }
    }

    pub fn from_config(fs: Arc<dyn PseudoFs>, config: &ProbeConfig) -> Self {
        let mut manager = Self::new(fs, config.cgroup_root.clone());
        manager.enable_subtree_controllers = config.enable_subtree_controllers;
        manager
    }

    pub fn version(&self) -> CgroupVersion {
        self.version
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn fs(&self) -> &dyn PseudoFs {
        self.fs.as_ref()
    }

    fn group_dir(&self, name: &str, controller: Option<Controller>) -> PathBuf {
        let base = match self.version {
            CgroupVersion::V2 => self.root.clone(),
            CgroupVersion::V1 => self.root.join(
                controller
                    .map(Controller::v1_hierarchy)
                    .unwrap_or(PRIMARY_V1_HIERARCHY),
            ),
        };
        if name.is_empty() {
            base
        } else {
            base.join(name)
        }
    }

    pub fn handle(&self, name: &str) -> Result<CgroupHandle> {
        validate_name(name)?;
        Ok(CgroupHandle {
            name: name.to_string(),
            path: self.group_dir(name, None),
            version: self.version,
        })
    }

    /// The root group itself, used for system-wide metrics
    pub fn root_handle(&self) -> CgroupHandle {
        CgroupHandle {
            name: String::new(),
            path: self.group_dir("", None),
            version: self.version,
        }
    }

    /// Concrete path of a logical control file for a group
    pub fn resolve_file(&self, handle: &CgroupHandle, file: CgroupFile) -> Option<PathBuf> {
        let name = file.file_name(handle.version)?;
        let dir = match handle.version {
            CgroupVersion::V2 => handle.path.clone(),
            CgroupVersion::V1 => self.group_dir(&handle.name, file.controller()),
        };
        Some(dir.join(name))
    }

    /// Controllers usable under this root
    pub fn available_controllers(&self) -> Vec<Controller> {
        match self.version {
            CgroupVersion::V2 => {
                let listed = self
                    .fs
                    .read_text(&self.root.join(V2_MARKER_FILE))
                    .unwrap_or_default();
                let listed: Vec<&str> = listed.split_whitespace().collect();
                Controller::ALL
                    .iter()
                    .copied()
                    .filter(|controller| {
                        controller
                            .v2_name()
                            .map_or(listed.contains(&"cpu"), |name| listed.contains(&name))
                    })
                    .collect()
            }
            CgroupVersion::V1 => Controller::ALL
                .iter()
                .copied()
                .filter(|controller| self.fs.exists(&self.root.join(controller.v1_hierarchy())))
                .collect(),
        }
    }

    /// Every directory backing the group: one under v2, one per mounted hierarchy under v1
    fn group_dirs(&self, name: &str) -> Vec<PathBuf> {
        match self.version {
            CgroupVersion::V2 => vec![self.group_dir(name, None)],
            CgroupVersion::V1 => self
                .available_controllers()
                .into_iter()
                .map(|controller| self.group_dir(name, Some(controller)))
                .collect(),
        }
    }

    pub fn exists(&self, name: &str) -> bool {
        if validate_name(name).is_err() {
            return false;
        }
        self.group_dirs(name).iter().any(|dir| self.fs.exists(dir))
    }

    /// Create a group; succeeds with `AlreadyExisted` when it is already there
    pub fn create(&self, name: &str) -> Result<CreateOutcome> {
        validate_name(name)?;
        let dirs = self.group_dirs(name);
        if dirs.is_empty() {
            return Err(ProbeError::UnsupportedController(format!(
                "no cgroup hierarchy mounted under {}",
                self.root.display()
            )));
        }

        if self.version == CgroupVersion::V2 && self.enable_subtree_controllers {
            if let Some(parent) = dirs[0].parent() {
                self.enable_controllers_in(parent);
            }
        }

        let mut created: Vec<&PathBuf> = Vec::new();
        for dir in &dirs {
            match self.fs.create_dir(dir) {
                Ok(()) => {
                    log::info!("Created cgroup {}", dir.display());
                    created.push(dir);
                }
                Err(FsError::AlreadyExists(_)) => {
                    log::debug!("Cgroup {} already exists", dir.display());
                }
                Err(e) => {
                    // Leave no partial group behind in the other hierarchies
                    for dir in created.iter().rev() {
                        if let Err(cleanup) = self.fs.remove_dir(dir) {
                            log::warn!("Failed to roll back cgroup {}: {}", dir.display(), cleanup);
                        }
                    }
                    return Err(e.into());
                }
            }
        }

        Ok(if !created.is_empty() {
            CreateOutcome::Created
        } else {
            CreateOutcome::AlreadyExisted
        })
    }

    /// Best-effort `+controller` writes so a new child group gets control files
    fn enable_controllers_in(&self, parent: &Path) {
        let available = match self.fs.read_text(&parent.join(V2_MARKER_FILE)) {
            Ok(content) => content,
            Err(e) => {
                log::warn!("Cannot read available controllers: {}", e);
                return;
            }
        };
        let request: Vec<String> = available
            .split_whitespace()
            .filter(|name| ["cpu", "memory", "pids", "io"].contains(name))
            .map(|name| format!("+{}", name))
            .collect();
        if request.is_empty() {
            return;
        }

        let subtree = parent.join(SUBTREE_CONTROL_FILE);
        if let Err(e) = self.fs.write_text(&subtree, &request.join(" ")) {
            log::warn!("Failed to enable controllers in {}: {}", subtree.display(), e);
        }
    }

    /// Drain and remove a group
    ///
    /// Members are moved back to the parent group first, because the kernel
    /// refuses to remove a group that still has processes attached.
    pub fn delete(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let dirs: Vec<PathBuf> = self
            .group_dirs(name)
            .into_iter()
            .filter(|dir| self.fs.exists(dir))
            .collect();
        if dirs.is_empty() {
            return Err(ProbeError::NotFound(format!("cgroup '{}'", name)));
        }

        for dir in &dirs {
            self.drain(dir)?;
            match self.fs.remove_dir(dir) {
                Ok(()) => log::info!("Removed cgroup {}", dir.display()),
                Err(FsError::NotFound(_)) => {}
                Err(FsError::Busy(_)) => {
                    return Err(ProbeError::Busy(format!(
                        "{} still has members or child groups",
                        dir.display()
                    )))
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn drain(&self, dir: &Path) -> Result<()> {
        let procs = dir.join(MEMBERSHIP_FILE);
        let members = self.read_members(&procs)?;
        if members.is_empty() {
            return Ok(());
        }

        let parent_procs = dir
            .parent()
            .map(|parent| parent.join(MEMBERSHIP_FILE))
            .ok_or_else(|| ProbeError::Busy(format!("{} has no parent group", dir.display())))?;

        log::debug!("Draining {} processes from {}", members.len(), dir.display());
        for pid in members {
            match self.fs.write_text(&parent_procs, &pid.to_string()) {
                Ok(()) => {}
                Err(FsError::NoSuchProcess(_)) => {
                    log::debug!("Process {} exited while draining", pid);
                }
                Err(e) => {
                    return Err(ProbeError::Busy(format!(
                        "cannot move process {} out of {}: {}",
                        pid,
                        dir.display(),
                        e
                    )))
                }
            }
        }

        let remaining = self.read_members(&procs)?;
        if !remaining.is_empty() {
            return Err(ProbeError::Busy(format!(
                "{} still has {} members after draining",
                dir.display(),
                remaining.len()
            )));
        }
        Ok(())
    }

    fn read_members(&self, procs: &Path) -> Result<Vec<u32>> {
        let content = match self.fs.read_text(procs) {
            Ok(content) => content,
            Err(FsError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut pids = Vec::new();
        for line in content.lines().map(str::trim).filter(|line| !line.is_empty()) {
            match line.parse() {
                Ok(pid) => pids.push(pid),
                Err(_) => log::warn!("Ignoring malformed pid '{}' in {}", line, procs.display()),
            }
        }
        Ok(pids)
    }

    /// Attach a process to a group (in every hierarchy under v1)
    pub fn move_process(&self, name: &str, pid: u32) -> Result<()> {
        validate_name(name)?;
        if !self.exists(name) {
            return Err(ProbeError::NotFound(format!("cgroup '{}'", name)));
        }

        for dir in self.group_dirs(name).iter().filter(|dir| self.fs.exists(dir)) {
            let procs = dir.join(MEMBERSHIP_FILE);
            match self.fs.write_text(&procs, &pid.to_string()) {
                Ok(()) => {}
                Err(FsError::NoSuchProcess(_)) => {
                    return Err(ProbeError::NotFound(format!("process {}", pid)))
                }
                Err(e) => return Err(e.into()),
            }
        }
        log::info!("Moved process {} into cgroup '{}'", pid, name);
        Ok(())
    }

    /// Pids currently attached to a group
    pub fn list_processes(&self, name: &str) -> Result<Vec<u32>> {
        let handle = self.handle(name)?;
        if !self.fs.exists(handle.path()) {
            return Err(ProbeError::NotFound(format!("cgroup '{}'", name)));
        }
        self.read_members(&handle.path().join(MEMBERSHIP_FILE))
    }

    /// Fail with `NotFound` unless the group exists
    pub(crate) fn require(&self, name: &str) -> Result<CgroupHandle> {
        let handle = self.handle(name)?;
        if !self.exists(name) {
            return Err(ProbeError::NotFound(format!("cgroup '{}'", name)));
        }
        Ok(handle)
    }
}
