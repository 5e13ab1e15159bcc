/// Uniform access to kernel pseudo-filesystems (/proc, /sys/fs/cgroup)
///
/// Every kernel read or write in isoscope goes through [`PseudoFs`], so the
/// namespace and cgroup logic can run against [`HostFs`] on a live system or
/// against [`MemoryFs`] in unit tests without privileges.
use crate::types::ProbeError;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Failure of a single pseudo-filesystem operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("{} does not exist", .0.display())]
    NotFound(PathBuf),

    #[error("permission denied for {}", .0.display())]
    PermissionDenied(PathBuf),

    #[error("{} already exists", .0.display())]
    AlreadyExists(PathBuf),

    #[error("{} is busy", .0.display())]
    Busy(PathBuf),

    #[error("no such process while writing {}", .0.display())]
    NoSuchProcess(PathBuf),

    #[error("{}: {}", .path.display(), .message)]
    Other { path: PathBuf, message: String },
}

impl FsError {
    /// Classify an I/O error raised while accessing `path`
    pub fn from_io(path: &Path, err: io::Error) -> Self {
        let path = path.to_path_buf();
        match err.raw_os_error() {
            Some(libc::EBUSY) | Some(libc::ENOTEMPTY) => return FsError::Busy(path),
            Some(libc::ESRCH) => return FsError::NoSuchProcess(path),
            _ => {}
        }
        match err.kind() {
            io::ErrorKind::NotFound => FsError::NotFound(path),
            io::ErrorKind::PermissionDenied => FsError::PermissionDenied(path),
            io::ErrorKind::AlreadyExists => FsError::AlreadyExists(path),
            _ => FsError::Other {
                path,
                message: err.to_string(),
            },
        }
    }
}

impl From<FsError> for ProbeError {
    fn from(err: FsError) -> Self {
        match err {
            FsError::NotFound(path) => ProbeError::NotFound(path.display().to_string()),
            FsError::PermissionDenied(path) => {
                ProbeError::PermissionDenied(path.display().to_string())
            }
            FsError::Busy(path) => ProbeError::Busy(path.display().to_string()),
            FsError::NoSuchProcess(path) => ProbeError::NotFound(format!(
                "process written to {} no longer exists",
                path.display()
            )),
            FsError::AlreadyExists(path) => ProbeError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", path.display()),
            )),
            FsError::Other { path, message } => ProbeError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("{}: {}", path.display(), message),
            )),
        }
    }
}

pub type FsResult<T> = std::result::Result<T, FsError>;

/// Read/write primitives over kernel text files
pub trait PseudoFs: Send + Sync {
    /// True if the path exists; symlinks count even when their target does not resolve
    fn exists(&self, path: &Path) -> bool;

    fn read_text(&self, path: &Path) -> FsResult<String>;

    /// Overwrite an existing file; never creates one
    fn write_text(&self, path: &Path, content: &str) -> FsResult<()>;

    /// Target string of a symbolic link
    fn read_link(&self, path: &Path) -> FsResult<String>;

    /// Entry names of a directory, unsorted
    fn list_dir(&self, path: &Path) -> FsResult<Vec<String>>;

    fn create_dir(&self, path: &Path) -> FsResult<()>;

    fn remove_dir(&self, path: &Path) -> FsResult<()>;
}

/// Host filesystem, optionally re-rooted under a prefix directory
#[derive(Debug, Clone)]
pub struct HostFs {
    root: PathBuf,
}

impl HostFs {
    pub fn new() -> Self {
        Self::with_root("/")
    }

    /// Resolve every absolute kernel path beneath `root` instead of `/`
    pub fn with_root<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    fn host_path(&self, path: &Path) -> PathBuf {
        let relative = path.strip_prefix("/").unwrap_or(path);
        self.root.join(relative)
    }
}

impl Default for HostFs {
    fn default() -> Self {
        Self::new()
    }
}

impl PseudoFs for HostFs {
    fn exists(&self, path: &Path) -> bool {
        fs::symlink_metadata(self.host_path(path)).is_ok()
    }

    fn read_text(&self, path: &Path) -> FsResult<String> {
        fs::read_to_string(self.host_path(path)).map_err(|e| FsError::from_io(path, e))
    }

    fn write_text(&self, path: &Path, content: &str) -> FsResult<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(self.host_path(path))
            .map_err(|e| FsError::from_io(path, e))?;
        file.write_all(content.as_bytes())
            .map_err(|e| FsError::from_io(path, e))
    }

    fn read_link(&self, path: &Path) -> FsResult<String> {
        fs::read_link(self.host_path(path))
            .map(|target| target.to_string_lossy().into_owned())
            .map_err(|e| FsError::from_io(path, e))
    }

    fn list_dir(&self, path: &Path) -> FsResult<Vec<String>> {
        let entries = fs::read_dir(self.host_path(path)).map_err(|e| FsError::from_io(path, e))?;
        // Entries can vanish while iterating /proc; skip those instead of failing the listing.
        Ok(entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect())
    }

    fn create_dir(&self, path: &Path) -> FsResult<()> {
        fs::create_dir(self.host_path(path)).map_err(|e| FsError::from_io(path, e))
    }

    fn remove_dir(&self, path: &Path) -> FsResult<()> {
        fs::remove_dir(self.host_path(path)).map_err(|e| FsError::from_io(path, e))
    }
}

/// Failure injected into a [`MemoryFs`] path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    NotFound,
    PermissionDenied,
    Busy,
    NoSuchProcess,
}

impl Fault {
    fn to_error(self, path: &Path) -> FsError {
        let path = path.to_path_buf();
        match self {
            Fault::NotFound => FsError::NotFound(path),
            Fault::PermissionDenied => FsError::PermissionDenied(path),
            Fault::Busy => FsError::Busy(path),
            Fault::NoSuchProcess => FsError::NoSuchProcess(path),
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    File(String),
    Dir,
    Link(String),
}

#[derive(Debug, Default)]
struct MemoryState {
    nodes: BTreeMap<PathBuf, Node>,
    faults: HashMap<PathBuf, Fault>,
    dir_template: Vec<(String, String)>,
    writes: Vec<(PathBuf, String)>,
}

const MEMBERSHIP_FILE: &str = "cgroup.procs";

impl MemoryState {
    fn fault(&self, path: &Path) -> FsResult<()> {
        match self.faults.get(path) {
            Some(fault) => Err(fault.to_error(path)),
            None => Ok(()),
        }
    }

    fn ensure_ancestors(&mut self, path: &Path) {
        for ancestor in path.ancestors().skip(1) {
            self.nodes
                .entry(ancestor.to_path_buf())
                .or_insert(Node::Dir);
        }
    }

    fn children(&self, dir: &Path) -> Vec<PathBuf> {
        self.nodes
            .range(dir.to_path_buf()..)
            .skip(1)
            .map(|(path, _)| path)
            .take_while(|path| path.starts_with(dir))
            .filter(|path| path.parent() == Some(dir))
            .cloned()
            .collect()
    }

    /// Topmost cgroup above a membership file; a pid is a member of exactly one group
    /// per hierarchy.
    fn hierarchy_of(&self, procs: &Path) -> PathBuf {
        let mut top = procs.parent().unwrap_or(procs).to_path_buf();
        loop {
            let parent = match top.parent() {
                Some(parent) => parent.to_path_buf(),
                None => break,
            };
            if !self.nodes.contains_key(&parent.join(MEMBERSHIP_FILE)) {
                break;
            }
            top = parent;
        }
        top
    }

    fn migrate(&mut self, target: &Path, content: &str) {
        let pid = content.trim().to_string();
        let hierarchy = self.hierarchy_of(target);
        let members: Vec<PathBuf> = self
            .nodes
            .keys()
            .filter(|path| {
                path.starts_with(&hierarchy)
                    && path.file_name().map_or(false, |name| name == MEMBERSHIP_FILE)
            })
            .cloned()
            .collect();

        for path in members {
            if let Some(Node::File(existing)) = self.nodes.get_mut(&path) {
                let kept: Vec<&str> = existing
                    .lines()
                    .filter(|line| line.trim() != pid)
                    .collect();
                let mut rebuilt = kept.join("\n");
                if !rebuilt.is_empty() {
                    rebuilt.push('\n');
                }
                if path == target {
                    rebuilt.push_str(&pid);
                    rebuilt.push('\n');
                }
                *existing = rebuilt;
            }
        }
    }
}

/// In-memory pseudo-filesystem for tests
///
/// Mimics the cgroupfs behaviours the lifecycle code depends on: directories
/// created through [`PseudoFs::create_dir`] are populated from a template,
/// writing a pid to a `cgroup.procs` file moves it out of every other group of
/// the same hierarchy, and a group with members or children cannot be removed.
#[derive(Debug, Default)]
pub struct MemoryFs {
    state: Mutex<MemoryState>,
}

impl MemoryFs {
    pub fn new() -> Self {
        let fs = Self::default();
        fs.state().nodes.insert(PathBuf::from("/"), Node::Dir);
        fs
    }

    /// Files (name, initial content) placed in every directory created via `create_dir`
    pub fn with_dir_template(self, files: &[(&str, &str)]) -> Self {
        self.state().dir_template = files
            .iter()
            .map(|(name, content)| (name.to_string(), content.to_string()))
            .collect();
        self
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_file<P: AsRef<Path>>(&self, path: P, content: &str) {
        let path = path.as_ref();
        let mut state = self.state();
        state.ensure_ancestors(path);
        state
            .nodes
            .insert(path.to_path_buf(), Node::File(content.to_string()));
    }

    pub fn add_dir<P: AsRef<Path>>(&self, path: P) {
        let path = path.as_ref();
        let mut state = self.state();
        state.ensure_ancestors(path);
        state.nodes.insert(path.to_path_buf(), Node::Dir);
    }

    pub fn add_link<P: AsRef<Path>>(&self, path: P, target: &str) {
        let path = path.as_ref();
        let mut state = self.state();
        state.ensure_ancestors(path);
        state
            .nodes
            .insert(path.to_path_buf(), Node::Link(target.to_string()));
    }

    /// Drop a path and everything beneath it, e.g. to simulate a process exiting
    pub fn remove<P: AsRef<Path>>(&self, path: P) {
        let path = path.as_ref();
        self.state().nodes.retain(|key, _| !key.starts_with(path));
    }

    pub fn inject_fault<P: AsRef<Path>>(&self, path: P, fault: Fault) {
        self.state()
            .faults
            .insert(path.as_ref().to_path_buf(), fault);
    }

    pub fn clear_fault<P: AsRef<Path>>(&self, path: P) {
        self.state().faults.remove(path.as_ref());
    }

    /// Current content of a file, if it is one
    pub fn content<P: AsRef<Path>>(&self, path: P) -> Option<String> {
        match self.state().nodes.get(path.as_ref()) {
            Some(Node::File(content)) => Some(content.clone()),
            _ => None,
        }
    }

    /// Every successful write, in order
    pub fn writes(&self) -> Vec<(PathBuf, String)> {
        self.state().writes.clone()
    }
}

impl PseudoFs for MemoryFs {
    fn exists(&self, path: &Path) -> bool {
        let state = self.state();
        if let Some(Fault::NotFound) = state.faults.get(path) {
            return false;
        }
        state.nodes.contains_key(path)
    }

    fn read_text(&self, path: &Path) -> FsResult<String> {
        let state = self.state();
        state.fault(path)?;
        match state.nodes.get(path) {
            Some(Node::File(content)) => Ok(content.clone()),
            Some(_) => Err(FsError::Other {
                path: path.to_path_buf(),
                message: "not a regular file".to_string(),
            }),
            None => Err(FsError::NotFound(path.to_path_buf())),
        }
    }

    fn write_text(&self, path: &Path, content: &str) -> FsResult<()> {
        let mut state = self.state();
        state.fault(path)?;
        match state.nodes.get(path) {
            Some(Node::File(_)) => {}
            Some(_) => {
                return Err(FsError::Other {
                    path: path.to_path_buf(),
                    message: "not a regular file".to_string(),
                })
            }
            None => return Err(FsError::NotFound(path.to_path_buf())),
        }
        if path.file_name().map_or(false, |name| name == MEMBERSHIP_FILE) {
            state.migrate(path, content);
        } else {
            state
                .nodes
                .insert(path.to_path_buf(), Node::File(content.to_string()));
        }
        state.writes.push((path.to_path_buf(), content.to_string()));
        Ok(())
    }

    fn read_link(&self, path: &Path) -> FsResult<String> {
        let state = self.state();
        state.fault(path)?;
        match state.nodes.get(path) {
            Some(Node::Link(target)) => Ok(target.clone()),
            Some(_) => Err(FsError::Other {
                path: path.to_path_buf(),
                message: "not a symbolic link".to_string(),
            }),
            None => Err(FsError::NotFound(path.to_path_buf())),
        }
    }

    fn list_dir(&self, path: &Path) -> FsResult<Vec<String>> {
        let state = self.state();
        state.fault(path)?;
        match state.nodes.get(path) {
            Some(Node::Dir) => Ok(state
                .children(path)
                .iter()
                .filter_map(|child| child.file_name())
                .map(|name| name.to_string_lossy().into_owned())
                .collect()),
            Some(_) => Err(FsError::Other {
                path: path.to_path_buf(),
                message: "not a directory".to_string(),
            }),
            None => Err(FsError::NotFound(path.to_path_buf())),
        }
    }

    fn create_dir(&self, path: &Path) -> FsResult<()> {
        let mut state = self.state();
        state.fault(path)?;
        if state.nodes.contains_key(path) {
            return Err(FsError::AlreadyExists(path.to_path_buf()));
        }
        match path.parent().and_then(|parent| state.nodes.get(parent)) {
            Some(Node::Dir) => {}
            _ => return Err(FsError::NotFound(path.to_path_buf())),
        }
        state.nodes.insert(path.to_path_buf(), Node::Dir);
        let template = state.dir_template.clone();
        for (name, content) in template {
            state.nodes.insert(path.join(name), Node::File(content));
        }
        Ok(())
    }

    fn remove_dir(&self, path: &Path) -> FsResult<()> {
        let mut state = self.state();
        state.fault(path)?;
        match state.nodes.get(path) {
            Some(Node::Dir) => {}
            _ => return Err(FsError::NotFound(path.to_path_buf())),
        }
        for child in state.children(path) {
            match state.nodes.get(&child) {
                Some(Node::Dir) => return Err(FsError::Busy(path.to_path_buf())),
                Some(Node::File(content))
                    if child.file_name().map_or(false, |name| name == MEMBERSHIP_FILE)
                        && !content.trim().is_empty() =>
                {
                    return Err(FsError::Busy(path.to_path_buf()))
                }
                _ => {}
            }
        }
        state.nodes.retain(|key, _| !key.starts_with(path));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_fs_missing_file_is_not_found() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let fs = HostFs::with_root(dir.path());

        let err = fs.read_text(Path::new("/proc/1/comm")).unwrap_err();
        assert_eq!(err, FsError::NotFound(PathBuf::from("/proc/1/comm")));
        assert!(!fs.exists(Path::new("/proc/1/comm")));
    }

    #[test]
    fn test_host_fs_write_never_creates() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let fs = HostFs::with_root(dir.path());

        let err = fs.write_text(Path::new("/memory.max"), "max").unwrap_err();
        assert!(matches!(err, FsError::NotFound(_)));
        assert!(!dir.path().join("memory.max").exists());

        std::fs::write(dir.path().join("memory.max"), "max\n").expect("Failed to seed file");
        fs.write_text(Path::new("/memory.max"), "1048576")
            .expect("Write to existing file should succeed");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("memory.max")).unwrap(),
            "1048576"
        );
    }

    #[test]
    fn test_host_fs_dangling_link_exists() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        std::fs::create_dir_all(dir.path().join("proc/42/ns")).unwrap();
        std::os::unix::fs::symlink("net:[4026531840]", dir.path().join("proc/42/ns/net")).unwrap();

        let fs = HostFs::with_root(dir.path());
        let link = Path::new("/proc/42/ns/net");
        assert!(fs.exists(link));
        assert_eq!(fs.read_link(link).unwrap(), "net:[4026531840]");
    }

    #[test]
    fn test_host_fs_remove_non_empty_dir_is_busy() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        std::fs::create_dir_all(dir.path().join("group")).unwrap();
        std::fs::write(dir.path().join("group/cgroup.procs"), "").unwrap();

        let fs = HostFs::with_root(dir.path());
        let err = fs.remove_dir(Path::new("/group")).unwrap_err();
        assert!(matches!(err, FsError::Busy(_)));
    }

    #[test]
    fn test_io_error_classification() {
        let path = Path::new("/sys/fs/cgroup/x/cgroup.procs");
        let esrch = io::Error::from_raw_os_error(libc::ESRCH);
        assert_eq!(
            FsError::from_io(path, esrch),
            FsError::NoSuchProcess(path.to_path_buf())
        );
        let eacces = io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(
            FsError::from_io(path, eacces),
            FsError::PermissionDenied(path.to_path_buf())
        );
    }

    #[test]
    fn test_memory_fs_membership_migrates_between_groups() {
        let fs = MemoryFs::new().with_dir_template(&[("cgroup.procs", "")]);
        fs.add_file("/cg/cgroup.procs", "10\n20\n");
        fs.create_dir(Path::new("/cg/a")).unwrap();

        fs.write_text(Path::new("/cg/a/cgroup.procs"), "20").unwrap();

        assert_eq!(fs.content("/cg/cgroup.procs").unwrap(), "10\n");
        assert_eq!(fs.content("/cg/a/cgroup.procs").unwrap(), "20\n");
    }

    #[test]
    fn test_memory_fs_populated_group_is_busy() {
        let fs = MemoryFs::new().with_dir_template(&[("cgroup.procs", "")]);
        fs.add_file("/cg/cgroup.procs", "7\n");
        fs.create_dir(Path::new("/cg/a")).unwrap();
        fs.write_text(Path::new("/cg/a/cgroup.procs"), "7").unwrap();

        assert!(matches!(
            fs.remove_dir(Path::new("/cg/a")),
            Err(FsError::Busy(_))
        ));

        fs.write_text(Path::new("/cg/cgroup.procs"), "7").unwrap();
        fs.remove_dir(Path::new("/cg/a")).unwrap();
        assert!(!fs.exists(Path::new("/cg/a/cgroup.procs")));
    }

    #[test]
    fn test_memory_fs_fault_injection() {
        let fs = MemoryFs::new();
        fs.add_file("/proc/1/comm", "init\n");
        fs.inject_fault("/proc/1/comm", Fault::PermissionDenied);

        assert!(matches!(
            fs.read_text(Path::new("/proc/1/comm")),
            Err(FsError::PermissionDenied(_))
        ));

        fs.clear_fault("/proc/1/comm");
        assert_eq!(fs.read_text(Path::new("/proc/1/comm")).unwrap(), "init\n");
    }

    #[test]
    fn test_memory_fs_list_dir_only_direct_children() {
        let fs = MemoryFs::new();
        fs.add_file("/proc/1/comm", "init\n");
        fs.add_file("/proc/22/comm", "sh\n");
        fs.add_file("/proc/self/comm", "sh\n");

        let mut names = fs.list_dir(Path::new("/proc")).unwrap();
        names.sort();
        assert_eq!(names, vec!["1", "22", "self"]);
    }
}
