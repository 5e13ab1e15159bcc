/// Namespace identity resolution and comparison
/// Reads the per-process descriptors under /proc/<pid>/ns/ and identifies each
/// namespace by the kernel inode behind it, never by the descriptor path.
use crate::pseudofs::{FsError, PseudoFs};
use crate::types::ProbeError;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Namespace kinds exposed under /proc/<pid>/ns, in fixed order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceType {
    Cgroup,
    Ipc,
    Mnt,
    Net,
    Pid,
    User,
    Uts,
}

impl NamespaceType {
    pub const ALL: [NamespaceType; 7] = [
        NamespaceType::Cgroup,
        NamespaceType::Ipc,
        NamespaceType::Mnt,
        NamespaceType::Net,
        NamespaceType::Pid,
        NamespaceType::User,
        NamespaceType::Uts,
    ];

    /// Kernel label, also the descriptor file name
    pub fn label(self) -> &'static str {
        match self {
            NamespaceType::Cgroup => "cgroup",
            NamespaceType::Ipc => "ipc",
            NamespaceType::Mnt => "mnt",
            NamespaceType::Net => "net",
            NamespaceType::Pid => "pid",
            NamespaceType::User => "user",
            NamespaceType::Uts => "uts",
        }
    }
}

impl fmt::Display for NamespaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for NamespaceType {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NamespaceType::ALL
            .iter()
            .copied()
            .find(|ns_type| ns_type.label() == s)
            .ok_or_else(|| {
                ProbeError::Config(format!(
                    "unknown namespace type '{}' \
                     (expected one of: cgroup, ipc, mnt, net, pid, user, uts)",
                    s
                ))
            })
    }
}

/// Parse a descriptor target of the form `<label>:[<decimal>]`
pub fn parse_descriptor(raw: &str) -> Option<(&str, u64)> {
    let (label, rest) = raw.trim().split_once(':')?;
    let digits = rest.strip_prefix('[')?.strip_suffix(']')?;
    if label.is_empty() || digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().map(|inode| (label, inode))
}

/// One namespace of one process
///
/// Equality and hashing use only `(ns_type, kernel_object_id)`; the descriptor
/// text and the `exists` flag do not participate.
#[derive(Debug, Clone, Serialize)]
pub struct NamespaceIdentity {
    #[serde(rename = "type")]
    pub ns_type: NamespaceType,
    #[serde(rename = "inode")]
    pub kernel_object_id: u64,
    #[serde(rename = "link")]
    pub raw_descriptor: String,
    pub exists: bool,
}

impl NamespaceIdentity {
    fn absent(ns_type: NamespaceType) -> Self {
        Self {
            ns_type,
            kernel_object_id: 0,
            raw_descriptor: String::new(),
            exists: false,
        }
    }

    pub fn key(&self) -> (NamespaceType, u64) {
        (self.ns_type, self.kernel_object_id)
    }
}

impl PartialEq for NamespaceIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for NamespaceIdentity {}

impl Hash for NamespaceIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

/// All seven namespace identities of a process at the time of the query
#[derive(Debug, Clone, Serialize)]
pub struct ProcessNamespaceSet {
    pid: u32,
    process_name: String,
    entries: Vec<NamespaceIdentity>,
    resolved_count: usize,
}

impl ProcessNamespaceSet {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Empty when the name could not be read
    pub fn process_name(&self) -> &str {
        &self.process_name
    }

    /// Always seven entries, in [`NamespaceType::ALL`] order
    pub fn entries(&self) -> &[NamespaceIdentity] {
        &self.entries
    }

    pub fn get(&self, ns_type: NamespaceType) -> &NamespaceIdentity {
        // entries is built from NamespaceType::ALL, so the discriminant is the index
        &self.entries[ns_type as usize]
    }

    pub fn resolved_count(&self) -> usize {
        self.resolved_count
    }
}

impl fmt::Display for ProcessNamespaceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Namespaces of PID {}", self.pid)?;
        if !self.process_name.is_empty() {
            write!(f, " ({})", self.process_name)?;
        }
        writeln!(f, ":")?;
        writeln!(f, "----------------------------------------")?;
        for entry in self.entries.iter().filter(|entry| entry.exists) {
            writeln!(
                f,
                "  {:<8}: {} (inode: {})",
                entry.ns_type.label(),
                entry.raw_descriptor,
                entry.kernel_object_id
            )?;
        }
        write!(f, "Total: {} namespaces", self.resolved_count)
    }
}

/// Pairwise namespace diff of two processes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamespaceComparison {
    pub pid_a: u32,
    pub pid_b: u32,
    /// Types resolved on both sides
    pub checked_count: usize,
    pub shared_count: usize,
    pub differing_count: usize,
    pub differing_types: BTreeSet<NamespaceType>,
}

impl NamespaceComparison {
    pub fn is_fully_shared(&self) -> bool {
        self.differing_count == 0
    }
}

impl fmt::Display for NamespaceComparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Comparison between PID {} and PID {}:", self.pid_a, self.pid_b)?;
        writeln!(f, "----------------------------------------")?;
        writeln!(f, "Namespaces checked: {}", self.checked_count)?;
        writeln!(f, "Shared namespaces: {}", self.shared_count)?;
        write!(f, "Differing namespaces: {}", self.differing_count)?;
        if !self.differing_types.is_empty() {
            write!(f, "\n\nNamespaces that differ:")?;
            for ns_type in &self.differing_types {
                write!(f, "\n  - {}", ns_type)?;
            }
        }
        Ok(())
    }
}

/// Resolves namespace identities from the process table
pub struct NamespaceResolver {
    fs: Arc<dyn PseudoFs>,
    proc_root: PathBuf,
}

impl NamespaceResolver {
    pub fn new<P: Into<PathBuf>>(fs: Arc<dyn PseudoFs>, proc_root: P) -> Self {
        Self {
            fs,
            proc_root: proc_root.into(),
        }
    }

    fn descriptor_path(&self, pid: u32, ns_type: NamespaceType) -> PathBuf {
        self.proc_root
            .join(pid.to_string())
            .join("ns")
            .join(ns_type.label())
    }

    /// Resolve a single namespace of a process; failures yield an absent entry
    pub fn resolve_entry(&self, pid: u32, ns_type: NamespaceType) -> NamespaceIdentity {
        let path = self.descriptor_path(pid, ns_type);
        let raw = match self.fs.read_link(&path) {
            Ok(raw) => raw,
            Err(FsError::NotFound(_)) | Err(FsError::NoSuchProcess(_)) => {
                log::debug!("{} not present", path.display());
                return NamespaceIdentity::absent(ns_type);
            }
            Err(e) => {
                log::debug!("Failed to read namespace descriptor: {}", e);
                return NamespaceIdentity::absent(ns_type);
            }
        };

        match parse_descriptor(&raw) {
            Some((_, inode)) => NamespaceIdentity {
                ns_type,
                kernel_object_id: inode,
                raw_descriptor: raw,
                exists: true,
            },
            None => {
                log::warn!(
                    "Malformed namespace descriptor at {}: '{}'",
                    path.display(),
                    raw
                );
                NamespaceIdentity::absent(ns_type)
            }
        }
    }

    /// Resolve all seven namespaces of a process
    ///
    /// Returns `None` only when none of them could be read, which usually
    /// means the process does not exist (or exited during the lookup).
    pub fn resolve(&self, pid: u32) -> Option<ProcessNamespaceSet> {
        let entries: Vec<NamespaceIdentity> = NamespaceType::ALL
            .iter()
            .map(|ns_type| self.resolve_entry(pid, *ns_type))
            .collect();
        let resolved_count = entries.iter().filter(|entry| entry.exists).count();
        if resolved_count == 0 {
            return None;
        }

        Some(ProcessNamespaceSet {
            pid,
            process_name: self.process_name(pid).unwrap_or_default(),
            entries,
            resolved_count,
        })
    }

    /// Best-effort command name from /proc/<pid>/comm
    pub fn process_name(&self, pid: u32) -> Option<String> {
        let path = self.proc_root.join(pid.to_string()).join("comm");
        let name = self.fs.read_text(&path).ok()?;
        let name = name.trim_end_matches('\n').to_string();
        if name.is_empty() {
            None
        } else {
            Some(name)
        }
    }

    /// Compare the namespaces of two processes
    ///
    /// Types unresolved on either side are skipped rather than counted as
    /// different, so permission gaps do not show up as isolation.
    pub fn compare(&self, pid_a: u32, pid_b: u32) -> Option<NamespaceComparison> {
        let set_a = self.resolve(pid_a)?;
        let set_b = self.resolve(pid_b)?;

        let mut comparison = NamespaceComparison {
            pid_a,
            pid_b,
            checked_count: 0,
            shared_count: 0,
            differing_count: 0,
            differing_types: BTreeSet::new(),
        };

        for (a, b) in set_a.entries().iter().zip(set_b.entries()) {
            if !a.exists || !b.exists {
                continue;
            }
            comparison.checked_count += 1;
            if a == b {
                comparison.shared_count += 1;
            } else {
                comparison.differing_count += 1;
                comparison.differing_types.insert(a.ns_type);
            }
        }

        Some(comparison)
    }

    /// Numeric entries of the process table
    pub fn list_pids(&self) -> crate::types::Result<Vec<u32>> {
        let mut pids: Vec<u32> = self
            .fs
            .list_dir(&self.proc_root)?
            .iter()
            .filter(|name| !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()))
            .filter_map(|name| name.parse().ok())
            .collect();
        pids.sort_unstable();
        Ok(pids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pseudofs::{Fault, MemoryFs};

    const HOST_IDS: [u64; 7] = [
        4026531835, 4026531839, 4026531841, 4026531840, 4026531836, 4026531837, 4026531838,
    ];

    fn add_process(fs: &MemoryFs, pid: u32, name: &str, ids: [u64; 7]) {
        fs.add_file(format!("/proc/{}/comm", pid), &format!("{}\n", name));
        for (ns_type, id) in NamespaceType::ALL.iter().zip(ids) {
            fs.add_link(
                format!("/proc/{}/ns/{}", pid, ns_type.label()),
                &format!("{}:[{}]", ns_type.label(), id),
            );
        }
    }

    fn resolver(fs: Arc<MemoryFs>) -> NamespaceResolver {
        NamespaceResolver::new(fs, "/proc")
    }

    #[test]
    fn test_parse_descriptor() {
        assert_eq!(parse_descriptor("pid:[4026531836]"), Some(("pid", 4026531836)));
        assert_eq!(parse_descriptor("net:[1]\n"), Some(("net", 1)));
        assert_eq!(parse_descriptor("pid:4026531836"), None);
        assert_eq!(parse_descriptor("pid:[]"), None);
        assert_eq!(parse_descriptor("pid:[12a]"), None);
        assert_eq!(parse_descriptor(":[12]"), None);
    }

    #[test]
    fn test_namespace_type_round_trip() {
        for ns_type in NamespaceType::ALL {
            assert_eq!(ns_type.label().parse::<NamespaceType>().unwrap(), ns_type);
        }
        assert!("time".parse::<NamespaceType>().is_err());
    }

    #[test]
    fn test_resolve_full_set() {
        let fs = Arc::new(MemoryFs::new());
        add_process(&fs, 1, "systemd", HOST_IDS);

        let set = resolver(fs).resolve(1).expect("Process should resolve");
        assert_eq!(set.entries().len(), 7);
        assert_eq!(set.resolved_count(), 7);
        assert_eq!(set.process_name(), "systemd");
        assert_eq!(set.get(NamespaceType::Pid).kernel_object_id, 4026531836);
        assert_eq!(set.get(NamespaceType::Net).raw_descriptor, "net:[4026531840]");
    }

    #[test]
    fn test_resolve_partial_set_keeps_seven_entries() {
        let fs = Arc::new(MemoryFs::new());
        add_process(&fs, 200, "worker", HOST_IDS);
        fs.inject_fault("/proc/200/ns/user", Fault::PermissionDenied);
        fs.remove("/proc/200/ns/cgroup");
        fs.add_link("/proc/200/ns/ipc", "ipc:garbage");

        let set = resolver(fs).resolve(200).expect("Partial process should resolve");
        assert_eq!(set.entries().len(), 7);
        assert_eq!(set.resolved_count(), 4);
        assert!(!set.get(NamespaceType::User).exists);
        assert!(!set.get(NamespaceType::Cgroup).exists);
        assert!(!set.get(NamespaceType::Ipc).exists);
        assert!(set.get(NamespaceType::Pid).exists);
    }

    #[test]
    fn test_resolve_missing_process() {
        let fs = Arc::new(MemoryFs::new());
        fs.add_dir("/proc");
        assert!(resolver(fs).resolve(999).is_none());
    }

    #[test]
    fn test_resolve_without_comm_has_empty_name() {
        let fs = Arc::new(MemoryFs::new());
        add_process(&fs, 5, "kthread", HOST_IDS);
        fs.remove("/proc/5/comm");

        let set = resolver(fs).resolve(5).unwrap();
        assert_eq!(set.process_name(), "");
        assert_eq!(set.resolved_count(), 7);
    }

    #[test]
    fn test_compare_self_is_fully_shared() {
        let fs = Arc::new(MemoryFs::new());
        add_process(&fs, 1, "init", HOST_IDS);

        let comparison = resolver(fs).compare(1, 1).unwrap();
        assert_eq!(comparison.checked_count, 7);
        assert_eq!(comparison.shared_count, 7);
        assert_eq!(comparison.differing_count, 0);
        assert!(comparison.is_fully_shared());
    }

    #[test]
    fn test_compare_containerized_process() {
        let fs = Arc::new(MemoryFs::new());
        add_process(&fs, 1, "init", HOST_IDS);
        let mut container = HOST_IDS;
        container[NamespaceType::Pid as usize] = 4026532300;
        container[NamespaceType::Net as usize] = 4026532303;
        container[NamespaceType::Mnt as usize] = 4026532298;
        add_process(&fs, 4242, "app", container);

        let comparison = resolver(fs).compare(1, 4242).unwrap();
        assert_eq!(comparison.checked_count, 7);
        assert_eq!(comparison.shared_count, 4);
        assert_eq!(comparison.differing_count, 3);
        assert_eq!(
            comparison.differing_types.iter().copied().collect::<Vec<_>>(),
            vec![NamespaceType::Mnt, NamespaceType::Net, NamespaceType::Pid]
        );
    }

    #[test]
    fn test_compare_skips_unresolved_types() {
        let fs = Arc::new(MemoryFs::new());
        add_process(&fs, 1, "init", HOST_IDS);
        let mut other = HOST_IDS;
        other[NamespaceType::User as usize] = 4026532500;
        add_process(&fs, 77, "sandboxed", other);
        fs.inject_fault("/proc/77/ns/user", Fault::PermissionDenied);

        let comparison = resolver(fs).compare(1, 77).unwrap();
        assert_eq!(comparison.checked_count, 6);
        assert_eq!(
            comparison.checked_count,
            comparison.shared_count + comparison.differing_count
        );
        assert!(comparison.differing_types.is_empty());
    }

    #[test]
    fn test_compare_with_missing_process() {
        let fs = Arc::new(MemoryFs::new());
        add_process(&fs, 1, "init", HOST_IDS);
        assert!(resolver(fs).compare(1, 31337).is_none());
    }

    #[test]
    fn test_identity_equality_ignores_descriptor() {
        let a = NamespaceIdentity {
            ns_type: NamespaceType::Net,
            kernel_object_id: 10,
            raw_descriptor: "net:[10]".to_string(),
            exists: true,
        };
        let mut b = a.clone();
        b.raw_descriptor = "/proc/2/ns/net".to_string();
        assert_eq!(a, b);

        b.ns_type = NamespaceType::Ipc;
        assert_ne!(a, b);
    }

    #[test]
    fn test_list_pids_filters_non_numeric() {
        let fs = Arc::new(MemoryFs::new());
        add_process(&fs, 30, "a", HOST_IDS);
        add_process(&fs, 4, "b", HOST_IDS);
        fs.add_dir("/proc/self");
        fs.add_dir("/proc/sys");
        fs.add_file("/proc/uptime", "1.0 1.0\n");

        assert_eq!(resolver(fs).list_pids().unwrap(), vec![4, 30]);
    }
}
