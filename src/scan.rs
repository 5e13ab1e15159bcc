/// System-wide namespace grouping
/// Walks the whole process table and aggregates processes by shared namespace.
use crate::namespace::{NamespaceResolver, NamespaceType};
use crate::types::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Processes sharing one namespace object
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamespaceGroup {
    #[serde(rename = "type")]
    pub ns_type: NamespaceType,
    #[serde(rename = "inode")]
    pub kernel_object_id: u64,
    #[serde(rename = "process_count")]
    pub member_count: usize,
    /// Only filled when members were requested
    #[serde(rename = "pids", skip_serializing_if = "Vec::is_empty")]
    pub member_pids: Vec<u32>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScanOptions {
    /// Retain the pid list of every group instead of counts only
    pub keep_members: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    /// Ordered by namespace type, then inode
    pub groups: Vec<NamespaceGroup>,
    pub processes_scanned: usize,
    /// Processes that disappeared or were unreadable
    pub processes_skipped: usize,
    /// The stop flag was raised before the table was exhausted
    pub interrupted: bool,
}

pub struct NamespaceScanner<'a> {
    resolver: &'a NamespaceResolver,
}

impl<'a> NamespaceScanner<'a> {
    pub fn new(resolver: &'a NamespaceResolver) -> Self {
        Self { resolver }
    }

    /// Group every live process by namespace; counts only
    pub fn scan_system(&self) -> Result<Vec<NamespaceGroup>> {
        Ok(self.scan_with(ScanOptions::default(), None)?.groups)
    }

    /// Full re-scan of the process table
    ///
    /// `stop` is checked between processes; when raised the scan returns what
    /// it has aggregated so far with `interrupted` set.
    pub fn scan_with(
        &self,
        options: ScanOptions,
        stop: Option<&AtomicBool>,
    ) -> Result<ScanOutcome> {
        let pids = self.resolver.list_pids()?;
        let mut groups: BTreeMap<(NamespaceType, u64), NamespaceGroup> = BTreeMap::new();
        let mut outcome = ScanOutcome::default();

        for pid in pids {
            if stop.map_or(false, |flag| flag.load(Ordering::Relaxed)) {
                log::info!(
                    "Namespace scan interrupted after {} processes",
                    outcome.processes_scanned
                );
                outcome.interrupted = true;
                break;
            }

            let set = match self.resolver.resolve(pid) {
                Some(set) => set,
                None => {
                    log::debug!("Skipping pid {}: namespaces unreadable", pid);
                    outcome.processes_skipped += 1;
                    continue;
                }
            };
            outcome.processes_scanned += 1;

            for entry in set.entries().iter().filter(|entry| entry.exists) {
                let group = groups.entry(entry.key()).or_insert_with(|| NamespaceGroup {
                    ns_type: entry.ns_type,
                    kernel_object_id: entry.kernel_object_id,
                    member_count: 0,
                    member_pids: Vec::new(),
                });
                group.member_count += 1;
                if options.keep_members {
                    group.member_pids.push(pid);
                }
            }
        }

        outcome.groups = groups.into_values().collect();
        log::debug!(
            "Namespace scan: {} processes, {} skipped, {} groups",
            outcome.processes_scanned,
            outcome.processes_skipped,
            outcome.groups.len()
        );
        Ok(outcome)
    }

    /// Pids of every process whose namespace of `ns_type` is the given inode
    pub fn find_processes_in_namespace(
        &self,
        ns_type: NamespaceType,
        inode: u64,
    ) -> Result<Vec<u32>> {
        let pids = self.resolver.list_pids()?;
        Ok(pids
            .into_iter()
            .filter(|pid| {
                let entry = self.resolver.resolve_entry(*pid, ns_type);
                entry.exists && entry.kernel_object_id == inode
            })
            .collect())
    }
}
