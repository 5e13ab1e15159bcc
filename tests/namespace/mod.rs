/// Namespace resolution, comparison and grouping over real symlink trees
use crate::{FakeHost, HOST_IDS};
use isoscope::namespace::{NamespaceResolver, NamespaceType};
use isoscope::pseudofs::HostFs;
use isoscope::report;
use isoscope::scan::{NamespaceScanner, ScanOptions};
use std::sync::Arc;

fn container_ids() -> [u64; 7] {
    let mut ids = HOST_IDS;
    // Own pid, net, mnt and uts namespaces; shares cgroup, ipc and user with the host
    ids[NamespaceType::Mnt as usize] = 4026532200;
    ids[NamespaceType::Net as usize] = 4026532203;
    ids[NamespaceType::Pid as usize] = 4026532201;
    ids[NamespaceType::Uts as usize] = 4026532202;
    ids
}

fn sample_host() -> FakeHost {
    let host = FakeHost::new();
    host.add_process(1, "systemd", HOST_IDS);
    host.add_process(812, "sshd", HOST_IDS);
    host.add_process(4100, "nginx", container_ids());
    host.add_process(4101, "nginx", container_ids());
    host
}

#[test]
fn test_resolve_reads_symlinks() {
    let host = sample_host();
    let resolver = NamespaceResolver::new(host.fs(), "/proc");

    let set = resolver.resolve(4100).expect("process should resolve");
    assert_eq!(set.process_name(), "nginx");
    assert_eq!(set.entries().len(), 7);
    assert_eq!(set.resolved_count(), 7);
    assert_eq!(set.get(NamespaceType::Pid).kernel_object_id, 4026532201);
    assert_eq!(set.get(NamespaceType::Pid).raw_descriptor, "pid:[4026532201]");
}

#[test]
fn test_resolve_missing_process() {
    let host = sample_host();
    let resolver = NamespaceResolver::new(host.fs(), "/proc");
    assert!(resolver.resolve(31337).is_none());
}

#[test]
fn test_compare_init_with_containerized_process() {
    let host = sample_host();
    let resolver = NamespaceResolver::new(host.fs(), "/proc");

    let comparison = resolver.compare(1, 4100).unwrap();
    assert_eq!(comparison.checked_count, 7);
    assert_eq!(
        comparison.checked_count,
        comparison.shared_count + comparison.differing_count
    );
    assert!(comparison.differing_types.contains(&NamespaceType::Pid));
    assert_eq!(
        comparison.differing_types.iter().copied().collect::<Vec<_>>(),
        vec![NamespaceType::Mnt, NamespaceType::Net, NamespaceType::Pid, NamespaceType::Uts]
    );

    let same = resolver.compare(4100, 4101).unwrap();
    assert!(same.is_fully_shared());
}

#[test]
fn test_scan_and_report_agree() {
    let host = sample_host();
    let resolver = NamespaceResolver::new(host.fs(), "/proc");
    let outcome = NamespaceScanner::new(&resolver)
        .scan_with(ScanOptions { keep_members: true }, None)
        .unwrap();

    assert_eq!(outcome.processes_scanned, 4);
    let pid_groups: Vec<_> = outcome
        .groups
        .iter()
        .filter(|group| group.ns_type == NamespaceType::Pid)
        .collect();
    assert_eq!(pid_groups.len(), 2);
    assert_eq!(pid_groups[0].member_pids, vec![1, 812]);
    assert_eq!(pid_groups[1].member_pids, vec![4100, 4101]);

    let csv = report::groups_to_csv(&outcome.groups);
    assert!(csv.contains("pid,4026531836,2,1 812\n"));
    assert!(csv.contains("ipc,4026531839,4,1 812 4100 4101\n"));
}

#[test]
fn test_live_self_comparison() {
    let resolver = NamespaceResolver::new(Arc::new(HostFs::new()), "/proc");
    let pid = std::process::id();

    match resolver.resolve(pid) {
        Some(set) => assert_eq!(set.entries().len(), 7),
        None => {
            println!("Skipping: /proc/{}/ns is not readable", pid);
            return;
        }
    }

    let comparison = resolver.compare(pid, pid).unwrap();
    assert_eq!(comparison.differing_count, 0);
    assert_eq!(comparison.shared_count, comparison.checked_count);
}
