/// Cgroup lifecycle and limits against an on-disk hierarchy, plus a live root-only check
use crate::{skip_without_root_cgroups, FakeHost};
use isoscope::cgroup::{CgroupManager, CgroupVersion, CreateOutcome};
use isoscope::metrics::{CgroupMetricsReader, LimitReading};
use isoscope::pseudofs::HostFs;
use isoscope::resource_limits::{
    CpuLimit, LimitValue, MemoryLimit, ResourceLimitController, ResourceLimitSpec,
};
use isoscope::types::ProbeError;
use serial_test::serial;
use std::sync::Arc;

/// Plain directories do not grow control files, so seed the ones cgroupfs would create
fn seed_group(host: &FakeHost, name: &str) {
    let dir = format!("/sys/fs/cgroup/{}", name);
    host.write(&format!("{}/cgroup.procs", dir), "");
    host.write(&format!("{}/cpu.max", dir), "max 100000\n");
    host.write(&format!("{}/memory.max", dir), "max\n");
    host.write(&format!("{}/pids.max", dir), "max\n");
}

#[test]
fn test_create_on_disk_enables_controllers() {
    let host = FakeHost::new();
    host.add_cgroup_v2_root();
    let cgroups = CgroupManager::new(host.fs(), "/sys/fs/cgroup");

    assert_eq!(cgroups.version(), CgroupVersion::V2);
    assert_eq!(cgroups.create("bench").unwrap(), CreateOutcome::Created);
    assert!(host.root().join("sys/fs/cgroup/bench").is_dir());
    assert_eq!(
        std::fs::read_to_string(host.root().join("sys/fs/cgroup/cgroup.subtree_control")).unwrap(),
        "+cpu +io +memory +pids"
    );
    assert_eq!(cgroups.create("bench").unwrap(), CreateOutcome::AlreadyExisted);
}

#[test]
fn test_limits_round_trip_through_metrics() {
    let host = FakeHost::new();
    host.add_cgroup_v2_root();
    let cgroups = CgroupManager::new(host.fs(), "/sys/fs/cgroup");
    cgroups.create("bench").unwrap();
    seed_group(&host, "bench");

    let spec = ResourceLimitSpec {
        cpu: Some(CpuLimit::Cores { cores: 0.5, period_us: Some(100_000) }),
        memory: Some(MemoryLimit::bytes(100 * 1024 * 1024)),
        pids: Some(LimitValue::Value(16)),
        io: None,
    };
    let applied = ResourceLimitController::new(&cgroups).apply("bench", &spec).unwrap();
    assert_eq!(applied, 3);

    let group = host.root().join("sys/fs/cgroup/bench");
    assert_eq!(std::fs::read_to_string(group.join("cpu.max")).unwrap(), "50000 100000");
    assert_eq!(std::fs::read_to_string(group.join("memory.max")).unwrap(), "104857600");

    let snapshot = CgroupMetricsReader::new(&cgroups).snapshot("bench").unwrap();
    assert_eq!(snapshot.memory_limit_bytes, LimitReading::Limited(104857600));
    assert_eq!(snapshot.pids_max, LimitReading::Limited(16));

    ResourceLimitController::new(&cgroups)
        .set_memory_limit("bench", MemoryLimit::unlimited())
        .unwrap();
    let snapshot = CgroupMetricsReader::new(&cgroups).snapshot("bench").unwrap();
    assert_eq!(snapshot.memory_limit_bytes, LimitReading::Unlimited);
}

#[test]
fn test_missing_control_file_is_unsupported() {
    let host = FakeHost::new();
    host.add_cgroup_v2_root();
    let cgroups = CgroupManager::new(host.fs(), "/sys/fs/cgroup");
    cgroups.create("bare").unwrap();

    let result =
        ResourceLimitController::new(&cgroups).set_pids_limit("bare", LimitValue::Value(4));
    assert!(matches!(result, Err(ProbeError::UnsupportedController(_))));
    assert!(!host.root().join("sys/fs/cgroup/bare/pids.max").exists());
}

#[test]
fn test_delete_empty_group_on_disk() {
    let host = FakeHost::new();
    host.add_cgroup_v2_root();
    let cgroups = CgroupManager::new(host.fs(), "/sys/fs/cgroup");
    cgroups.create("short-lived").unwrap();

    cgroups.delete("short-lived").unwrap();
    assert!(!cgroups.exists("short-lived"));
    assert!(matches!(cgroups.delete("short-lived"), Err(ProbeError::NotFound(_))));
}

#[test]
#[serial]
fn test_live_cgroup_lifecycle() {
    if skip_without_root_cgroups() {
        return;
    }

    let cgroups = CgroupManager::new(Arc::new(HostFs::new()), "/sys/fs/cgroup");
    let name = format!("isoscope-test-{}", uuid::Uuid::new_v4());
    match cgroups.create(&name) {
        Ok(outcome) => assert_eq!(outcome, CreateOutcome::Created),
        Err(e) => {
            println!("Skipping: cannot create cgroup ({})", e);
            return;
        }
    }

    let limits = ResourceLimitController::new(&cgroups);
    match limits.set_pids_limit(&name, LimitValue::Value(8)) {
        Ok(()) => {
            let snapshot = CgroupMetricsReader::new(&cgroups).snapshot(&name).unwrap();
            assert_eq!(snapshot.pids_max, LimitReading::Limited(8));
            assert_eq!(snapshot.pids_current, 0);
        }
        Err(e) => println!("pids controller unavailable: {}", e),
    }

    cgroups.delete(&name).expect("Failed to delete test cgroup");
    assert!(!cgroups.exists(&name));
}
