/// Metrics collection from captured v1 and v2 hierarchies
use crate::FakeHost;
use isoscope::cgroup::{CgroupManager, CgroupVersion, PressureResource};
use isoscope::metrics::{CgroupMetricsReader, LimitReading, PressureReading};
use isoscope::report;
use isoscope::types::PollOptions;
use std::time::Duration;

fn v1_host() -> FakeHost {
    let host = FakeHost::new();
    for hierarchy in ["cpu", "cpuacct", "memory", "pids", "blkio"] {
        host.write(&format!("/sys/fs/cgroup/{}/cgroup.procs", hierarchy), "1\n");
        host.write(&format!("/sys/fs/cgroup/{}/judge/cgroup.procs", hierarchy), "");
    }
    host.write("/sys/fs/cgroup/cpuacct/judge/cpuacct.usage", "987654321\n");
    host.write("/sys/fs/cgroup/memory/judge/memory.usage_in_bytes", "1048576\n");
    host.write("/sys/fs/cgroup/memory/judge/memory.max_usage_in_bytes", "2097152\n");
    host.write("/sys/fs/cgroup/memory/judge/memory.limit_in_bytes", "67108864\n");
    host.write("/sys/fs/cgroup/memory/judge/memory.failcnt", "12\n");
    host.write("/sys/fs/cgroup/pids/judge/pids.current", "3\n");
    host.write("/sys/fs/cgroup/pids/judge/pids.max", "max\n");
    host.write(
        "/sys/fs/cgroup/blkio/judge/blkio.throttle.io_service_bytes",
        "8:0 Read 4096\n8:0 Write 8192\n8:0 Sync 8192\n8:0 Async 4096\n\
         8:0 Total 12288\nTotal 12288\n",
    );
    host
}

#[test]
fn test_v1_snapshot_from_disk() {
    let host = v1_host();
    let cgroups = CgroupManager::new(host.fs(), "/sys/fs/cgroup");
    assert_eq!(cgroups.version(), CgroupVersion::V1);

    let snapshot = CgroupMetricsReader::new(&cgroups).snapshot("judge").unwrap();
    assert_eq!(snapshot.cpu_usage_ns, 987654321);
    assert_eq!(snapshot.memory_current_bytes, 1048576);
    assert_eq!(snapshot.memory_peak_bytes, 2097152);
    assert_eq!(snapshot.memory_limit_bytes, LimitReading::Limited(67108864));
    assert_eq!(snapshot.memory_fail_count, 12);
    assert_eq!(snapshot.pids_current, 3);
    assert_eq!(snapshot.pids_max, LimitReading::Unlimited);
    assert_eq!(snapshot.blkio_read_bytes, 4096);
    assert_eq!(snapshot.blkio_write_bytes, 8192);
    for resource in PressureResource::ALL {
        assert_eq!(snapshot.pressure[&resource], PressureReading::Unsupported);
    }
}

#[test]
fn test_v2_root_snapshot_and_csv() {
    let host = FakeHost::new();
    host.add_cgroup_v2_root();
    host.write("/sys/fs/cgroup/cpu.stat", "usage_usec 1000\nuser_usec 600\nsystem_usec 400\n");
    host.write(
        "/sys/fs/cgroup/cpu.pressure",
        "some avg10=1.50 avg60=0.75 avg300=0.20 total=99\n\
         full avg10=0.00 avg60=0.00 avg300=0.00 total=0\n",
    );

    let cgroups = CgroupManager::new(host.fs(), "/sys/fs/cgroup");
    let snapshot = CgroupMetricsReader::new(&cgroups).snapshot_root().unwrap();
    assert_eq!(snapshot.cpu_usage_ns, 1_000_000);
    assert_eq!(snapshot.pressure[&PressureResource::Memory], PressureReading::Unavailable);

    let csv = report::metrics_to_csv(&snapshot);
    assert!(csv.contains("cpu_usage_ns,1000000\n"));
    assert!(csv.contains("cpu_pressure_avg10,1.50\n"));
    assert!(csv.contains("cpu_pressure_total_us,99\n"));
}

#[test]
fn test_wait_for_pids_on_disk() {
    let host = v1_host();
    let cgroups = CgroupManager::new(host.fs(), "/sys/fs/cgroup");
    let options = PollOptions {
        interval: Duration::from_millis(5),
        timeout: Duration::from_secs(2),
        stable_reads: 2,
    };
    let settled = CgroupMetricsReader::new(&cgroups)
        .wait_for_pids_settled("judge", options)
        .unwrap();
    assert_eq!(settled, 3);
}
