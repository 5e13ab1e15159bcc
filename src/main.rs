/// isoscope: Linux namespace inspection and cgroup resource control
///
/// Resolves the namespaces of running processes, groups the process table by
/// shared namespace, and creates, limits and measures control groups on both
/// cgroup v1 and v2 hosts.
///
/// # Usage
/// ```bash
/// isoscope list 1
/// isoscope compare 1 $$
/// isoscope report csv --output namespaces.csv
/// sudo isoscope cgroup create bench
/// sudo isoscope cgroup set-memory bench 100
/// isoscope cgroup metrics bench --format json
/// ```
use clap::Parser;
use isoscope::cli::{self, Cli, Commands};
use isoscope::types::ProbeError;

fn main() {
    env_logger::init();

    if !cfg!(target_os = "linux") {
        eprintln!("Error: isoscope requires Linux (/proc namespaces and cgroupfs)");
        std::process::exit(1);
    }

    let cli = Cli::parse();

    // Cgroup writes and other users' namespace links need root
    if matches!(cli.command, Commands::Cgroup(_)) && unsafe { libc::geteuid() } != 0 {
        eprintln!("Warning: not running as root; cgroup changes will likely be refused");
    }

    if let Err(err) = cli::run(cli) {
        let kind = err
            .downcast_ref::<ProbeError>()
            .map(ProbeError::kind)
            .unwrap_or("error");
        eprintln!("error [{}]: {:#}", kind, err);
        std::process::exit(1);
    }
}
