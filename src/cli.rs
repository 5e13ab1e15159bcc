/// Command Line Interface for isoscope
use crate::cgroup::{CgroupManager, CreateOutcome};
use crate::metrics::CgroupMetricsReader;
use crate::namespace::{NamespaceResolver, NamespaceType};
use crate::pseudofs::{HostFs, PseudoFs};
use crate::report::{self, ReportFormat};
use crate::resource_limits::{
    CpuLimit, DeviceId, IoLimit, LimitValue, MemoryLimit, ResourceLimitController,
};
use crate::scan::{NamespaceScanner, ScanOptions};
use crate::types::{ProbeConfig, ProbeError};
use clap::{ArgGroup, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "isoscope")]
#[command(
    version,
    about = "Linux namespace inspection and cgroup resource control",
    long_about = None
)]
pub struct Cli {
    /// Prefix for every kernel path (e.g. a captured /proc and /sys tree)
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Process table location, relative to --root
    #[arg(long, global = true)]
    pub proc_root: Option<PathBuf>,

    /// Cgroup mount point, relative to --root
    #[arg(long, global = true)]
    pub cgroup_root: Option<PathBuf>,

    /// JSON configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List the namespaces of a process
    List {
        pid: u32,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Find processes in a specific namespace
    Find {
        /// Namespace type (cgroup, ipc, mnt, net, pid, user, uts)
        ns_type: NamespaceType,

        /// Namespace inode number
        inode: u64,
    },

    /// Compare the namespaces of two processes
    Compare {
        pid_a: u32,
        pid_b: u32,

        #[arg(long)]
        json: bool,
    },

    /// Group every process on the system by namespace
    Report {
        #[arg(value_enum)]
        format: ReportFormat,

        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Include the member pids of every group
        #[arg(long)]
        with_pids: bool,
    },

    /// Control group management
    #[command(subcommand)]
    Cgroup(CgroupCommands),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MetricsFormat {
    Text,
    Csv,
    Json,
}

#[derive(Subcommand)]
pub enum CgroupCommands {
    /// Show the detected cgroup version and available controllers
    Version,

    /// Create a cgroup (a unique name is generated when omitted)
    Create { name: Option<String> },

    /// Move members to the parent group and remove the cgroup
    Delete { name: String },

    /// Check whether a cgroup exists
    Exists { name: String },

    /// Attach a process to a cgroup
    Move { name: String, pid: u32 },

    /// List the processes attached to a cgroup
    Procs { name: String },

    /// Set the CPU bandwidth limit
    #[command(group(
        ArgGroup::new("cpu_limit")
            .required(true)
            .args(["cores", "quota", "unlimited"])
    ))]
    SetCpu {
        name: String,

        /// Number of CPUs, fractional allowed (e.g. 0.5)
        #[arg(long)]
        cores: Option<f64>,

        /// Quota in microseconds per period
        #[arg(long)]
        quota: Option<u64>,

        /// Period in microseconds
        #[arg(long)]
        period: Option<u64>,

        /// Remove the CPU limit
        #[arg(long)]
        unlimited: bool,
    },

    /// Set the memory limit in MB ("max" for unlimited)
    SetMemory {
        name: String,

        #[arg(value_parser = parse_megabytes)]
        limit: LimitValue,

        /// Swap allowance in MB ("max" for unlimited)
        #[arg(long, value_parser = parse_megabytes)]
        swap: Option<LimitValue>,
    },

    /// Set the maximum number of processes ("max" for unlimited)
    SetPids { name: String, limit: LimitValue },

    /// Throttle block I/O on one device
    #[command(group(ArgGroup::new("device_source").required(true).args(["device", "device_path"])))]
    SetIo {
        name: String,

        /// Device number as MAJOR:MINOR
        #[arg(long)]
        device: Option<DeviceId>,

        /// Use the device backing this path
        #[arg(long)]
        device_path: Option<PathBuf>,

        /// Write bytes per second ("max" for unlimited)
        #[arg(long)]
        wbps: LimitValue,

        /// Read bytes per second ("max" for unlimited)
        #[arg(long)]
        rbps: Option<LimitValue>,
    },

    /// Show usage, limits and pressure of a cgroup (the root group when no name is given)
    Metrics {
        name: Option<String>,

        #[arg(long, value_enum, default_value_t = MetricsFormat::Text)]
        format: MetricsFormat,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Wait until pids.current stops changing
    WaitPids {
        name: String,

        #[arg(long)]
        timeout_ms: Option<u64>,

        #[arg(long)]
        interval_ms: Option<u64>,
    },
}

fn parse_megabytes(s: &str) -> Result<LimitValue, String> {
    match s.parse::<LimitValue>().map_err(|e| e.to_string())? {
        LimitValue::Value(mb) => mb
            .checked_mul(1024 * 1024)
            .map(LimitValue::from_bytes)
            .ok_or_else(|| format!("{} MB is out of range", mb)),
        LimitValue::Unlimited => Ok(LimitValue::Unlimited),
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<ProbeConfig> {
    let mut config = match &cli.config {
        Some(path) => ProbeConfig::load(path)?,
        None => ProbeConfig::default(),
    };
    if let Some(root) = &cli.root {
        config.fs_root = root.clone();
    }
    if let Some(proc_root) = &cli.proc_root {
        config.proc_root = proc_root.clone();
    }
    if let Some(cgroup_root) = &cli.cgroup_root {
        config.cgroup_root = cgroup_root.clone();
    }
    Ok(config)
}

pub fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    let fs: Arc<dyn PseudoFs> = Arc::new(HostFs::with_root(config.fs_root.clone()));
    log::debug!("Using kernel paths under {}", config.fs_root.display());

    match cli.command {
        Commands::List { pid, json } => {
            let resolver = NamespaceResolver::new(fs, config.proc_root.clone());
            let set = resolver
                .resolve(pid)
                .ok_or_else(|| ProbeError::NotFound(format!("namespaces of process {}", pid)))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&set)?);
            } else {
                println!("{}", set);
            }
        }
        Commands::Find { ns_type, inode } => {
            let resolver = NamespaceResolver::new(fs, config.proc_root.clone());
            let pids =
                NamespaceScanner::new(&resolver).find_processes_in_namespace(ns_type, inode)?;
            println!("Processes in {} namespace {}:", ns_type, inode);
            println!("----------------------------------------");
            if pids.is_empty() {
                println!("No processes found");
            }
            for pid in &pids {
                match resolver.process_name(*pid) {
                    Some(name) => println!("PID {} ({})", pid, name),
                    None => println!("PID {}", pid),
                }
            }
            println!("Total: {} processes", pids.len());
        }
        Commands::Compare { pid_a, pid_b, json } => {
            let resolver = NamespaceResolver::new(fs, config.proc_root.clone());
            let comparison = resolver.compare(pid_a, pid_b).ok_or_else(|| {
                ProbeError::NotFound(format!("namespaces of process {} or {}", pid_a, pid_b))
            })?;
            if json {
                println!("{}", serde_json::to_string_pretty(&comparison)?);
            } else {
                println!("{}", comparison);
            }
        }
        Commands::Report {
            format,
            output,
            with_pids,
        } => {
            let resolver = NamespaceResolver::new(fs, config.proc_root.clone());
            let outcome = NamespaceScanner::new(&resolver).scan_with(
                ScanOptions {
                    keep_members: with_pids,
                },
                None,
            )?;
            log::info!(
                "Scanned {} processes ({} skipped) into {} namespace groups",
                outcome.processes_scanned,
                outcome.processes_skipped,
                outcome.groups.len()
            );
            let content = report::render_groups(&outcome.groups, format)?;
            report::write_report(&content, output.as_deref())?;
        }
        Commands::Cgroup(command) => {
            let cgroups = CgroupManager::from_config(fs, &config);
            run_cgroup(command, &cgroups, &config)?;
        }
    }

    Ok(())
}

fn run_cgroup(
    command: CgroupCommands,
    cgroups: &CgroupManager,
    config: &ProbeConfig,
) -> anyhow::Result<()> {
    let limits =
        ResourceLimitController::new(cgroups).with_default_period(config.default_cpu_period_us);

    match command {
        CgroupCommands::Version => {
            println!("cgroup {} at {}", cgroups.version(), cgroups.root().display());
            let controllers: Vec<String> = cgroups
                .available_controllers()
                .iter()
                .map(|controller| format!("{:?}", controller).to_lowercase())
                .collect();
            println!("Controllers: {}", controllers.join(" "));
        }
        CgroupCommands::Create { name } => {
            let name = name.unwrap_or_else(|| format!("isoscope-{}", uuid::Uuid::new_v4()));
            match cgroups.create(&name)? {
                CreateOutcome::Created => println!("Created cgroup '{}'", name),
                CreateOutcome::AlreadyExisted => println!("Cgroup '{}' already exists", name),
            }
        }
        CgroupCommands::Delete { name } => {
            cgroups.delete(&name)?;
            println!("Deleted cgroup '{}'", name);
        }
        CgroupCommands::Exists { name } => {
            println!("{}", cgroups.exists(&name));
        }
        CgroupCommands::Move { name, pid } => {
            cgroups.move_process(&name, pid)?;
            println!("Moved process {} into cgroup '{}'", pid, name);
        }
        CgroupCommands::Procs { name } => {
            for pid in cgroups.list_processes(&name)? {
                println!("{}", pid);
            }
        }
        CgroupCommands::SetCpu {
            name,
            cores,
            quota,
            period,
            unlimited,
        } => {
            let limit = match (cores, quota) {
                (Some(cores), _) => CpuLimit::Cores { cores, period_us: period },
                (None, Some(quota_us)) => CpuLimit::Quota {
                    quota_us,
                    period_us: period.unwrap_or(config.default_cpu_period_us),
                },
                (None, None) if unlimited => CpuLimit::Unlimited,
                (None, None) => {
                    return Err(ProbeError::Config("no CPU limit given".to_string()).into())
                }
            };
            limits.set_cpu_limit(&name, limit)?;
            println!("CPU limit of '{}' set", name);
        }
        CgroupCommands::SetMemory { name, limit, swap } => {
            limits.set_memory_limit(&name, MemoryLimit { limit, swap })?;
            println!("Memory limit of '{}' set to {}", name, limit);
        }
        CgroupCommands::SetPids { name, limit } => {
            limits.set_pids_limit(&name, limit)?;
            println!("Pids limit of '{}' set to {}", name, limit);
        }
        CgroupCommands::SetIo {
            name,
            device,
            device_path,
            wbps,
            rbps,
        } => {
            let device = match (device, device_path) {
                (Some(device), _) => device,
                (None, Some(path)) => DeviceId::from_path(&path)?,
                (None, None) => {
                    return Err(ProbeError::Config("no device given".to_string()).into())
                }
            };
            limits.set_io_limit(
                &name,
                IoLimit {
                    device,
                    write_bps: wbps,
                    read_bps: rbps,
                },
            )?;
            println!("I/O limit of '{}' on {} set", name, device);
        }
        CgroupCommands::Metrics {
            name,
            format,
            output,
        } => {
            let reader = CgroupMetricsReader::new(cgroups);
            let snapshot = match name {
                Some(name) => reader.snapshot(&name)?,
                None => reader.snapshot_root()?,
            };
            let content = match format {
                MetricsFormat::Text => report::metrics_to_text(&snapshot),
                MetricsFormat::Csv => report::metrics_to_csv(&snapshot),
                MetricsFormat::Json => report::metrics_to_json(&snapshot)?,
            };
            report::write_report(&content, output.as_deref())?;
        }
        CgroupCommands::WaitPids {
            name,
            timeout_ms,
            interval_ms,
        } => {
            let mut options = config.poll_options();
            if let Some(timeout_ms) = timeout_ms {
                options.timeout = Duration::from_millis(timeout_ms);
            }
            if let Some(interval_ms) = interval_ms {
                options.interval = Duration::from_millis(interval_ms);
            }
            let settled = CgroupMetricsReader::new(cgroups).wait_for_pids_settled(&name, options)?;
            println!("{}", settled);
        }
    }

    Ok(())
}
