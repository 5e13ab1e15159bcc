/// Report rendering for namespace groups and cgroup metrics
use crate::metrics::CgroupMetricsSnapshot;
use crate::scan::NamespaceGroup;
use crate::types::Result;
use std::fmt::Write as _;
use std::io::Write;
use std::path::Path;

/// Output formats for machine-readable reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ReportFormat {
    Csv,
    Json,
}

pub const GROUPS_CSV_HEADER: &str = "Type,Inode,ProcessCount,PIDs";

/// One row per group; the PIDs column stays empty unless members were kept
pub fn groups_to_csv(groups: &[NamespaceGroup]) -> String {
    let mut out = String::with_capacity(64 * (groups.len() + 1));
    out.push_str(GROUPS_CSV_HEADER);
    out.push('\n');
    for group in groups {
        let pids: Vec<String> = group.member_pids.iter().map(u32::to_string).collect();
        let _ = writeln!(
            out,
            "{},{},{},{}",
            group.ns_type,
            group.kernel_object_id,
            group.member_count,
            pids.join(" ")
        );
    }
    out
}

pub fn groups_to_json(groups: &[NamespaceGroup]) -> Result<String> {
    Ok(serde_json::to_string_pretty(groups).map_err(std::io::Error::from)?)
}

pub fn render_groups(groups: &[NamespaceGroup], format: ReportFormat) -> Result<String> {
    match format {
        ReportFormat::Csv => Ok(groups_to_csv(groups)),
        ReportFormat::Json => groups_to_json(groups),
    }
}

pub fn metrics_to_csv(snapshot: &CgroupMetricsSnapshot) -> String {
    let mut out = String::from("Metric,Value\n");
    for (metric, value) in snapshot.metric_rows() {
        let _ = writeln!(out, "{},{}", metric, value);
    }
    out
}

pub fn metrics_to_json(snapshot: &CgroupMetricsSnapshot) -> Result<String> {
    Ok(serde_json::to_string_pretty(snapshot).map_err(std::io::Error::from)?)
}

/// Human-readable rendering for terminals
pub fn metrics_to_text(snapshot: &CgroupMetricsSnapshot) -> String {
    let title = if snapshot.name.is_empty() {
        "<root>"
    } else {
        snapshot.name.as_str()
    };
    let mut out = String::new();
    let _ = writeln!(out, "Cgroup: {} ({})", title, snapshot.version);
    let _ = writeln!(out, "Captured: {}", snapshot.captured_at.to_rfc3339());
    let rows = snapshot.metric_rows();
    let width = rows.iter().map(|(metric, _)| metric.len()).max().unwrap_or(0);
    for (metric, value) in rows {
        let _ = writeln!(out, "  {:<width$}  {}", metric, value, width = width);
    }
    out
}

/// Write a rendered report to `output`, or to stdout when none is given
pub fn write_report(content: &str, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            std::fs::write(path, content)?;
            log::info!("Report written to {}", path.display());
        }
        None => {
            let stdout = std::io::stdout();
            let mut handle = stdout.lock();
            handle.write_all(content.as_bytes())?;
            if !content.ends_with('\n') {
                handle.write_all(b"\n")?;
            }
        }
    }
    Ok(())
}
