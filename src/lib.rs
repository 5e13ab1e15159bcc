//! isoscope: Linux namespace inspection and cgroup resource control
//! Resolves namespace identities from /proc and manages cgroup v1/v2 limits and metrics.

pub mod cgroup;
pub mod cli;
pub mod metrics;
pub mod namespace;
pub mod pseudofs;
pub mod report;
pub mod resource_limits;
pub mod scan;
pub mod types;
