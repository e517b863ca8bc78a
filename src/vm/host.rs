//! Host validation before a launch.
//!
//! Resources below the manifest minimums are a hard failure; resources below
//! the requested sizing only produce warnings.

use tracing::{debug, warn};

use crate::config::ResourceSizing;
use crate::error::SupervisorError;

/// What the host can offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostResources {
    pub cpus: u32,
    /// `None` when total memory could not be determined.
    pub memory_mb: Option<u64>,
}

impl HostResources {
    pub fn detect() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        let memory_mb = total_memory_mb();
        debug!(cpus, memory_mb = ?memory_mb, "detected host resources");
        Self { cpus, memory_mb }
    }
}

/// Check `host` against `sizing`. Returns soft warnings on success.
pub fn evaluate(host: &HostResources, sizing: &ResourceSizing) -> Result<Vec<String>, SupervisorError> {
    let mut warnings = Vec::new();

    if host.cpus < sizing.min_cpus {
        return Err(SupervisorError::InsufficientResources(format!(
            "{} CPUs available, at least {} required",
            host.cpus, sizing.min_cpus
        )));
    }
    if host.cpus < sizing.cpus {
        warnings.push(format!(
            "{} CPUs requested but only {} available; the guest will share cores",
            sizing.cpus, host.cpus
        ));
    }

    match host.memory_mb {
        Some(memory) if memory < sizing.min_memory_mb => {
            return Err(SupervisorError::InsufficientResources(format!(
                "{memory} MB of memory available, at least {} MB required",
                sizing.min_memory_mb
            )));
        }
        Some(memory) if memory < sizing.memory_mb => warnings.push(format!(
            "{} MB of memory requested but the host only has {memory} MB",
            sizing.memory_mb
        )),
        Some(_) => {}
        None => warnings.push("could not determine host memory".to_string()),
    }

    for warning in &warnings {
        warn!(warning = %warning, "host validation");
    }
    Ok(warnings)
}

#[cfg(target_os = "linux")]
fn total_memory_mb() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / 1024)
}

#[cfg(target_os = "macos")]
fn total_memory_mb() -> Option<u64> {
    let output = std::process::Command::new("sysctl")
        .args(["-n", "hw.memsize"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let bytes: u64 = String::from_utf8_lossy(&output.stdout).trim().parse().ok()?;
    Some(bytes / (1024 * 1024))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn total_memory_mb() -> Option<u64> {
    None
}
