//! Configuration for the supervisor.
//!
//! The workload manifest is produced by an external manifest parser; this
//! crate only consumes the already-parsed value. For the CLI the manifest and
//! the supervisor tunables live together in one TOML file:
//!
//! ```toml
//! [manifest]
//! name = "stack"
//! ports = [{ host_port = 8080, guest_port = 80 }]
//!
//! [manifest.resources]
//! cpus = 4
//! memory_mb = 4096
//!
//! [manifest.health]
//! url = "http://127.0.0.1:8080/healthz"
//!
//! [supervisor]
//! max_auto_restarts = 5
//!
//! [boot]
//! kernel = "/Applications/Stack.app/Contents/Resources/vmlinuz"
//! initrd = "/Applications/Stack.app/Contents/Resources/initrd.img"
//! root_archive = "/Applications/Stack.app/Contents/Resources/root.img.gz"
//! ```
//!
//! Every section is `#[serde(default)]`; defaults match the documented
//! supervisor behaviour.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::paths::DockhandPaths;

// ---------------------------------------------------------------------------
// Workload manifest
// ---------------------------------------------------------------------------

/// A single host TCP port exposed for a guest TCP port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port bound on the host loopback interface.
    pub host_port: u16,
    /// Port the workload listens on inside the guest.
    pub guest_port: u16,
}

impl PortMapping {
    pub const fn new(host_port: u16, guest_port: u16) -> Self {
        Self {
            host_port,
            guest_port,
        }
    }

    /// Guest channel port used to reach `guest_port`.
    pub fn channel_port(self, base: u32) -> u32 {
        base + u32::from(self.guest_port)
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.host_port, self.guest_port)
    }
}

/// CPU/memory/disk sizing requested by the workload, with hard minimums.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceSizing {
    pub cpus: u32,
    pub memory_mb: u64,
    /// Size of the persistent data image created on first launch.
    pub data_disk_mb: u64,
    /// Below this many host CPUs the start is refused.
    pub min_cpus: u32,
    /// Below this much host memory the start is refused.
    pub min_memory_mb: u64,
}

impl Default for ResourceSizing {
    fn default() -> Self {
        Self {
            cpus: 2,
            memory_mb: 2048,
            data_disk_mb: 16 * 1024,
            min_cpus: 1,
            min_memory_mb: 1024,
        }
    }
}

/// HTTP readiness endpoint polled once the workload is running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpHealthCheck {
    pub url: String,
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,
}

fn default_health_interval() -> u64 {
    10
}

fn default_health_timeout() -> u64 {
    5
}

impl HttpHealthCheck {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// The parsed workload manifest. Immutable for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadManifest {
    pub name: String,
    pub ports: Vec<PortMapping>,
    pub resources: ResourceSizing,
    pub health: Option<HttpHealthCheck>,
}

impl Default for WorkloadManifest {
    fn default() -> Self {
        Self {
            name: "workload".to_string(),
            ports: Vec::new(),
            resources: ResourceSizing::default(),
            health: None,
        }
    }
}

impl WorkloadManifest {
    /// Check the invariants the supervisor relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ports.is_empty() {
            return Err(ConfigError::NoPortMappings);
        }

        let mut seen = HashSet::new();
        for mapping in &self.ports {
            if mapping.host_port == 0 || mapping.guest_port == 0 {
                return Err(ConfigError::ZeroPort {
                    host_port: mapping.host_port,
                    guest_port: mapping.guest_port,
                });
            }
            if !seen.insert(mapping.host_port) {
                return Err(ConfigError::DuplicateHostPort(mapping.host_port));
            }
        }

        if let Some(health) = &self.health {
            let parsed = url::Url::parse(&health.url)
                .map_err(|e| ConfigError::InvalidHealthUrl(format!("{}: {e}", health.url)))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ConfigError::InvalidHealthUrl(health.url.clone()));
            }
        }

        if self.resources.cpus == 0 || self.resources.memory_mb == 0 {
            return Err(ConfigError::Invalid(
                "cpus and memory_mb must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Supervisor tunables
// ---------------------------------------------------------------------------

/// Timeouts of the escalating shutdown sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownTimeouts {
    /// How long to wait for `ACK` after `SHUTDOWN`.
    pub ack_timeout_secs: u64,
    /// How long to wait for the guest to halt after an acknowledged `SHUTDOWN`.
    pub halt_timeout_secs: u64,
    /// How long to wait for the guest to halt after the power button.
    pub power_button_timeout_secs: u64,
}

impl Default for ShutdownTimeouts {
    fn default() -> Self {
        Self {
            ack_timeout_secs: 5,
            halt_timeout_secs: 30,
            power_button_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Guest channel port carrying the control protocol.
    pub control_port: u32,
    /// Forwarding channels use `channel_port_base + guest_port`.
    pub channel_port_base: u32,
    pub control_timeout_secs: u64,
    pub startup_poll_interval_secs: u64,
    pub startup_timeout_secs: u64,
    /// Interval of the steady-state probe when the manifest declares no
    /// HTTP endpoint and the control channel is used instead.
    pub health_interval_secs: u64,
    pub max_consecutive_failures: u32,
    pub disk_check_interval_secs: u64,
    pub disk_warning_threshold: f64,
    pub auto_restart: bool,
    pub max_auto_restarts: u32,
    pub restart_delay_secs: u64,
    pub shutdown: ShutdownTimeouts,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            control_port: 1024,
            channel_port_base: 10_000,
            control_timeout_secs: 5,
            startup_poll_interval_secs: 2,
            startup_timeout_secs: 120,
            health_interval_secs: 10,
            max_consecutive_failures: 3,
            disk_check_interval_secs: 60,
            disk_warning_threshold: 0.90,
            auto_restart: true,
            max_auto_restarts: 3,
            restart_delay_secs: 3,
            shutdown: ShutdownTimeouts::default(),
        }
    }
}

impl SupervisorSettings {
    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.control_timeout_secs)
    }

    pub fn startup_poll_interval(&self) -> Duration {
        Duration::from_secs(self.startup_poll_interval_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn disk_check_interval(&self) -> Duration {
        Duration::from_secs(self.disk_check_interval_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.disk_warning_threshold) {
            return Err(ConfigError::Invalid(format!(
                "disk_warning_threshold must be within 0..=1, got {}",
                self.disk_warning_threshold
            )));
        }
        if self.max_consecutive_failures == 0 {
            return Err(ConfigError::Invalid(
                "max_consecutive_failures must be at least 1".to_string(),
            ));
        }
        if self.startup_poll_interval_secs == 0 || self.health_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "probe intervals must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Disks and boot assets
// ---------------------------------------------------------------------------

/// Location of the disk pair and the packaged artifact the root image is
/// derived from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskLayout {
    /// gzip-compressed raw root image shipped with the application.
    pub root_archive: PathBuf,
    /// Replaceable root image, re-derived from `root_archive` when missing.
    pub root_image: PathBuf,
    /// Persistent data image, created once and never overwritten.
    pub data_image: PathBuf,
}

impl DiskLayout {
    /// Place both images in `dir`.
    pub fn in_dir(dir: &Path, root_archive: PathBuf) -> Self {
        Self {
            root_archive,
            root_image: dir.join("root.img"),
            data_image: dir.join("data.img"),
        }
    }
}

/// Kernel and initrd handed to the hypervisor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootAssets {
    pub kernel: PathBuf,
    pub initrd: PathBuf,
    pub root_archive: PathBuf,
    pub cmdline: Option<String>,
}

/// vfkit adapter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VfkitSettings {
    /// TCP port for the vfkit REST management API.
    pub rest_port: u16,
    /// Explicit path to the vfkit binary; `PATH` and Homebrew are searched
    /// when unset.
    pub binary: Option<PathBuf>,
}

impl Default for VfkitSettings {
    fn default() -> Self {
        Self {
            rest_port: 7_654,
            binary: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

/// On-disk configuration file for the CLI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DockhandConfig {
    pub manifest: WorkloadManifest,
    pub supervisor: SupervisorSettings,
    pub boot: BootAssets,
    pub vfkit: VfkitSettings,
    /// Overrides the default `<data>/vms` disk directory.
    pub disk_dir: Option<PathBuf>,
}

impl DockhandConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.manifest.validate()?;
        config.supervisor.validate()?;
        Ok(config)
    }

    /// Resolve file-level settings into the value the supervisor consumes.
    pub fn resolve(&self, paths: &DockhandPaths) -> SupervisorConfig {
        let disk_dir = self.disk_dir.clone().unwrap_or_else(|| paths.vms.clone());
        SupervisorConfig {
            manifest: self.manifest.clone(),
            settings: self.supervisor.clone(),
            disks: DiskLayout::in_dir(&disk_dir, self.boot.root_archive.clone()),
            boot: self.boot.clone(),
            state_file: paths.state_file(),
            serial_log: paths.logs.join("guest-console.log"),
        }
    }
}

/// Everything the supervisor needs, passed once into its constructor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub manifest: WorkloadManifest,
    pub settings: SupervisorSettings,
    pub disks: DiskLayout,
    pub boot: BootAssets,
    /// Persisted `{state, pid, timestamp}` record.
    pub state_file: PathBuf,
    pub serial_log: PathBuf,
}

impl SupervisorConfig {
    /// Interval of the steady-state probe.
    pub fn health_interval(&self) -> Duration {
        self.manifest
            .health
            .as_ref()
            .map(HttpHealthCheck::interval)
            .unwrap_or_else(|| self.settings.health_interval())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.manifest.validate()?;
        self.settings.validate()
    }
}
