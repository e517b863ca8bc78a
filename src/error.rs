//! Error taxonomy for the supervisor.
//!
//! Every failure the supervisor can surface falls into one of four classes
//! (see [`ErrorCategory`]). Only host/environment errors carry remediation
//! guidance; the rest are reported as the reason attached to the `Error`
//! lifecycle state.

use std::time::Duration;

use thiserror::Error;

/// How a failure is handled by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Detected before start, surfaced with guidance, never auto-retried.
    HostEnvironment,
    /// Absorbed locally and retried on the next tick.
    TransientGuest,
    /// Drives bounded auto-restart; surfaced once the budget is exhausted.
    SustainedGuest,
    /// Requires manual action.
    Fatal,
}

/// Errors returned from the public supervisor entry points.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("insufficient host resources: {0}")]
    InsufficientResources(String),

    #[error("unsupported host: {0}")]
    UnsupportedHost(String),

    #[error("host port {port} is already in use by another process")]
    PortInUse { port: u16 },

    #[error("forwarding setup failed for port {port}")]
    ForwardingRejected { port: u16 },

    #[error("cannot listen on host port {port}: {reason}")]
    Listen { port: u16, reason: String },

    #[error("session is owned by running process {pid}")]
    SessionOwned { pid: u32 },

    #[error("disk provisioning failed: {0}")]
    Provisioning(String),

    #[error("hypervisor failed to boot the guest: {0}")]
    Boot(String),

    #[error("guest did not report healthy within {}s", .0.as_secs())]
    StartupTimeout(Duration),

    #[error("the auto-restart budget is exhausted")]
    RestartBudgetExhausted,

    #[error("failed to {action} the guest: {reason}")]
    SuspendResume { action: &'static str, reason: String },

    #[error("shutdown failed: {0}")]
    Shutdown(String),

    #[error("start was cancelled by a stop request")]
    Cancelled,

    #[error("cannot {action} while {state}")]
    InvalidState { action: &'static str, state: String },

    #[error("failed to remove session files: {0}")]
    Destroy(String),

    #[error("supervisor task is no longer running")]
    SupervisorGone,
}

impl SupervisorError {
    /// Taxonomy class of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InsufficientResources(_)
            | Self::UnsupportedHost(_)
            | Self::PortInUse { .. }
            | Self::Listen { .. }
            | Self::SessionOwned { .. }
            | Self::Provisioning(_) => ErrorCategory::HostEnvironment,
            Self::ForwardingRejected { .. } | Self::StartupTimeout(_) | Self::Boot(_) => {
                ErrorCategory::TransientGuest
            }
            Self::RestartBudgetExhausted | Self::Shutdown(_) => ErrorCategory::SustainedGuest,
            Self::SuspendResume { .. }
            | Self::Cancelled
            | Self::InvalidState { .. }
            | Self::Destroy(_)
            | Self::SupervisorGone => ErrorCategory::Fatal,
        }
    }

    /// Guidance shown next to host/environment errors.
    pub fn remediation(&self) -> Option<String> {
        match self {
            Self::InsufficientResources(_) => Some(
                "Close other applications or lower the cpu/memory sizing in the workload manifest."
                    .to_string(),
            ),
            Self::UnsupportedHost(_) => Some(
                "A host with hardware virtualization support (macOS 13+ with vfkit) is required."
                    .to_string(),
            ),
            Self::PortInUse { port } => Some(format!(
                "Stop the process listening on port {port} or change the host port mapping."
            )),
            Self::Listen { port, .. } => Some(format!(
                "Check that this user may bind 127.0.0.1:{port} or change the host port mapping."
            )),
            Self::SessionOwned { pid } => Some(format!(
                "Stop the dockhand process with pid {pid} before starting or destroying this session."
            )),
            Self::Provisioning(_) => Some(
                "Check free disk space and that the packaged root image is intact.".to_string(),
            ),
            _ => None,
        }
    }
}

/// Errors raised while validating a loaded configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("workload manifest declares no port mappings")]
    NoPortMappings,

    #[error("port mapping {host_port}->{guest_port} uses port 0")]
    ZeroPort { host_port: u16, guest_port: u16 },

    #[error("host port {0} is mapped more than once")]
    DuplicateHostPort(u16),

    #[error("health check url is invalid: {0}")]
    InvalidHealthUrl(String),

    #[error("{0}")]
    Invalid(String),
}
