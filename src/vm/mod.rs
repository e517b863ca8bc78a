//! VM management module for dockhand.
//!
//! Provides the hypervisor abstraction, the guest control channel, the TCP
//! port forwarder, health monitoring, disk provisioning and the lifecycle
//! supervisor that wires them together.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

pub mod bridge;
pub mod control;
pub mod disks;
pub mod forwarder;
pub mod health;
pub mod host;
pub mod lifecycle;
pub mod persist;
pub mod shutdown;
pub mod vfkit;

// ---------------------------------------------------------------------------
// Shared types used across submodules
// ---------------------------------------------------------------------------

/// Top-level configuration handed to [`Hypervisor::create`].
///
/// All paths must exist on disk before calling `create`.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Path to the Linux kernel image (e.g. `vmlinuz`).
    pub kernel_path: PathBuf,

    /// Path to the initial ramdisk image (e.g. `initrd.img`).
    pub initrd_path: PathBuf,

    /// Kernel command line; adapters supply a default when `None`.
    pub cmdline: Option<String>,

    /// Replaceable root image (see [`disks::ensure_root_image`]).
    pub root_disk: PathBuf,

    /// Persistent data image.
    pub data_disk: PathBuf,

    /// Path where the hypervisor writes the guest serial console output.
    pub serial_log_path: PathBuf,

    /// Number of virtual CPUs to give the VM.
    pub cpu_count: u32,

    /// Memory allocation in megabytes.
    pub memory_mb: u64,

    /// Guest channel ports the host will open connections to: the control
    /// port plus one per port mapping.
    pub channel_ports: Vec<u32>,
}

/// A bidirectional, ordered, reliable byte stream into the guest.
pub trait GuestIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> GuestIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// An open guest channel. Dropping it closes both directions.
pub type GuestStream = Box<dyn GuestIo>;

/// Asynchronous notifications from the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HypervisorEvent {
    /// The guest stopped running (clean power-off or process exit).
    Halted,
    /// The hypervisor reported a failure for the running guest.
    Errored(String),
}

/// Anything that can open guest channels by port number.
#[async_trait]
pub trait ChannelOpener: Send + Sync {
    async fn open_channel(&self, port: u32) -> std::io::Result<GuestStream>;
}

/// The hypervisor collaborator.
///
/// Implementations deliver [`HypervisorEvent`]s on the sender passed to
/// [`Hypervisor::create`]; they may send from any task or thread.
#[async_trait]
pub trait Hypervisor: ChannelOpener {
    /// `Err` with a human-readable reason when this host cannot run guests.
    fn host_support(&self) -> Result<(), String>;

    async fn create(
        &self,
        config: &VmConfig,
        events: mpsc::UnboundedSender<HypervisorEvent>,
    ) -> anyhow::Result<()>;

    async fn start(&self) -> anyhow::Result<()>;

    /// Force-terminate the guest.
    async fn stop(&self) -> anyhow::Result<()>;

    /// Press the virtual power button.
    async fn request_graceful_stop(&self) -> anyhow::Result<()>;

    async fn pause(&self) -> anyhow::Result<()>;

    async fn resume(&self) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use control::{ControlClient, ControlCommand, ControlResponse};
pub use forwarder::PortForwarder;
pub use lifecycle::{Supervisor, SupervisorEvent};
