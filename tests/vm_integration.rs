//! Integration tests that boot a real guest through vfkit.
//!
//! They need macOS, vfkit on `PATH`, and a guest image whose agent speaks the
//! control protocol, so they are gated behind the `vm-integration-tests`
//! feature flag.
//!
//! # Running
//!
//! ```bash
//! DOCKHAND_TEST_KERNEL=/path/vmlinuz \
//! DOCKHAND_TEST_INITRD=/path/initrd.img \
//! DOCKHAND_TEST_ROOT_ARCHIVE=/path/root.img.gz \
//! cargo test --features vm-integration-tests --test vm_integration
//! ```
//!
//! The guest workload is expected to serve HTTP on guest port 80.

#![cfg(all(feature = "vm-integration-tests", target_os = "macos"))]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use dockhand::config::{
    BootAssets, DiskLayout, PortMapping, ResourceSizing, SupervisorConfig, SupervisorSettings,
    VfkitSettings, WorkloadManifest,
};
use dockhand::state_machine::VmState;
use dockhand::vm::Supervisor;
use dockhand::vm::vfkit::VfkitHypervisor;

// ---------------------------------------------------------------------------
// Environment variable helpers
// ---------------------------------------------------------------------------

fn env_path(name: &str) -> Result<PathBuf> {
    std::env::var(name)
        .map(PathBuf::from)
        .with_context(|| format!("{name} must point at a test boot asset"))
}

/// Host port forwarded to the guest's port 80.
fn test_host_port() -> u16 {
    std::env::var("DOCKHAND_TEST_HOST_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(18_080)
}

/// Port for the vfkit REST management API used by the test VM.
fn test_rest_port() -> u16 {
    std::env::var("DOCKHAND_TEST_REST_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(7_799)
}

// ---------------------------------------------------------------------------
// Test VM helper
// ---------------------------------------------------------------------------

/// A supervisor over a real vfkit guest in a scratch directory. The guest is
/// destroyed on drop if a test panics before stopping it.
struct TestVm {
    _dir: tempfile::TempDir,
    supervisor: Supervisor,
}

impl TestVm {
    fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let root_archive = env_path("DOCKHAND_TEST_ROOT_ARCHIVE")?;

        let config = SupervisorConfig {
            manifest: WorkloadManifest {
                name: "integration".to_string(),
                ports: vec![PortMapping::new(test_host_port(), 80)],
                resources: ResourceSizing {
                    data_disk_mb: 512,
                    ..ResourceSizing::default()
                },
                health: None,
            },
            settings: SupervisorSettings::default(),
            disks: DiskLayout::in_dir(&dir.path().join("vms"), root_archive.clone()),
            boot: BootAssets {
                kernel: env_path("DOCKHAND_TEST_KERNEL")?,
                initrd: env_path("DOCKHAND_TEST_INITRD")?,
                root_archive,
                cmdline: None,
            },
            state_file: dir.path().join("session.json"),
            serial_log: dir.path().join("console.log"),
        };

        let hypervisor = Arc::new(VfkitHypervisor::new(
            VfkitSettings {
                rest_port: test_rest_port(),
                binary: None,
            },
            dir.path().join("sockets"),
        ));
        let supervisor = Supervisor::new(config, hypervisor)?;
        Ok(Self {
            _dir: dir,
            supervisor,
        })
    }
}

impl Drop for TestVm {
    fn drop(&mut self) {
        let supervisor = self.supervisor.clone();
        if supervisor.state() != VmState::Stopped {
            let handle = tokio::runtime::Handle::current();
            let _ = std::thread::spawn(move || {
                handle.block_on(async move {
                    let _ = timeout(Duration::from_secs(60), supervisor.stop()).await;
                })
            })
            .join();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn boots_forwards_and_stops() -> Result<()> {
    let vm = TestVm::new()?;

    timeout(Duration::from_secs(180), vm.supervisor.start())
        .await
        .context("start timed out")??;
    assert_eq!(vm.supervisor.state(), VmState::Running);

    let mut stream = TcpStream::connect(("127.0.0.1", test_host_port())).await?;
    stream
        .write_all(b"GET / HTTP/1.0\r\nHost: localhost\r\n\r\n")
        .await?;
    let mut response = Vec::new();
    timeout(Duration::from_secs(10), stream.read_to_end(&mut response)).await??;
    assert!(response.starts_with(b"HTTP/"));

    assert!(vm.supervisor.guest_logs(20).await.is_some());

    timeout(Duration::from_secs(60), vm.supervisor.stop())
        .await
        .context("stop timed out")??;
    assert_eq!(vm.supervisor.state(), VmState::Stopped);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn survives_suspend_and_resume() -> Result<()> {
    let vm = TestVm::new()?;
    timeout(Duration::from_secs(180), vm.supervisor.start()).await??;

    vm.supervisor.suspend().await?;
    assert_eq!(vm.supervisor.state(), VmState::Paused);
    vm.supervisor.resume().await?;
    assert_eq!(vm.supervisor.state(), VmState::Running);

    let snapshot = vm.supervisor.snapshot().await?;
    assert_eq!(snapshot.connection_rebuilds, 1);

    vm.supervisor.destroy().await?;
    assert_eq!(vm.supervisor.state(), VmState::Stopped);
    Ok(())
}
