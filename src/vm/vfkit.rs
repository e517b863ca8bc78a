//! Hypervisor adapter for vfkit (macOS Virtualization.framework wrapper).
//!
//! ## Architecture
//!
//! ```text
//! create(VmConfig)  → validate paths, resolve vfkit, build argv, socket per channel port
//! start()           → tokio::process::Command → vfkit child
//!                         └─► exit watcher (try_wait every 500 ms) → HypervisorEvent
//! stop / pause / …  → POST /vm/state {"state": "HardStop" | "Stop" | "Pause" | "Resume"}
//! open_channel(p)   → connect to the unix socket vfkit exposes for vsock port p
//! ```
//!
//! On hosts other than macOS, [`VfkitHypervisor::host_support`] reports the
//! host as unsupported and `create` fails.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{ChannelOpener, GuestStream, Hypervisor, HypervisorEvent, VmConfig};
use crate::config::VfkitSettings;

const DEFAULT_CMDLINE: &str = "console=hvc0 root=/dev/vda rw";
const EXIT_POLL: Duration = Duration::from_millis(500);
const REST_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything `start` needs, captured by `create`.
struct Prepared {
    argv: Vec<String>,
    events: mpsc::UnboundedSender<HypervisorEvent>,
}

pub struct VfkitHypervisor {
    settings: VfkitSettings,
    socket_dir: PathBuf,
    http: reqwest::Client,
    prepared: std::sync::Mutex<Option<Prepared>>,
    sockets: std::sync::RwLock<HashMap<u32, PathBuf>>,
    child: Arc<RwLock<Option<Child>>>,
    watcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl VfkitHypervisor {
    pub fn new(settings: VfkitSettings, socket_dir: PathBuf) -> Self {
        Self {
            settings,
            socket_dir,
            http: reqwest::Client::new(),
            prepared: std::sync::Mutex::new(None),
            sockets: std::sync::RwLock::new(HashMap::new()),
            child: Arc::new(RwLock::new(None)),
            watcher: std::sync::Mutex::new(None),
        }
    }

    fn socket_path(&self, port: u32) -> PathBuf {
        self.socket_dir.join(format!("vsock-{port}.sock"))
    }

    fn rest_url(&self) -> String {
        format!("http://127.0.0.1:{}/vm/state", self.settings.rest_port)
    }

    async fn set_state(&self, state: &str) -> anyhow::Result<()> {
        let resp = self
            .http
            .post(self.rest_url())
            .json(&serde_json::json!({ "state": state }))
            .timeout(REST_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("vfkit REST request {state}"))?;

        let status = resp.status();
        if !status.is_success() {
            bail!("vfkit rejected {state}: HTTP {}", status.as_u16());
        }
        debug!(port = self.settings.rest_port, state, "vfkit state change accepted");
        Ok(())
    }

    async fn kill_child(&self) {
        if let Some(child) = self.child.write().await.as_mut() {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill vfkit process");
            }
        }
    }
}

#[async_trait]
impl ChannelOpener for VfkitHypervisor {
    async fn open_channel(&self, port: u32) -> std::io::Result<GuestStream> {
        let path = self
            .sockets
            .read()
            .map_err(|_| std::io::Error::other("socket table poisoned"))?
            .get(&port)
            .cloned()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no guest channel configured for port {port}"),
                )
            })?;
        connect_socket(&path).await
    }
}

#[cfg(unix)]
async fn connect_socket(path: &Path) -> std::io::Result<GuestStream> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    Ok(Box::new(stream))
}

#[cfg(not(unix))]
async fn connect_socket(_path: &Path) -> std::io::Result<GuestStream> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "guest channels require unix sockets",
    ))
}

#[async_trait]
impl Hypervisor for VfkitHypervisor {
    fn host_support(&self) -> Result<(), String> {
        if cfg!(target_os = "macos") {
            Ok(())
        } else {
            Err("guests require macOS (Virtualization.framework via vfkit)".to_string())
        }
    }

    async fn create(
        &self,
        config: &VmConfig,
        events: mpsc::UnboundedSender<HypervisorEvent>,
    ) -> anyhow::Result<()> {
        self.host_support().map_err(|reason| anyhow!(reason))?;

        for (what, path) in [
            ("kernel", &config.kernel_path),
            ("initrd", &config.initrd_path),
            ("root disk", &config.root_disk),
            ("data disk", &config.data_disk),
        ] {
            if !path.exists() {
                bail!("{what} does not exist: {}", path.display());
            }
        }

        let vfkit = match &self.settings.binary {
            Some(binary) => binary.clone(),
            None => find_vfkit()?,
        };
        info!(path = %vfkit.display(), "found vfkit binary");

        std::fs::create_dir_all(&self.socket_dir)
            .with_context(|| format!("create {}", self.socket_dir.display()))?;

        let sockets: HashMap<u32, PathBuf> = config
            .channel_ports
            .iter()
            .map(|&port| (port, self.socket_path(port)))
            .collect();
        for path in sockets.values() {
            // vfkit refuses to listen on a stale socket left by a crashed run.
            let _ = std::fs::remove_file(path);
        }

        let mut argv = vec![vfkit.display().to_string()];
        argv.extend(vfkit_args(config, self.settings.rest_port, &sockets));

        *self
            .sockets
            .write()
            .map_err(|_| anyhow!("socket table poisoned"))? = sockets;
        *self
            .prepared
            .lock()
            .map_err(|_| anyhow!("vfkit session lock poisoned"))? = Some(Prepared { argv, events });
        Ok(())
    }

    async fn start(&self) -> anyhow::Result<()> {
        let prepared = self
            .prepared
            .lock()
            .map_err(|_| anyhow!("vfkit session lock poisoned"))?
            .take()
            .context("start called before create")?;

        let (program, args) = prepared
            .argv
            .split_first()
            .context("empty vfkit command line")?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        let child = cmd.spawn().context("failed to spawn vfkit process")?;
        info!(pid = ?child.id(), rest_port = self.settings.rest_port, "vfkit started");
        *self.child.write().await = Some(child);

        let watcher = tokio::spawn(watch_exit(Arc::clone(&self.child), prepared.events));
        if let Some(old) = self
            .watcher
            .lock()
            .map_err(|_| anyhow!("vfkit watcher lock poisoned"))?
            .replace(watcher)
        {
            old.abort();
        }
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        if let Err(e) = self.set_state("HardStop").await {
            warn!(error = %e, "REST hard stop failed; killing vfkit process");
            self.kill_child().await;
        }

        let deadline = tokio::time::Instant::now() + REST_TIMEOUT;
        loop {
            {
                let mut guard = self.child.write().await;
                match guard.as_mut().map(Child::try_wait) {
                    None | Some(Ok(Some(_))) => return Ok(()),
                    Some(Ok(None)) => {}
                    Some(Err(e)) => return Err(e).context("wait for vfkit exit"),
                }
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("vfkit did not exit after hard stop; killing");
                self.kill_child().await;
                return Ok(());
            }
            tokio::time::sleep(EXIT_POLL).await;
        }
    }

    async fn request_graceful_stop(&self) -> anyhow::Result<()> {
        self.set_state("Stop").await
    }

    async fn pause(&self) -> anyhow::Result<()> {
        self.set_state("Pause").await
    }

    async fn resume(&self) -> anyhow::Result<()> {
        self.set_state("Resume").await
    }
}

impl Drop for VfkitHypervisor {
    fn drop(&mut self) {
        if let Ok(mut watcher) = self.watcher.lock() {
            if let Some(watcher) = watcher.take() {
                watcher.abort();
            }
        }
    }
}

/// Poll the child every 500 ms and report its exit exactly once.
async fn watch_exit(child: Arc<RwLock<Option<Child>>>, events: mpsc::UnboundedSender<HypervisorEvent>) {
    loop {
        tokio::time::sleep(EXIT_POLL).await;

        let mut guard = child.write().await;
        let Some(vfkit) = guard.as_mut() else {
            return;
        };
        match vfkit.try_wait() {
            Ok(Some(status)) if status.success() => {
                info!(exit_status = ?status, "vfkit exited");
                *guard = None;
                let _ = events.send(HypervisorEvent::Halted);
                return;
            }
            Ok(Some(status)) => {
                warn!(exit_status = ?status, "vfkit exited with failure");
                *guard = None;
                let _ = events.send(HypervisorEvent::Errored(format!("vfkit exited: {status}")));
                return;
            }
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, "try_wait on vfkit failed");
            }
        }
    }
}

/// Resolve the `vfkit` binary from `PATH` or the Homebrew prefixes.
fn find_vfkit() -> anyhow::Result<PathBuf> {
    if let Ok(path_var) = std::env::var("PATH") {
        for dir in path_var.split(':') {
            let candidate = PathBuf::from(dir).join("vfkit");
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }

    for path in ["/opt/homebrew/bin/vfkit", "/usr/local/bin/vfkit"] {
        if Path::new(path).exists() {
            return Ok(PathBuf::from(path));
        }
    }

    bail!(
        "vfkit binary not found. Install it with: brew install vfkit\n\
         Or set vfkit.binary in the dockhand config."
    )
}

/// Command-line arguments for one guest.
fn vfkit_args(config: &VmConfig, rest_port: u16, sockets: &HashMap<u32, PathBuf>) -> Vec<String> {
    let cmdline = config.cmdline.as_deref().unwrap_or(DEFAULT_CMDLINE);
    let mut args = vec![
        "--bootloader".to_string(),
        format!(
            "linux,kernel={},initrd={},cmdline=\"{cmdline}\"",
            config.kernel_path.display(),
            config.initrd_path.display()
        ),
        "--cpus".to_string(),
        config.cpu_count.to_string(),
        "--memory".to_string(),
        config.memory_mb.to_string(),
        "--device".to_string(),
        format!("virtio-blk,path={}", config.root_disk.display()),
        "--device".to_string(),
        format!("virtio-blk,path={}", config.data_disk.display()),
        "--device".to_string(),
        format!("virtio-serial,logFilePath={}", config.serial_log_path.display()),
        "--device".to_string(),
        "virtio-rng".to_string(),
        "--restful-uri".to_string(),
        format!("tcp://127.0.0.1:{rest_port}"),
    ];

    let mut ports: Vec<_> = sockets.iter().collect();
    ports.sort_by_key(|(port, _)| **port);
    for (port, path) in ports {
        args.push("--device".to_string());
        args.push(format!(
            "virtio-vsock,port={port},socketURL={},listen",
            path.display()
        ));
    }
    args
}
