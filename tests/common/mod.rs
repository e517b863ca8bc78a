//! In-process stand-ins for the hypervisor and the guest agent.
//!
//! `FakeHypervisor` implements the `Hypervisor` seam entirely in memory:
//! every guest channel is a `tokio::io::duplex` pair whose far end is served
//! by a scripted guest. The control port answers the line protocol according
//! to a [`GuestScript`]; forwarding ports echo whatever they receive once the
//! guest has acknowledged `FORWARD` for them.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;

use dockhand::config::{
    BootAssets, DiskLayout, PortMapping, ResourceSizing, SupervisorConfig, SupervisorSettings,
    WorkloadManifest,
};
use dockhand::vm::{ChannelOpener, GuestStream, Hypervisor, HypervisorEvent, VmConfig};

pub const CONTROL_PORT: u32 = 1024;
pub const CHANNEL_BASE: u32 = 10_000;

const CHANNEL_BUFFER: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Script
// ---------------------------------------------------------------------------

/// How the fake guest answers.
#[derive(Debug, Clone)]
pub struct GuestScript {
    /// Answers to successive `HEALTH` calls (`true` = `OK`).
    pub health: VecDeque<bool>,
    /// Answer once `health` is exhausted.
    pub health_default: bool,
    /// Guest ports whose `FORWARD` is answered with `ERR`.
    pub rejected_guest_ports: HashMap<u16, String>,
    pub ack_shutdown: bool,
    pub halt_on_shutdown: bool,
    pub halt_on_power_button: bool,
    /// Read commands but never answer.
    pub silent: bool,
    pub disk: (u64, u64),
    pub logs: String,
    pub host_unsupported: Option<String>,
    pub fail_start: bool,
}

impl Default for GuestScript {
    fn default() -> Self {
        Self {
            health: VecDeque::new(),
            health_default: true,
            rejected_guest_ports: HashMap::new(),
            ack_shutdown: true,
            halt_on_shutdown: true,
            halt_on_power_button: true,
            silent: false,
            disk: (100, 1000),
            logs: String::new(),
            host_unsupported: None,
            fail_start: false,
        }
    }
}

impl GuestScript {
    pub fn with_health(mut self, answers: &[bool]) -> Self {
        self.health = answers.iter().copied().collect();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Create,
    Start,
    Stop,
    PowerButton,
    Pause,
    Resume,
}

// ---------------------------------------------------------------------------
// Fake hypervisor
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Guest {
    script: Mutex<GuestScript>,
    calls: Mutex<Vec<Call>>,
    commands: Mutex<Vec<String>>,
    events: Mutex<Option<mpsc::UnboundedSender<HypervisorEvent>>>,
    vm: Mutex<Option<VmConfig>>,
    forwarding: Mutex<HashSet<u32>>,
    running: AtomicBool,
    opened: AtomicUsize,
    live: Arc<AtomicUsize>,
}

impl Guest {
    fn halt(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            if let Some(events) = self.events.lock().unwrap().as_ref() {
                let _ = events.send(HypervisorEvent::Halted);
            }
        }
    }

    /// The response to `line`, and whether to halt after sending it.
    fn answer(&self, line: &str) -> (Option<String>, bool) {
        let mut script = self.script.lock().unwrap();
        if script.silent {
            return (None, false);
        }

        if line == "HEALTH" {
            let healthy = script.health.pop_front().unwrap_or(script.health_default);
            let reply = if healthy { "OK\n" } else { "FAIL:workload not ready\n" };
            return (Some(reply.to_string()), false);
        }
        if line == "DISK" {
            let (used, total) = script.disk;
            return (Some(format!("DISK:{used}/{total}\n")), false);
        }
        if line.starts_with("LOGS:") {
            return (
                Some(format!("LOGS:{}\n{}", script.logs.len(), script.logs)),
                false,
            );
        }
        if line == "SHUTDOWN" {
            if !script.ack_shutdown {
                return (None, false);
            }
            return (Some("ACK\n".to_string()), script.halt_on_shutdown);
        }
        if line == "FORWARD-STOP" {
            self.forwarding.lock().unwrap().clear();
            return (Some("ACK\n".to_string()), false);
        }
        if let Some(args) = line.strip_prefix("FORWARD:") {
            let Some((channel, guest)) = args.split_once(':') else {
                return (Some("ERR:malformed\n".to_string()), false);
            };
            let (Ok(channel), Ok(guest)) = (channel.parse::<u32>(), guest.parse::<u16>()) else {
                return (Some("ERR:malformed\n".to_string()), false);
            };
            if let Some(reason) = script.rejected_guest_ports.get(&guest) {
                return (Some(format!("ERR:{reason}\n")), false);
            }
            self.forwarding.lock().unwrap().insert(channel);
            return (Some("ACK\n".to_string()), false);
        }
        (Some("ERR:unknown command\n".to_string()), false)
    }
}

/// Counts a guest-side channel end as open until dropped.
struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeHypervisor {
    guest: Arc<Guest>,
}

impl FakeHypervisor {
    pub fn new(script: GuestScript) -> Arc<Self> {
        let hv = Self::default();
        *hv.guest.script.lock().unwrap() = script;
        Arc::new(hv)
    }

    /// Mark the guest as running without going through `create`/`start`.
    pub fn power_on(&self) {
        self.guest.running.store(true, Ordering::SeqCst);
    }

    /// Simulate the guest dying on its own.
    pub fn crash(&self) {
        self.guest.halt();
    }

    pub fn script(&self, edit: impl FnOnce(&mut GuestScript)) {
        edit(&mut self.guest.script.lock().unwrap());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.guest.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: Call) -> usize {
        self.calls().iter().filter(|c| **c == call).count()
    }

    /// Control commands received, in order.
    pub fn commands(&self) -> Vec<String> {
        self.guest.commands.lock().unwrap().clone()
    }

    pub fn last_vm(&self) -> Option<VmConfig> {
        self.guest.vm.lock().unwrap().clone()
    }

    pub fn channels_opened(&self) -> usize {
        self.guest.opened.load(Ordering::SeqCst)
    }

    /// Guest-side channel ends that are still open.
    pub fn channels_live(&self) -> usize {
        self.guest.live.load(Ordering::SeqCst)
    }

    fn record(&self, call: Call) {
        self.guest.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ChannelOpener for FakeHypervisor {
    async fn open_channel(&self, port: u32) -> std::io::Result<GuestStream> {
        if !self.guest.running.load(Ordering::SeqCst) {
            return Err(std::io::ErrorKind::ConnectionRefused.into());
        }

        let (host, guest_end) = tokio::io::duplex(CHANNEL_BUFFER);
        let live = LiveGuard::new(&self.guest.live);
        if port == CONTROL_PORT {
            tokio::spawn(serve_control(Arc::clone(&self.guest), guest_end, live));
        } else if self.guest.forwarding.lock().unwrap().contains(&port) {
            tokio::spawn(serve_echo(guest_end, live));
        } else {
            return Err(std::io::ErrorKind::ConnectionRefused.into());
        }
        self.guest.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(host))
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    fn host_support(&self) -> Result<(), String> {
        match &self.guest.script.lock().unwrap().host_unsupported {
            Some(reason) => Err(reason.clone()),
            None => Ok(()),
        }
    }

    async fn create(
        &self,
        config: &VmConfig,
        events: mpsc::UnboundedSender<HypervisorEvent>,
    ) -> anyhow::Result<()> {
        self.record(Call::Create);
        *self.guest.vm.lock().unwrap() = Some(config.clone());
        *self.guest.events.lock().unwrap() = Some(events);
        Ok(())
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.record(Call::Start);
        if self.guest.script.lock().unwrap().fail_start {
            anyhow::bail!("virtual machine failed to start");
        }
        self.guest.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.record(Call::Stop);
        self.guest.halt();
        Ok(())
    }

    async fn request_graceful_stop(&self) -> anyhow::Result<()> {
        self.record(Call::PowerButton);
        if self.guest.script.lock().unwrap().halt_on_power_button {
            self.guest.halt();
        }
        Ok(())
    }

    async fn pause(&self) -> anyhow::Result<()> {
        self.record(Call::Pause);
        Ok(())
    }

    async fn resume(&self) -> anyhow::Result<()> {
        self.record(Call::Resume);
        Ok(())
    }
}

async fn serve_control(guest: Arc<Guest>, stream: DuplexStream, _live: LiveGuard) {
    let (read, mut write) = tokio::io::split(stream);
    let mut reader = BufReader::new(read);

    let mut line = String::new();
    if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
        return;
    }
    let line = line.trim_end().to_string();
    guest.commands.lock().unwrap().push(line.clone());

    let (reply, halt) = guest.answer(&line);
    if let Some(reply) = reply {
        let _ = write.write_all(reply.as_bytes()).await;
        let _ = write.flush().await;
    }
    if halt {
        guest.halt();
    }

    // Hold the channel until the host side closes it.
    let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
}

async fn serve_echo(stream: DuplexStream, _live: LiveGuard) {
    let (mut read, mut write) = tokio::io::split(stream);
    let _ = tokio::io::copy(&mut read, &mut write).await;
    let _ = write.shutdown().await;
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// A supervisor config rooted in a temp dir with a tiny gzip root archive.
pub struct Fixture {
    pub dir: TempDir,
    pub config: SupervisorConfig,
}

impl Fixture {
    pub fn new(ports: Vec<PortMapping>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("root.img.gz");
        write_gz(&archive, b"root image");

        let resources = ResourceSizing {
            cpus: 1,
            memory_mb: 1,
            data_disk_mb: 1,
            min_cpus: 1,
            min_memory_mb: 0,
        };
        let config = SupervisorConfig {
            manifest: WorkloadManifest {
                name: "test".to_string(),
                ports,
                resources,
                health: None,
            },
            settings: SupervisorSettings::default(),
            disks: DiskLayout::in_dir(&dir.path().join("vms"), archive.clone()),
            boot: BootAssets {
                kernel: dir.path().join("vmlinuz"),
                initrd: dir.path().join("initrd.img"),
                root_archive: archive,
                cmdline: None,
            },
            state_file: dir.path().join("session.json"),
            serial_log: dir.path().join("console.log"),
        };
        Self { dir, config }
    }

    /// Probes far apart so they stay quiet unless a test waits for them.
    pub fn quiet_probes(mut self) -> Self {
        self.config.settings.health_interval_secs = 3600;
        self.config.settings.disk_check_interval_secs = 3600;
        self
    }
}

pub fn write_gz(path: &Path, contents: &[u8]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(contents).unwrap();
    std::fs::write(path, encoder.finish().unwrap()).unwrap();
}

/// A loopback port that was free a moment ago.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Poll `cond` until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
