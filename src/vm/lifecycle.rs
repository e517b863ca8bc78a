//! VM lifecycle supervisor.
//!
//! ## Architecture
//!
//! ```text
//! Supervisor (handle, Clone) ──Command + oneshot──►┐
//! hypervisor relay ──HypervisorEvent──────────────►│ inbox ──► Actor (single task)
//! health probes ──HealthSignal────────────────────►│             ├─► SessionController (state)
//! spawned steps ──StepResult──────────────────────►┘             ├─► PortForwarder
//!                                                                ├─► HealthMonitor
//!                                                                └─► persist writer
//! ```
//!
//! The actor task is the only place lifecycle state changes. Everything that
//! does I/O (host checks, disk provisioning, booting, shutdown escalation,
//! forwarding setup) runs as a spawned *step* whose result is sent back to the
//! inbox. Steps carry a sequence number and session-scoped events carry a
//! generation number, so results from cancelled work are discarded.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::control::DiskUsage;
use super::disks;
use super::forwarder::{self, ForwardError};
use super::health::{self, ControlCheck, HealthCheck, HealthMonitor, HealthSignal, HttpCheck, SignalSink};
use super::host::{self, HostResources};
use super::persist::{SessionRecord, StateStore};
use super::shutdown::{self, ShutdownAction, ShutdownStep, ShutdownTarget};
use super::{ChannelOpener, ControlClient, Hypervisor, HypervisorEvent, PortForwarder, VmConfig};
use crate::config::{DiskLayout, PortMapping, ResourceSizing, SupervisorConfig};
use crate::error::{ConfigError, SupervisorError};
use crate::state_machine::{SessionController, StateChange, VmState};

/// Capacity of the output event stream; slow subscribers lose the oldest
/// events.
const EVENT_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Events published to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    StateChanged(StateChange),
    DiskWarning { used_mb: u64, total_mb: u64 },
    /// Non-fatal host validation finding.
    HostWarning(String),
    /// Live connections were dropped after a resume; listeners stayed bound.
    ConnectionsRebuilt { cancelled: usize },
}

/// Current phase plus the reason when the phase is `Error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorStatus {
    pub state: VmState,
    pub reason: Option<String>,
}

impl Default for SupervisorStatus {
    fn default() -> Self {
        Self {
            state: VmState::Stopped,
            reason: None,
        }
    }
}

/// Point-in-time view of the supervisor internals.
#[derive(Debug, Clone)]
pub struct SupervisorSnapshot {
    pub state: VmState,
    pub reason: Option<String>,
    /// Host addresses currently forwarded into the guest.
    pub forwarding: Vec<SocketAddr>,
    pub live_bridges: usize,
    pub active_probes: usize,
    pub connection_rebuilds: usize,
    pub restart_count: u32,
    pub auto_restart: bool,
}

// ---------------------------------------------------------------------------
// Inbox
// ---------------------------------------------------------------------------

type Reply = oneshot::Sender<Result<(), SupervisorError>>;

enum Command {
    Start(Reply),
    Stop(Reply),
    Restart(Reply),
    Destroy(Reply),
    Suspend(Reply),
    Resume(Reply),
    GuestLogs(u32, oneshot::Sender<Option<String>>),
    Inspect(oneshot::Sender<SupervisorSnapshot>),
}

enum Event {
    Command(Command),
    Hypervisor { generation: u64, event: HypervisorEvent },
    Health { generation: u64, signal: HealthSignal },
    Step { seq: u64, result: StepResult },
}

struct Validation {
    warnings: Vec<String>,
    first_launch: bool,
}

enum StepResult {
    Validated(Result<Validation, SupervisorError>),
    Provisioned(Result<(), SupervisorError>),
    Booted(Result<(), SupervisorError>),
    Forwarding(Result<PortForwarder, ForwardError>),
    Stopped(Result<ShutdownAction, String>),
    TornDown,
    RestartDelayElapsed,
    Paused(Result<(), String>),
    Resumed(Result<(), String>),
    Destroyed(Result<(), String>),
}

/// What to do once the session reaches `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterStop {
    Nothing,
    Start,
    Destroy,
}

impl AfterStop {
    fn merge(self, newer: AfterStop) -> AfterStop {
        if self == AfterStop::Destroy || newer == AfterStop::Destroy {
            AfterStop::Destroy
        } else {
            newer
        }
    }
}

/// The lifecycle operation in flight, if any.
enum Op {
    Idle,
    Starting,
    Stopping(AfterStop),
    FailingStart { error: SupervisorError, then: AfterStop },
    RestartDelay,
    Pausing(Reply),
    Resuming(Reply),
    Destroying,
}

impl Op {
    fn name(&self) -> &'static str {
        match self {
            Op::Idle => "idle",
            Op::Starting => "starting",
            Op::Stopping(_) => "stopping",
            Op::FailingStart { .. } => "cleaning up a failed start",
            Op::RestartDelay => "waiting to restart",
            Op::Pausing(_) => "pausing",
            Op::Resuming(_) => "resuming",
            Op::Destroying => "destroying",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum StopPlan {
    Escalate,
    ForceOnly,
}

enum PersistOp {
    Save(SessionRecord),
    Clear,
    Flush(oneshot::Sender<()>),
}

// ---------------------------------------------------------------------------
// Supervisor handle
// ---------------------------------------------------------------------------

/// Handle to the supervisor task. Cheap to clone; the task ends once every
/// handle is dropped and no work is outstanding.
#[derive(Clone)]
pub struct Supervisor {
    inbox: mpsc::UnboundedSender<Event>,
    status: watch::Receiver<SupervisorStatus>,
    outputs: broadcast::Sender<SupervisorEvent>,
}

impl Supervisor {
    /// Validate `config` and spawn the supervisor task. Must be called from
    /// within a tokio runtime.
    pub fn new<H>(config: SupervisorConfig, hypervisor: Arc<H>) -> Result<Self, ConfigError>
    where
        H: Hypervisor + 'static,
    {
        config.validate()?;

        let opener: Arc<dyn ChannelOpener> = hypervisor.clone();
        let hypervisor: Arc<dyn Hypervisor> = hypervisor;
        let control = ControlClient::new(
            Arc::clone(&opener),
            config.settings.control_port,
            config.settings.control_timeout(),
        );

        let store = StateStore::new(&config.state_file);
        if let Some(record) = store.recover() {
            if record.owned_elsewhere() {
                warn!(
                    state = %record.state,
                    pid = record.pid,
                    "another live process claims this session"
                );
            }
        }

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (outputs, _) = broadcast::channel(EVENT_CAPACITY);
        let (status_tx, status_rx) = watch::channel(SupervisorStatus::default());
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        tokio::spawn(persist_loop(store.clone(), persist_rx));

        let mut controller = SessionController::new();
        {
            let outputs = outputs.clone();
            controller.observe(move |change| {
                let _ = outputs.send(SupervisorEvent::StateChanged(change.clone()));
            });
        }
        controller.observe(move |change| {
            status_tx.send_replace(SupervisorStatus {
                state: change.to,
                reason: change.reason.clone(),
            });
        });
        {
            let persist_tx = persist_tx.clone();
            controller.observe(move |change| {
                let op = if change.to.is_active() {
                    PersistOp::Save(SessionRecord::current(change.to))
                } else {
                    PersistOp::Clear
                };
                let _ = persist_tx.send(op);
            });
        }

        let auto_restart = config.settings.auto_restart;
        let actor = Actor {
            config: Arc::new(config),
            hypervisor,
            opener,
            control,
            controller,
            outputs: outputs.clone(),
            persist: persist_tx,
            store,
            inbox: inbox_tx.downgrade(),
            op: Op::Idle,
            generation: 0,
            step_seq: 0,
            step: None,
            relay: None,
            halted: None,
            session_live: false,
            monitor: HealthMonitor::new(),
            forwarder: None,
            start_waiters: Vec::new(),
            stop_waiters: Vec::new(),
            destroy_waiters: Vec::new(),
            restart_count: 0,
            auto_restart,
        };
        tokio::spawn(actor.run(inbox_rx));

        Ok(Self {
            inbox: inbox_tx,
            status: status_rx,
            outputs,
        })
    }

    pub fn state(&self) -> VmState {
        self.status.borrow().state
    }

    pub fn status(&self) -> SupervisorStatus {
        self.status.borrow().clone()
    }

    /// Follow status changes.
    pub fn watch(&self) -> watch::Receiver<SupervisorStatus> {
        self.status.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.outputs.subscribe()
    }

    /// Bring the session up. Resolves once the guest is healthy and every
    /// port is forwarded, or with the reason startup failed.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        self.request(Command::Start).await
    }

    /// Escalating shutdown. Idempotent; cancels an in-flight start.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        self.request(Command::Stop).await
    }

    /// User-initiated stop followed by start. Resets the auto-restart budget.
    pub async fn restart(&self) -> Result<(), SupervisorError> {
        self.request(Command::Restart).await
    }

    /// Stop if needed, then delete both disk images and the persisted record.
    pub async fn destroy(&self) -> Result<(), SupervisorError> {
        self.request(Command::Destroy).await
    }

    /// Host is about to sleep.
    pub async fn suspend(&self) -> Result<(), SupervisorError> {
        self.request(Command::Suspend).await
    }

    /// Host woke up.
    pub async fn resume(&self) -> Result<(), SupervisorError> {
        self.request(Command::Resume).await
    }

    /// Last `lines` lines of workload output, if the guest answers.
    pub async fn guest_logs(&self, lines: u32) -> Option<String> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(Event::Command(Command::GuestLogs(lines, tx)))
            .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn snapshot(&self) -> Result<SupervisorSnapshot, SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(Event::Command(Command::Inspect(tx)))
            .map_err(|_| SupervisorError::SupervisorGone)?;
        rx.await.map_err(|_| SupervisorError::SupervisorGone)
    }

    async fn request(&self, make: impl FnOnce(Reply) -> Command) -> Result<(), SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(Event::Command(make(tx)))
            .map_err(|_| SupervisorError::SupervisorGone)?;
        rx.await.map_err(|_| SupervisorError::SupervisorGone)?
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct Actor {
    config: Arc<SupervisorConfig>,
    hypervisor: Arc<dyn Hypervisor>,
    opener: Arc<dyn ChannelOpener>,
    control: ControlClient,
    controller: SessionController,
    outputs: broadcast::Sender<SupervisorEvent>,
    persist: mpsc::UnboundedSender<PersistOp>,
    /// Read-only here; the persist task does all writes.
    store: StateStore,
    inbox: mpsc::WeakUnboundedSender<Event>,

    op: Op,
    /// Bumped on every start; tags hypervisor and health events.
    generation: u64,
    /// Bumped on every spawned step; tags step results.
    step_seq: u64,
    step: Option<JoinHandle<()>>,

    relay: Option<JoinHandle<()>>,
    halted: Option<watch::Receiver<bool>>,
    /// A hypervisor session may exist and must be torn down.
    session_live: bool,

    monitor: HealthMonitor,
    forwarder: Option<PortForwarder>,

    start_waiters: Vec<Reply>,
    stop_waiters: Vec<Reply>,
    destroy_waiters: Vec<Reply>,

    restart_count: u32,
    auto_restart: bool,
}

fn reply_all(waiters: &mut Vec<Reply>, result: Result<(), SupervisorError>) {
    for waiter in waiters.drain(..) {
        let _ = waiter.send(result.clone());
    }
}

impl Actor {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = inbox.recv().await {
            self.handle(event).await;
        }

        if self.session_live {
            warn!(state = %self.state(), "supervisor dropped while a guest session is live");
        }
        self.cancel_step();
        self.cancel_session_tasks().await;
        if let Some(relay) = self.relay.take() {
            relay.abort();
        }
        debug!("supervisor task exiting");
    }

    fn state(&self) -> VmState {
        self.controller.state()
    }

    fn transition(&mut self, to: VmState, reason: Option<String>) -> bool {
        self.controller.transition(to, reason)
    }

    fn emit(&self, event: SupervisorEvent) {
        let _ = self.outputs.send(event);
    }

    fn busy(&self, action: &'static str) -> SupervisorError {
        SupervisorError::InvalidState {
            action,
            state: format!("{} ({})", self.state(), self.op.name()),
        }
    }

    /// Refuse to touch disks another live process is booted from.
    fn check_owner(&self) -> Result<(), SupervisorError> {
        match self.store.load() {
            Ok(Some(record)) if record.owned_elsewhere() => {
                warn!(pid = record.pid, state = %record.state, "session is owned by another process");
                Err(SupervisorError::SessionOwned { pid: record.pid })
            }
            _ => Ok(()),
        }
    }

    fn reset_restart_budget(&mut self) {
        self.restart_count = 0;
        self.auto_restart = self.config.settings.auto_restart;
    }

    // -- dispatch -----------------------------------------------------------

    async fn handle(&mut self, event: Event) {
        match event {
            Event::Command(command) => self.on_command(command).await,
            Event::Hypervisor { generation, event } => {
                if generation == self.generation {
                    self.on_hypervisor(event).await;
                } else {
                    debug!(generation, event = ?event, "dropping hypervisor event from an earlier session");
                }
            }
            Event::Health { generation, signal } => {
                if generation == self.generation {
                    self.on_health(signal).await;
                } else {
                    debug!(generation, signal = ?signal, "dropping health signal from an earlier session");
                }
            }
            Event::Step { seq, result } => {
                if seq == self.step_seq {
                    self.step = None;
                    self.on_step(result).await;
                }
            }
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Start(reply) => match &self.op {
                Op::Starting => self.start_waiters.push(reply),
                Op::Stopping(then) if *then != AfterStop::Destroy => {
                    self.reset_restart_budget();
                    self.start_waiters.push(reply);
                    self.request_stop(AfterStop::Start).await;
                }
                Op::RestartDelay => {
                    self.reset_restart_budget();
                    self.start_waiters.push(reply);
                    self.request_stop(AfterStop::Start).await;
                }
                Op::Idle => match self.state() {
                    VmState::Running | VmState::Paused => {
                        let _ = reply.send(Ok(()));
                    }
                    VmState::Stopped => {
                        if let Err(e) = self.check_owner() {
                            let _ = reply.send(Err(e));
                            return;
                        }
                        self.reset_restart_budget();
                        self.start_waiters.push(reply);
                        self.begin_start();
                    }
                    VmState::Error => {
                        self.reset_restart_budget();
                        self.start_waiters.push(reply);
                        self.request_stop(AfterStop::Start).await;
                    }
                    _ => {
                        let _ = reply.send(Err(self.busy("start")));
                    }
                },
                _ => {
                    let _ = reply.send(Err(self.busy("start")));
                }
            },

            Command::Stop(reply) => match &self.op {
                Op::Pausing(_) | Op::Resuming(_) | Op::Destroying => {
                    let _ = reply.send(Err(self.busy("stop")));
                }
                Op::Stopping(AfterStop::Destroy) => self.stop_waiters.push(reply),
                Op::Idle if self.state() == VmState::Stopped => {
                    let _ = reply.send(Ok(()));
                }
                _ => {
                    self.stop_waiters.push(reply);
                    self.request_stop(AfterStop::Nothing).await;
                }
            },

            Command::Restart(reply) => match &self.op {
                Op::Pausing(_)
                | Op::Resuming(_)
                | Op::Destroying
                | Op::Stopping(AfterStop::Destroy) => {
                    let _ = reply.send(Err(self.busy("restart")));
                }
                _ => {
                    let idle = matches!(self.op, Op::Idle) && self.state() == VmState::Stopped;
                    if idle {
                        if let Err(e) = self.check_owner() {
                            let _ = reply.send(Err(e));
                            return;
                        }
                    }
                    info!(state = %self.state(), "restart requested");
                    self.reset_restart_budget();
                    self.start_waiters.push(reply);
                    if idle {
                        self.begin_start();
                    } else {
                        self.request_stop(AfterStop::Start).await;
                    }
                }
            },

            Command::Destroy(reply) => match &self.op {
                Op::Destroying => self.destroy_waiters.push(reply),
                Op::Pausing(_) | Op::Resuming(_) => {
                    let _ = reply.send(Err(self.busy("destroy")));
                }
                _ => {
                    let idle = matches!(self.op, Op::Idle) && self.state() == VmState::Stopped;
                    if idle {
                        if let Err(e) = self.check_owner() {
                            let _ = reply.send(Err(e));
                            return;
                        }
                    }
                    self.destroy_waiters.push(reply);
                    reply_all(&mut self.start_waiters, Err(SupervisorError::Cancelled));
                    if idle {
                        self.begin_destroy();
                    } else {
                        self.request_stop(AfterStop::Destroy).await;
                    }
                }
            },

            Command::Suspend(reply) => {
                if matches!(self.op, Op::Idle) && self.state() == VmState::Running {
                    self.begin_pause(reply).await;
                } else {
                    debug!(state = %self.state(), "ignoring suspend notice");
                    let _ = reply.send(Err(self.busy("suspend")));
                }
            }

            Command::Resume(reply) => {
                if matches!(self.op, Op::Idle) && self.state() == VmState::Paused {
                    self.begin_resume(reply);
                } else {
                    debug!(state = %self.state(), "ignoring resume notice");
                    let _ = reply.send(Err(self.busy("resume")));
                }
            }

            Command::GuestLogs(lines, reply) => {
                if self.session_live {
                    let control = self.control.clone();
                    tokio::spawn(async move {
                        let _ = reply.send(control.logs(lines).await);
                    });
                } else {
                    let _ = reply.send(None);
                }
            }

            Command::Inspect(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn snapshot(&self) -> SupervisorSnapshot {
        SupervisorSnapshot {
            state: self.state(),
            reason: self.controller.reason().map(str::to_owned),
            forwarding: self
                .forwarder
                .as_ref()
                .map(|f| f.local_addrs().to_vec())
                .unwrap_or_default(),
            live_bridges: self.forwarder.as_ref().map_or(0, PortForwarder::live_bridges),
            active_probes: self.monitor.active(),
            connection_rebuilds: self.forwarder.as_ref().map_or(0, PortForwarder::rebuild_count),
            restart_count: self.restart_count,
            auto_restart: self.auto_restart,
        }
    }

    // -- spawned work -------------------------------------------------------

    fn spawn_step<F>(&mut self, work: F)
    where
        F: std::future::Future<Output = StepResult> + Send + 'static,
    {
        self.step_seq += 1;
        let seq = self.step_seq;
        let Some(inbox) = self.inbox.upgrade() else {
            return;
        };
        let handle = tokio::spawn(async move {
            let result = work.await;
            let _ = inbox.send(Event::Step { seq, result });
        });
        if let Some(previous) = self.step.replace(handle) {
            previous.abort();
        }
    }

    fn cancel_step(&mut self) {
        self.step_seq += 1;
        if let Some(step) = self.step.take() {
            step.abort();
        }
    }

    /// Cancel every probe, bridge and listener; waits until all have ended.
    async fn cancel_session_tasks(&mut self) {
        self.monitor.cancel().await;
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.stop().await;
        }
    }

    fn health_sink(&self) -> SignalSink {
        let inbox = self.inbox.clone();
        let generation = self.generation;
        Arc::new(move |signal| {
            if let Some(inbox) = inbox.upgrade() {
                let _ = inbox.send(Event::Health { generation, signal });
            }
        })
    }

    fn vm_config(&self) -> VmConfig {
        let settings = &self.config.settings;
        let resources = &self.config.manifest.resources;
        let mut channel_ports = vec![settings.control_port];
        channel_ports.extend(
            self.config
                .manifest
                .ports
                .iter()
                .map(|m| m.channel_port(settings.channel_port_base)),
        );
        VmConfig {
            kernel_path: self.config.boot.kernel.clone(),
            initrd_path: self.config.boot.initrd.clone(),
            cmdline: self.config.boot.cmdline.clone(),
            root_disk: self.config.disks.root_image.clone(),
            data_disk: self.config.disks.data_image.clone(),
            serial_log_path: self.config.serial_log.clone(),
            cpu_count: resources.cpus,
            memory_mb: resources.memory_mb,
            channel_ports,
        }
    }

    // -- start --------------------------------------------------------------

    fn begin_start(&mut self) {
        self.generation += 1;
        self.op = Op::Starting;
        info!(generation = self.generation, "starting guest session");

        if !self.transition(VmState::ValidatingHost, None) {
            self.op = Op::Idle;
            let err = self.busy("start");
            reply_all(&mut self.start_waiters, Err(err));
            return;
        }

        let hypervisor = Arc::clone(&self.hypervisor);
        let sizing = self.config.manifest.resources.clone();
        let layout = self.config.disks.clone();
        self.spawn_step(async move {
            StepResult::Validated(validate_host(hypervisor, sizing, layout).await)
        });
    }

    fn begin_provision(&mut self) {
        let layout = self.config.disks.clone();
        let data_disk_mb = self.config.manifest.resources.data_disk_mb;
        let ports = self.config.manifest.ports.clone();
        self.spawn_step(async move {
            StepResult::Provisioned(provision(layout, data_disk_mb, ports).await)
        });
    }

    fn begin_boot(&mut self) {
        let (hv_tx, hv_rx) = mpsc::unbounded_channel();
        let (halted_tx, halted_rx) = watch::channel(false);
        if let Some(old) = self.relay.replace(tokio::spawn(relay_hypervisor_events(
            hv_rx,
            halted_tx,
            self.inbox.clone(),
            self.generation,
        ))) {
            old.abort();
        }
        self.halted = Some(halted_rx);
        self.session_live = true;

        let hypervisor = Arc::clone(&self.hypervisor);
        let vm = self.vm_config();
        self.spawn_step(async move { StepResult::Booted(boot(hypervisor, vm, hv_tx).await) });
    }

    fn begin_startup_probe(&mut self) {
        let settings = &self.config.settings;
        let probe = health::startup_probe(
            self.control.clone(),
            settings.startup_poll_interval(),
            settings.startup_timeout(),
            self.health_sink(),
        );
        self.monitor.spawn(probe);
    }

    fn begin_forwarding(&mut self) {
        let ports = self.config.manifest.ports.clone();
        let base = self.config.settings.channel_port_base;
        let control = self.control.clone();
        let opener = Arc::clone(&self.opener);
        self.spawn_step(async move {
            StepResult::Forwarding(PortForwarder::start(&ports, base, control, opener).await)
        });
    }

    fn start_steady_probes(&mut self) {
        let check: Arc<dyn HealthCheck> = match &self.config.manifest.health {
            Some(http) => match HttpCheck::new(http.url.clone(), http.timeout()) {
                Ok(check) => Arc::new(check),
                Err(e) => {
                    warn!(url = %http.url, error = %e, "falling back to control channel health checks");
                    Arc::new(ControlCheck::new(self.control.clone()))
                }
            },
            None => Arc::new(ControlCheck::new(self.control.clone())),
        };

        let settings = &self.config.settings;
        let steady = health::steady_probe(
            check,
            self.config.health_interval(),
            settings.max_consecutive_failures,
            self.health_sink(),
        );
        let disk = health::disk_probe(
            self.control.clone(),
            settings.disk_check_interval(),
            settings.disk_warning_threshold,
            self.health_sink(),
        );
        self.monitor.spawn(steady);
        self.monitor.spawn(disk);
    }

    /// Abandon the start. A live hypervisor session is force-terminated
    /// before `Error` is reported.
    async fn fail_start(&mut self, error: SupervisorError) {
        warn!(error = %error, state = %self.state(), "start failed");
        self.cancel_step();
        self.cancel_session_tasks().await;

        if self.session_live {
            self.op = Op::FailingStart {
                error,
                then: AfterStop::Nothing,
            };
            let hypervisor = Arc::clone(&self.hypervisor);
            self.spawn_step(async move {
                if let Err(e) = hypervisor.stop().await {
                    warn!(error = %e, "force terminate after failed start");
                }
                StepResult::TornDown
            });
        } else {
            self.enter_start_error(error, AfterStop::Nothing);
        }
    }

    fn enter_start_error(&mut self, error: SupervisorError, then: AfterStop) {
        self.op = Op::Idle;
        self.transition(VmState::Error, Some(error.to_string()));
        reply_all(&mut self.start_waiters, Err(error));

        if then != AfterStop::Nothing || !self.stop_waiters.is_empty() {
            self.transition(VmState::Stopped, None);
            self.after_stop(then);
        }
    }

    // -- stop ---------------------------------------------------------------

    /// Drive the session towards `Stopped`, then do `then`.
    async fn request_stop(&mut self, then: AfterStop) {
        match std::mem::replace(&mut self.op, Op::Idle) {
            Op::Idle => match self.state() {
                VmState::Stopped => self.after_stop(then),
                VmState::Error if !self.session_live => {
                    self.transition(VmState::Stopped, None);
                    self.after_stop(then);
                }
                _ => self.begin_stop(StopPlan::Escalate, then).await,
            },

            Op::Starting => {
                info!(state = %self.state(), "cancelling start");
                self.cancel_step();
                self.cancel_session_tasks().await;
                if then != AfterStop::Start {
                    reply_all(&mut self.start_waiters, Err(SupervisorError::Cancelled));
                }
                let cancelled = Some(SupervisorError::Cancelled.to_string());
                match self.state() {
                    VmState::ValidatingHost => {
                        self.transition(VmState::Stopped, None);
                        self.after_stop(then);
                    }
                    VmState::PreparingFirstLaunch => {
                        self.transition(VmState::Error, cancelled);
                        self.transition(VmState::Stopped, None);
                        self.after_stop(then);
                    }
                    VmState::Starting => {
                        self.transition(VmState::Error, cancelled);
                        self.begin_stop(StopPlan::ForceOnly, then).await;
                    }
                    _ => self.begin_stop(StopPlan::Escalate, then).await,
                }
            }

            Op::Stopping(current) => {
                let merged = current.merge(then);
                if current == AfterStop::Start && merged == AfterStop::Nothing {
                    reply_all(&mut self.start_waiters, Err(SupervisorError::Cancelled));
                }
                self.op = Op::Stopping(merged);
            }

            Op::RestartDelay => {
                self.cancel_step();
                self.begin_stop(StopPlan::Escalate, then).await;
            }

            Op::FailingStart { error, then: current } => {
                self.op = Op::FailingStart {
                    error,
                    then: current.merge(then),
                };
            }

            other @ (Op::Pausing(_) | Op::Resuming(_) | Op::Destroying) => {
                self.op = other;
            }
        }
    }

    async fn begin_stop(&mut self, plan: StopPlan, then: AfterStop) {
        self.op = Op::Stopping(then);
        self.cancel_session_tasks().await;
        self.transition(VmState::Stopping, None);

        let Some(mut halted) = self.halted.clone().filter(|_| self.session_live) else {
            self.finish_stop();
            return;
        };

        let steps = match plan {
            StopPlan::Escalate => shutdown::escalation_plan(&self.config.settings.shutdown),
            StopPlan::ForceOnly => vec![ShutdownStep {
                action: ShutdownAction::ForceTerminate,
                halt_timeout: Duration::ZERO,
            }],
        };
        let target = SessionShutdown {
            control: self.control.clone(),
            hypervisor: Arc::clone(&self.hypervisor),
            ack_timeout: Duration::from_secs(self.config.settings.shutdown.ack_timeout_secs),
        };
        self.spawn_step(async move {
            StepResult::Stopped(shutdown::run_plan(&steps, &target, &mut halted).await)
        });
    }

    fn end_session(&mut self) {
        self.session_live = false;
        self.halted = None;
        if let Some(relay) = self.relay.take() {
            relay.abort();
        }
    }

    fn finish_stop(&mut self) {
        let then = match self.op {
            Op::Stopping(then) => then,
            _ => AfterStop::Nothing,
        };
        self.end_session();
        self.transition(VmState::Stopped, None);
        self.after_stop(then);
    }

    /// The session is `Stopped`; answer stop callers and chain the next step.
    fn after_stop(&mut self, then: AfterStop) {
        self.op = Op::Idle;
        reply_all(&mut self.stop_waiters, Ok(()));
        match then {
            AfterStop::Nothing => {
                reply_all(&mut self.start_waiters, Err(SupervisorError::Cancelled));
            }
            AfterStop::Start => self.begin_start(),
            AfterStop::Destroy => self.begin_destroy(),
        }
    }

    // -- recovery -----------------------------------------------------------

    async fn recover(&mut self, reason: String) {
        self.monitor.cancel().await;
        let max = self.config.settings.max_auto_restarts;

        if self.auto_restart && self.restart_count < max {
            self.restart_count += 1;
            warn!(attempt = self.restart_count, max, reason = %reason, "scheduling automatic restart");
            self.transition(
                VmState::Error,
                Some(format!("restarting ({}/{max}): {reason}", self.restart_count)),
            );
            self.op = Op::RestartDelay;
            let delay = self.config.settings.restart_delay();
            self.spawn_step(async move {
                tokio::time::sleep(delay).await;
                StepResult::RestartDelayElapsed
            });
        } else {
            let was_enabled = self.auto_restart;
            self.auto_restart = false;
            let detail = if was_enabled {
                format!("{}: {reason}", SupervisorError::RestartBudgetExhausted)
            } else {
                reason
            };
            error!(restarts = self.restart_count, "{detail}");
            self.transition(VmState::Error, Some(detail));
        }
    }

    // -- suspend / resume ---------------------------------------------------

    async fn begin_pause(&mut self, reply: Reply) {
        self.monitor.cancel().await;
        self.op = Op::Pausing(reply);
        let hypervisor = Arc::clone(&self.hypervisor);
        self.spawn_step(async move {
            StepResult::Paused(hypervisor.pause().await.map_err(|e| format!("{e:#}")))
        });
    }

    fn begin_resume(&mut self, reply: Reply) {
        self.op = Op::Resuming(reply);
        let hypervisor = Arc::clone(&self.hypervisor);
        self.spawn_step(async move {
            StepResult::Resumed(hypervisor.resume().await.map_err(|e| format!("{e:#}")))
        });
    }

    // -- destroy ------------------------------------------------------------

    fn begin_destroy(&mut self) {
        self.op = Op::Destroying;
        self.transition(VmState::Destroying, None);
        let layout = self.config.disks.clone();
        self.spawn_step(async move {
            StepResult::Destroyed(disks::remove_disks(&layout).await.map_err(|e| format!("{e:#}")))
        });
    }

    /// Answer destroy callers once the persist writer has caught up.
    fn reply_destroy_after_flush(&mut self) {
        let waiters = std::mem::take(&mut self.destroy_waiters);
        let (ack_tx, ack_rx) = oneshot::channel();
        let _ = self.persist.send(PersistOp::Flush(ack_tx));
        tokio::spawn(async move {
            let _ = ack_rx.await;
            let mut waiters = waiters;
            reply_all(&mut waiters, Ok(()));
        });
    }

    // -- event handlers -----------------------------------------------------

    async fn on_hypervisor(&mut self, event: HypervisorEvent) {
        let reason = match &event {
            HypervisorEvent::Halted => "guest halted unexpectedly".to_string(),
            HypervisorEvent::Errored(e) => format!("hypervisor error: {e}"),
        };

        match (&self.op, self.state()) {
            (Op::Idle, VmState::Running | VmState::Paused) => {
                warn!(reason = %reason, "guest session lost");
                self.recover(reason).await;
            }
            (Op::Starting, _) => self.fail_start(SupervisorError::Boot(reason)).await,
            _ => debug!(reason = %reason, op = self.op.name(), "hypervisor event needs no action"),
        }
    }

    async fn on_health(&mut self, signal: HealthSignal) {
        let starting = matches!(self.op, Op::Starting);
        match signal {
            HealthSignal::StartupHealthy if starting && self.state() == VmState::AwaitingHealth => {
                self.transition(VmState::Running, None);
                self.begin_forwarding();
            }
            HealthSignal::StartupTimedOut(timeout)
                if starting && self.state() == VmState::AwaitingHealth =>
            {
                self.fail_start(SupervisorError::StartupTimeout(timeout)).await;
            }
            HealthSignal::RecoveryRequested {
                consecutive_failures,
                last_failure,
            } if matches!(self.op, Op::Idle) && self.state() == VmState::Running => {
                self.recover(format!(
                    "{consecutive_failures} consecutive health check failures, last: {last_failure}"
                ))
                .await;
            }
            HealthSignal::DiskWarning(DiskUsage { used_mb, total_mb }) => {
                self.emit(SupervisorEvent::DiskWarning { used_mb, total_mb });
            }
            other => debug!(signal = ?other, op = self.op.name(), "health signal needs no action"),
        }
    }

    async fn on_step(&mut self, result: StepResult) {
        match result {
            StepResult::Validated(Ok(validation)) => {
                for warning in validation.warnings {
                    self.emit(SupervisorEvent::HostWarning(warning));
                }
                if validation.first_launch {
                    self.transition(VmState::PreparingFirstLaunch, None);
                }
                self.begin_provision();
            }
            StepResult::Validated(Err(e)) | StepResult::Provisioned(Err(e)) => {
                self.fail_start(e).await;
            }
            StepResult::Provisioned(Ok(())) => {
                self.transition(VmState::Starting, None);
                self.begin_boot();
            }

            StepResult::Booted(Ok(())) => {
                self.transition(VmState::AwaitingHealth, None);
                self.begin_startup_probe();
            }
            StepResult::Booted(Err(e)) => {
                // The boot step already tore down whatever it created.
                self.end_session();
                self.fail_start(e).await;
            }

            StepResult::Forwarding(Ok(forwarder)) => {
                self.forwarder = Some(forwarder);
                self.start_steady_probes();
                self.op = Op::Idle;
                info!(generation = self.generation, "guest session running");
                reply_all(&mut self.start_waiters, Ok(()));
            }
            StepResult::Forwarding(Err(e)) => self.fail_start(e.into()).await,

            StepResult::Stopped(Ok(action)) => {
                info!(halted_by = %action, "guest stopped");
                self.finish_stop();
            }
            StepResult::Stopped(Err(reason)) => {
                let err = SupervisorError::Shutdown(reason);
                error!(error = %err, "shutdown escalation failed");
                self.op = Op::Idle;
                self.transition(VmState::Error, Some(err.to_string()));
                reply_all(&mut self.stop_waiters, Err(err.clone()));
                reply_all(&mut self.start_waiters, Err(err.clone()));
                reply_all(&mut self.destroy_waiters, Err(err));
            }

            StepResult::TornDown => {
                self.end_session();
                if let Op::FailingStart { error, then } = std::mem::replace(&mut self.op, Op::Idle) {
                    self.enter_start_error(error, then);
                }
            }

            StepResult::RestartDelayElapsed => {
                info!(attempt = self.restart_count, "restarting guest session");
                self.op = Op::Idle;
                self.request_stop(AfterStop::Start).await;
            }

            StepResult::Paused(result) => {
                let Op::Pausing(reply) = std::mem::replace(&mut self.op, Op::Idle) else {
                    return;
                };
                match result {
                    Ok(()) => {
                        self.transition(VmState::Paused, None);
                        let _ = reply.send(Ok(()));
                    }
                    Err(reason) => {
                        let err = SupervisorError::SuspendResume {
                            action: "pause",
                            reason,
                        };
                        error!(error = %err, "pause failed");
                        self.transition(VmState::Error, Some(err.to_string()));
                        let _ = reply.send(Err(err));
                    }
                }
            }

            StepResult::Resumed(result) => {
                let Op::Resuming(reply) = std::mem::replace(&mut self.op, Op::Idle) else {
                    return;
                };
                match result {
                    Ok(()) => {
                        self.transition(VmState::Running, None);
                        if let Some(forwarder) = self.forwarder.as_mut() {
                            let cancelled = forwarder.rebuild_connections().await;
                            self.emit(SupervisorEvent::ConnectionsRebuilt { cancelled });
                        }
                        self.start_steady_probes();
                        let _ = reply.send(Ok(()));
                    }
                    Err(reason) => {
                        let err = SupervisorError::SuspendResume {
                            action: "resume",
                            reason,
                        };
                        error!(error = %err, "resume failed");
                        self.transition(VmState::Error, Some(err.to_string()));
                        let _ = reply.send(Err(err));
                    }
                }
            }

            StepResult::Destroyed(Ok(())) => {
                self.op = Op::Idle;
                self.transition(VmState::Stopped, None);
                info!("session destroyed");
                self.reply_destroy_after_flush();
            }
            StepResult::Destroyed(Err(reason)) => {
                self.op = Op::Idle;
                let err = SupervisorError::Destroy(reason);
                self.transition(VmState::Error, Some(err.to_string()));
                reply_all(&mut self.destroy_waiters, Err(err));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Step bodies
// ---------------------------------------------------------------------------

async fn validate_host(
    hypervisor: Arc<dyn Hypervisor>,
    sizing: ResourceSizing,
    layout: DiskLayout,
) -> Result<Validation, SupervisorError> {
    hypervisor
        .host_support()
        .map_err(SupervisorError::UnsupportedHost)?;

    let resources = tokio::task::spawn_blocking(HostResources::detect)
        .await
        .map_err(|e| SupervisorError::UnsupportedHost(format!("host probe failed: {e}")))?;
    let warnings = host::evaluate(&resources, &sizing)?;

    disks::ensure_root_image(&layout)
        .await
        .map_err(|e| SupervisorError::Provisioning(format!("{e:#}")))?;

    Ok(Validation {
        warnings,
        first_launch: disks::is_first_launch(&layout),
    })
}

async fn provision(
    layout: DiskLayout,
    data_disk_mb: u64,
    ports: Vec<PortMapping>,
) -> Result<(), SupervisorError> {
    disks::ensure_data_image(&layout.data_image, data_disk_mb)
        .await
        .map_err(|e| SupervisorError::Provisioning(format!("{e:#}")))?;

    for mapping in &ports {
        forwarder::probe_host_port(mapping.host_port)?;
    }
    Ok(())
}

/// Create and start the guest. A failed start tears the half-created
/// session down before reporting.
async fn boot(
    hypervisor: Arc<dyn Hypervisor>,
    vm: VmConfig,
    events: mpsc::UnboundedSender<HypervisorEvent>,
) -> Result<(), SupervisorError> {
    hypervisor
        .create(&vm, events)
        .await
        .map_err(|e| SupervisorError::Boot(format!("{e:#}")))?;

    if let Err(e) = hypervisor.start().await {
        if let Err(stop_err) = hypervisor.stop().await {
            warn!(error = %stop_err, "force terminate after failed boot");
        }
        return Err(SupervisorError::Boot(format!("{e:#}")));
    }
    Ok(())
}

async fn relay_hypervisor_events(
    mut events: mpsc::UnboundedReceiver<HypervisorEvent>,
    halted: watch::Sender<bool>,
    inbox: mpsc::WeakUnboundedSender<Event>,
    generation: u64,
) {
    while let Some(event) = events.recv().await {
        halted.send_replace(true);
        let Some(inbox) = inbox.upgrade() else {
            return;
        };
        let _ = inbox.send(Event::Hypervisor { generation, event });
    }
}

async fn persist_loop(store: StateStore, mut ops: mpsc::UnboundedReceiver<PersistOp>) {
    while let Some(op) = ops.recv().await {
        match op {
            PersistOp::Save(record) => {
                if let Err(e) = store.save(&record) {
                    warn!(error = %e, "failed to persist session record");
                }
            }
            PersistOp::Clear => {
                if let Err(e) = store.clear() {
                    warn!(error = %e, "failed to remove session record");
                }
            }
            PersistOp::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

/// Shutdown target for a live session.
struct SessionShutdown {
    control: ControlClient,
    hypervisor: Arc<dyn Hypervisor>,
    ack_timeout: Duration,
}

#[async_trait::async_trait]
impl ShutdownTarget for SessionShutdown {
    async fn request_shutdown(&self) -> bool {
        self.control.shutdown(self.ack_timeout).await
    }

    async fn press_power_button(&self) -> anyhow::Result<()> {
        self.hypervisor.request_graceful_stop().await
    }

    async fn force_terminate(&self) -> anyhow::Result<()> {
        self.hypervisor
            .stop()
            .await
            .map_err(|e| e.context("hypervisor force stop"))
    }
}
