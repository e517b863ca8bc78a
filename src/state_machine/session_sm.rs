//! VM session state machine.
//!
//! The single source of truth for the lifecycle phase of the supervised VM:
//! ```text
//! Stopped → ValidatingHost → PreparingFirstLaunch → Starting → AwaitingHealth → Running ⇄ Paused
//!    ↑            │                                                                 │
//!    └──── Stopping ←──────────────────────────────────────────────────────────────┘
//!
//! Error ──→ {Starting, ValidatingHost, Stopping, Stopped, Destroying}
//! Destroying ──→ {Stopped, Error}
//! ```
//!
//! Requests for an edge that is not declared are logged and ignored; they are
//! never errors. Every applied transition notifies all observers before
//! [`SessionController::transition`] returns.

use std::fmt;

use serde::{Deserialize, Serialize};
use statig::prelude::*;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Phases and the declared edge table
// ---------------------------------------------------------------------------

/// Lifecycle phase of the supervised VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VmState {
    Stopped,
    ValidatingHost,
    PreparingFirstLaunch,
    Starting,
    AwaitingHealth,
    Running,
    Paused,
    Stopping,
    Destroying,
    Error,
}

impl VmState {
    pub const ALL: [VmState; 10] = [
        VmState::Stopped,
        VmState::ValidatingHost,
        VmState::PreparingFirstLaunch,
        VmState::Starting,
        VmState::AwaitingHealth,
        VmState::Running,
        VmState::Paused,
        VmState::Stopping,
        VmState::Destroying,
        VmState::Error,
    ];

    /// Phases reachable from `self` in one transition.
    pub fn legal_targets(self) -> &'static [VmState] {
        use VmState::*;
        match self {
            Stopped => &[ValidatingHost, Starting, Destroying],
            ValidatingHost => &[PreparingFirstLaunch, Starting, Error, Stopped],
            PreparingFirstLaunch => &[Starting, Error],
            Starting => &[AwaitingHealth, Error],
            AwaitingHealth => &[Running, Error, Stopping],
            Running => &[Stopping, Paused, Error],
            Paused => &[Running, Stopping, Error],
            Stopping => &[Stopped, Error],
            Destroying => &[Stopped, Error],
            Error => &[Starting, ValidatingHost, Stopping, Stopped, Destroying],
        }
    }

    pub fn can_transition_to(self, to: VmState) -> bool {
        self.legal_targets().contains(&to)
    }

    /// Whether a hypervisor session may be alive in this phase.
    pub fn is_active(self) -> bool {
        !matches!(self, VmState::Stopped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VmState::Stopped => "stopped",
            VmState::ValidatingHost => "validating-host",
            VmState::PreparingFirstLaunch => "preparing-first-launch",
            VmState::Starting => "starting",
            VmState::AwaitingHealth => "awaiting-health",
            VmState::Running => "running",
            VmState::Paused => "paused",
            VmState::Stopping => "stopping",
            VmState::Destroying => "destroying",
            VmState::Error => "error",
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification delivered to observers after every applied transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub from: VmState,
    pub to: VmState,
    /// Present only when `to` is [`VmState::Error`].
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// The only event the machine accepts: "move to `to`".
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub to: VmState,
    pub reason: Option<String>,
}

impl TransitionRequest {
    fn target(&self) -> State {
        match self.to {
            VmState::Stopped => State::stopped(),
            VmState::ValidatingHost => State::validating_host(),
            VmState::PreparingFirstLaunch => State::preparing_first_launch(),
            VmState::Starting => State::starting(),
            VmState::AwaitingHealth => State::awaiting_health(),
            VmState::Running => State::running(),
            VmState::Paused => State::paused(),
            VmState::Stopping => State::stopping(),
            VmState::Destroying => State::destroying(),
            VmState::Error => State::error(
                self.reason
                    .clone()
                    .unwrap_or_else(|| "unspecified error".to_string()),
            ),
        }
    }

    fn accept_from(&self, from: VmState) -> Outcome<State> {
        if from.can_transition_to(self.to) {
            Transition(self.target())
        } else {
            Handled
        }
    }
}

// ---------------------------------------------------------------------------
// State machine implementation
// ---------------------------------------------------------------------------

/// Shared storage for the session machine. Phases carry no shared data; the
/// error reason lives in the `Error` state itself so it is dropped on exit.
#[derive(Debug, Default)]
pub struct SessionMachine;

#[state_machine(
    initial = "State::stopped()",
    state(derive(Debug, Clone, PartialEq, Eq))
)]
impl SessionMachine {
    #[state]
    fn stopped(event: &TransitionRequest) -> Outcome<State> {
        event.accept_from(VmState::Stopped)
    }

    #[state]
    fn validating_host(event: &TransitionRequest) -> Outcome<State> {
        event.accept_from(VmState::ValidatingHost)
    }

    #[state]
    fn preparing_first_launch(event: &TransitionRequest) -> Outcome<State> {
        event.accept_from(VmState::PreparingFirstLaunch)
    }

    #[state]
    fn starting(event: &TransitionRequest) -> Outcome<State> {
        event.accept_from(VmState::Starting)
    }

    #[state]
    fn awaiting_health(event: &TransitionRequest) -> Outcome<State> {
        event.accept_from(VmState::AwaitingHealth)
    }

    #[state]
    fn running(event: &TransitionRequest) -> Outcome<State> {
        event.accept_from(VmState::Running)
    }

    #[state]
    fn paused(event: &TransitionRequest) -> Outcome<State> {
        event.accept_from(VmState::Paused)
    }

    #[state]
    fn stopping(event: &TransitionRequest) -> Outcome<State> {
        event.accept_from(VmState::Stopping)
    }

    #[state]
    fn destroying(event: &TransitionRequest) -> Outcome<State> {
        event.accept_from(VmState::Destroying)
    }

    /// `reason` is carried for observers and cleared on any exit.
    #[state]
    fn error(event: &TransitionRequest, reason: &String) -> Outcome<State> {
        let _ = reason;
        event.accept_from(VmState::Error)
    }
}

fn phase_of(state: &State) -> VmState {
    match state {
        State::Stopped {} => VmState::Stopped,
        State::ValidatingHost {} => VmState::ValidatingHost,
        State::PreparingFirstLaunch {} => VmState::PreparingFirstLaunch,
        State::Starting {} => VmState::Starting,
        State::AwaitingHealth {} => VmState::AwaitingHealth,
        State::Running {} => VmState::Running,
        State::Paused {} => VmState::Paused,
        State::Stopping {} => VmState::Stopping,
        State::Destroying {} => VmState::Destroying,
        State::Error { .. } => VmState::Error,
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

type Observer = Box<dyn Fn(&StateChange) + Send + Sync>;

/// Owns the session machine and its observers.
///
/// Not thread-safe by itself: the supervisor keeps it inside its event loop
/// task, which is the only place transitions are requested from.
pub struct SessionController {
    machine: StateMachine<SessionMachine>,
    observers: Vec<Observer>,
}

impl Default for SessionController {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionController {
    pub fn new() -> Self {
        Self {
            machine: SessionMachine.state_machine(),
            observers: Vec::new(),
        }
    }

    pub fn state(&self) -> VmState {
        phase_of(self.machine.state())
    }

    /// The reason attached to the current `Error` state, if any.
    pub fn reason(&self) -> Option<&str> {
        match self.machine.state() {
            State::Error { reason } => Some(reason.as_str()),
            _ => None,
        }
    }

    /// Register a callback run synchronously after every applied transition.
    pub fn observe(&mut self, observer: impl Fn(&StateChange) + Send + Sync + 'static) {
        self.observers.push(Box::new(observer));
    }

    /// Move to `to` if the edge is declared from the current phase.
    ///
    /// Returns `false`, leaving the phase unchanged, for undeclared edges.
    pub fn transition(&mut self, to: VmState, reason: Option<String>) -> bool {
        let from = self.state();
        if !from.can_transition_to(to) {
            warn!(from = %from, to = %to, "ignoring undeclared state transition");
            return false;
        }

        self.machine.handle(&TransitionRequest { to, reason });

        let change = StateChange {
            from,
            to: self.state(),
            reason: self.reason().map(str::to_owned),
        };
        match &change.reason {
            Some(reason) => info!(from = %from, to = %change.to, reason = %reason, "state changed"),
            None => info!(from = %from, to = %change.to, "state changed"),
        }

        for observer in &self.observers {
            observer(&change);
        }
        true
    }
}
