//! Escalating shutdown.
//!
//! The sequence is data, not nested conditionals: an ordered list of
//! (action, wait-for-halt, timeout) steps run against a [`ShutdownTarget`].
//! Each step runs only if the previous one did not halt the guest.
//!
//! ```text
//! SHUTDOWN ── ACK ≤5s ──► halt ≤30s
//!    │ no ACK / no halt
//!    ▼
//! power button ──► halt ≤10s
//!    │ no halt
//!    ▼
//! force terminate
//! ```

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::ShutdownTimeouts;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownAction {
    /// `SHUTDOWN` over the control channel.
    ControlShutdown,
    /// The virtual power button.
    PowerButton,
    /// Hypervisor force-stop.
    ForceTerminate,
    /// The guest was down before any step ran.
    AlreadyHalted,
}

impl fmt::Display for ShutdownAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ControlShutdown => "control shutdown",
            Self::PowerButton => "power button",
            Self::ForceTerminate => "force terminate",
            Self::AlreadyHalted => "already halted",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownStep {
    pub action: ShutdownAction,
    /// How long to wait for the guest to halt after the action.
    pub halt_timeout: Duration,
}

/// The standard three-step plan.
pub fn escalation_plan(timeouts: &ShutdownTimeouts) -> Vec<ShutdownStep> {
    vec![
        ShutdownStep {
            action: ShutdownAction::ControlShutdown,
            halt_timeout: Duration::from_secs(timeouts.halt_timeout_secs),
        },
        ShutdownStep {
            action: ShutdownAction::PowerButton,
            halt_timeout: Duration::from_secs(timeouts.power_button_timeout_secs),
        },
        ShutdownStep {
            action: ShutdownAction::ForceTerminate,
            halt_timeout: Duration::ZERO,
        },
    ]
}

/// What the plan acts on.
#[async_trait]
pub trait ShutdownTarget: Send + Sync {
    /// Send `SHUTDOWN`; `true` once acknowledged.
    async fn request_shutdown(&self) -> bool;

    async fn press_power_button(&self) -> anyhow::Result<()>;

    async fn force_terminate(&self) -> anyhow::Result<()>;
}

/// Wait until `halted` reads `true`, at most `timeout`.
pub async fn wait_for_halt(halted: &mut watch::Receiver<bool>, timeout: Duration) -> bool {
    if *halted.borrow() {
        return true;
    }
    matches!(
        tokio::time::timeout(timeout, halted.wait_for(|h| *h)).await,
        Ok(Ok(_))
    )
}

/// Run `plan` until the guest halts. Returns the action that achieved the
/// halt, or the reason the final step failed.
pub async fn run_plan(
    plan: &[ShutdownStep],
    target: &dyn ShutdownTarget,
    halted: &mut watch::Receiver<bool>,
) -> Result<ShutdownAction, String> {
    let mut attempted = None;
    for step in plan {
        if *halted.borrow() {
            let action = attempted.unwrap_or(ShutdownAction::AlreadyHalted);
            info!(action = %action, "guest halted");
            return Ok(action);
        }
        attempted = Some(step.action);

        match step.action {
            ShutdownAction::ControlShutdown => {
                if !target.request_shutdown().await {
                    warn!("SHUTDOWN not acknowledged; escalating");
                    continue;
                }
            }
            ShutdownAction::PowerButton => {
                if let Err(e) = target.press_power_button().await {
                    warn!(error = %e, "power button request failed; escalating");
                    continue;
                }
            }
            ShutdownAction::ForceTerminate => {
                target
                    .force_terminate()
                    .await
                    .map_err(|e| format!("force terminate failed: {e:#}"))?;
                info!("guest force-terminated");
                return Ok(ShutdownAction::ForceTerminate);
            }
            ShutdownAction::AlreadyHalted => {}
        }

        if wait_for_halt(halted, step.halt_timeout).await {
            info!(action = %step.action, "guest halted");
            return Ok(step.action);
        }
        warn!(action = %step.action, timeout_secs = step.halt_timeout.as_secs(), "guest did not halt; escalating");
    }

    Err("shutdown plan ended without halting the guest".to_string())
}
