//! Health supervision for the guest workload.
//!
//! Three independent loops, cancelled together through [`HealthMonitor`]:
//!
//! ```text
//! startup probe  ── HEALTH every poll interval ──► StartupHealthy | StartupTimedOut
//! steady probe   ── HTTP GET (or HEALTH) ───────► RecoveryRequested after N consecutive failures
//! disk probe     ── DISK every check interval ──► DiskWarning when used/total ≥ threshold
//! ```
//!
//! Probes never touch lifecycle state. They only report [`HealthSignal`]s to
//! a sink; the supervisor decides what to do with them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::ControlClient;
use super::control::{DiskUsage, GuestHealth};

/// Everything a probe can report.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthSignal {
    StartupHealthy,
    StartupTimedOut(Duration),
    RecoveryRequested {
        consecutive_failures: u32,
        last_failure: String,
    },
    DiskWarning(DiskUsage),
}

pub type SignalSink = Arc<dyn Fn(HealthSignal) + Send + Sync>;

// ---------------------------------------------------------------------------
// Health record
// ---------------------------------------------------------------------------

/// Consecutive-failure counter plus the time of the last good result.
#[derive(Debug, Clone, Default)]
pub struct HealthRecord {
    consecutive_failures: u32,
    last_good: Option<DateTime<Utc>>,
}

impl HealthRecord {
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.last_good = Some(Utc::now());
    }

    /// Returns the updated consecutive-failure count.
    pub fn record_failure(&mut self) -> u32 {
        self.consecutive_failures += 1;
        self.consecutive_failures
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_good(&self) -> Option<DateTime<Utc>> {
        self.last_good
    }
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

/// One steady-state health observation.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// `Err` carries a short reason for the failure.
    async fn check(&self) -> Result<(), String>;

    fn describe(&self) -> String;
}

/// GET a workload-declared URL. 2xx and 3xx are healthy; redirects are not
/// followed.
pub struct HttpCheck {
    client: reqwest::Client,
    url: String,
}

impl HttpCheck {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl HealthCheck for HttpCheck {
    async fn check(&self) -> Result<(), String> {
        match self.client.get(&self.url).send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() || status.is_redirection() {
                    Ok(())
                } else {
                    Err(format!("HTTP {}", status.as_u16()))
                }
            }
            Err(e) => Err(e.to_string()),
        }
    }

    fn describe(&self) -> String {
        format!("GET {}", self.url)
    }
}

/// Fallback when the manifest declares no HTTP endpoint: the control
/// channel `HEALTH` verb.
pub struct ControlCheck {
    control: ControlClient,
}

impl ControlCheck {
    pub fn new(control: ControlClient) -> Self {
        Self { control }
    }
}

#[async_trait]
impl HealthCheck for ControlCheck {
    async fn check(&self) -> Result<(), String> {
        match self.control.health().await {
            Some(GuestHealth::Healthy) => Ok(()),
            Some(GuestHealth::Unhealthy(reason)) => Err(reason),
            None => Err("no response to HEALTH".to_string()),
        }
    }

    fn describe(&self) -> String {
        "control HEALTH".to_string()
    }
}

// ---------------------------------------------------------------------------
// Probe loops
// ---------------------------------------------------------------------------

/// Send `HEALTH` every `poll_interval` until the first `OK` or until
/// `timeout` elapses.
pub async fn startup_probe(
    control: ControlClient,
    poll_interval: Duration,
    timeout: Duration,
    sink: SignalSink,
) {
    let probe = async {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match control.health().await {
                Some(GuestHealth::Healthy) => return,
                Some(GuestHealth::Unhealthy(reason)) => {
                    debug!(attempt, reason = %reason, "guest not healthy yet");
                }
                None => debug!(attempt, "no HEALTH response yet"),
            }
            tokio::time::sleep(poll_interval).await;
        }
    };

    match tokio::time::timeout(timeout, probe).await {
        Ok(()) => {
            info!("guest reported healthy");
            sink(HealthSignal::StartupHealthy);
        }
        Err(_) => {
            warn!(timeout_secs = timeout.as_secs(), "guest never reported healthy");
            sink(HealthSignal::StartupTimedOut(timeout));
        }
    }
}

/// Run `check` every `interval`. Requests recovery once after
/// `max_failures` consecutive failures, then exits.
pub async fn steady_probe(
    check: Arc<dyn HealthCheck>,
    interval: Duration,
    max_failures: u32,
    sink: SignalSink,
) {
    let mut record = HealthRecord::default();
    let target = check.describe();

    loop {
        tokio::time::sleep(interval).await;

        match check.check().await {
            Ok(()) => {
                if record.consecutive_failures() > 0 {
                    info!(check = %target, "health check recovered");
                }
                record.record_success();
            }
            Err(reason) => {
                let failures = record.record_failure();
                warn!(check = %target, failures, reason = %reason, "health check failed");
                if failures >= max_failures {
                    sink(HealthSignal::RecoveryRequested {
                        consecutive_failures: failures,
                        last_failure: reason,
                    });
                    return;
                }
            }
        }
    }
}

/// Send `DISK` every `interval`; every reading at or above `threshold`
/// raises a warning.
pub async fn disk_probe(
    control: ControlClient,
    interval: Duration,
    threshold: f64,
    sink: SignalSink,
) {
    loop {
        tokio::time::sleep(interval).await;

        let Some(usage) = control.disk_usage().await else {
            debug!("no DISK response");
            continue;
        };

        if usage.ratio() >= threshold {
            warn!(used_mb = usage.used_mb, total_mb = usage.total_mb, "guest disk nearly full");
            sink(HealthSignal::DiskWarning(usage));
        }
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Owns the spawned probe tasks so they can be cancelled as a group.
#[derive(Default)]
pub struct HealthMonitor {
    tasks: Vec<JoinHandle<()>>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&mut self, probe: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.retain(|task| !task.is_finished());
        self.tasks.push(tokio::spawn(probe));
    }

    /// Number of probes still running.
    pub fn active(&self) -> usize {
        self.tasks.iter().filter(|task| !task.is_finished()).count()
    }

    /// Abort every probe and wait until all of them have finished.
    pub async fn cancel(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        join_all(self.tasks.drain(..)).await;
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
