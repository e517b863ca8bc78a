//! Persisted session record.
//!
//! A small JSON file `{state, pid, timestamp}` rewritten on every lifecycle
//! transition. On process start a record that claims an active state but
//! names a dead process means the previous run crashed; it is discarded.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::state_machine::VmState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub state: VmState,
    pub pid: u32,
    pub timestamp: DateTime<Utc>,
}

impl SessionRecord {
    /// A record for this process in `state`.
    pub fn current(state: VmState) -> Self {
        Self {
            state,
            pid: std::process::id(),
            timestamp: Utc::now(),
        }
    }

    /// Whether the record describes a run that died without cleaning up.
    pub fn is_stale(&self) -> bool {
        self.state.is_active() && !process_alive(self.pid)
    }

    /// Whether another live process is supervising this session.
    pub fn owned_elsewhere(&self) -> bool {
        self.state.is_active() && self.pid != std::process::id() && process_alive(self.pid)
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the record atomically (temp file + rename).
    pub fn save(&self, record: &SessionRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let json = serde_json::to_vec_pretty(record).context("serialize session record")?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename {} to {}", tmp.display(), self.path.display()))?;
        debug!(state = %record.state, path = %self.path.display(), "session record saved");
        Ok(())
    }

    /// `Ok(None)` when no record exists.
    pub fn load(&self) -> Result<Option<SessionRecord>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("read {}", self.path.display())),
        };
        let record = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse {}", self.path.display()))?;
        Ok(Some(record))
    }

    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove {}", self.path.display())),
        }
    }

    /// Load the record, discarding it when it belongs to a crashed run.
    /// An unreadable record is discarded as well.
    pub fn recover(&self) -> Option<SessionRecord> {
        let record = match self.load() {
            Ok(record) => record?,
            Err(e) => {
                warn!(error = %e, "discarding unreadable session record");
                let _ = self.clear();
                return None;
            }
        };

        if record.is_stale() {
            info!(
                state = %record.state,
                pid = record.pid,
                since = %record.timestamp,
                "previous run ended without shutting down; discarding its record"
            );
            if let Err(e) = self.clear() {
                warn!(error = %e, "failed to remove stale session record");
            }
            return None;
        }
        Some(record)
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}
