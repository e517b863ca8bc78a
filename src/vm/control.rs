//! Guest control channel client.
//!
//! A line-oriented request/response protocol carried over a fixed-port guest
//! channel. Every call opens a fresh channel, writes one command, reads one
//! response and closes the channel again:
//!
//! | Request                              | Response                            |
//! |--------------------------------------|-------------------------------------|
//! | `HEALTH`                             | `OK` \| `FAIL:<reason>`             |
//! | `DISK`                               | `DISK:<used_mb>/<total_mb>`         |
//! | `LOGS:<n>`                           | `LOGS:<byte_count>\n<text>`         |
//! | `SHUTDOWN`                           | `ACK`                               |
//! | `FORWARD:<channelPort>:<guestPort>`  | `ACK` \| `ERR:<reason>`             |
//! | `FORWARD-STOP`                       | `ACK`                               |
//!
//! Connection failures, malformed responses and timeouts all collapse to
//! `None`: callers treat every one of them as "the command did not take
//! effect".

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use super::{ChannelOpener, GuestStream};

/// Longest response line accepted, excluding the terminator.
pub const MAX_LINE_BYTES: usize = 4096;

/// Largest `LOGS` payload accepted.
pub const MAX_LOG_BYTES: usize = 16 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Commands and responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Health,
    Disk,
    Logs(u32),
    Shutdown,
    Forward { channel_port: u32, guest_port: u16 },
    ForwardStop,
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Health => f.write_str("HEALTH"),
            Self::Disk => f.write_str("DISK"),
            Self::Logs(lines) => write!(f, "LOGS:{lines}"),
            Self::Shutdown => f.write_str("SHUTDOWN"),
            Self::Forward {
                channel_port,
                guest_port,
            } => write!(f, "FORWARD:{channel_port}:{guest_port}"),
            Self::ForwardStop => f.write_str("FORWARD-STOP"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlResponse {
    Ok,
    Fail(String),
    Disk(DiskUsage),
    Logs(String),
    Ack,
    Err(String),
}

/// Guest disk usage in megabytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub used_mb: u64,
    pub total_mb: u64,
}

impl DiskUsage {
    /// Fraction of the disk in use; `0.0` for an empty disk report.
    pub fn ratio(self) -> f64 {
        if self.total_mb == 0 {
            0.0
        } else {
            self.used_mb as f64 / self.total_mb as f64
        }
    }
}

/// Result of a `HEALTH` call that got an answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestHealth {
    Healthy,
    Unhealthy(String),
}

/// First response line: either a complete response or the `LOGS` header.
#[derive(Debug, PartialEq, Eq)]
enum Header {
    Complete(ControlResponse),
    Logs(usize),
}

fn parse_header(line: &str) -> Option<Header> {
    let (verb, arg) = match line.split_once(':') {
        Some((verb, arg)) => (verb, Some(arg)),
        None => (line, None),
    };

    let response = match (verb, arg) {
        ("OK", None) => ControlResponse::Ok,
        ("ACK", None) => ControlResponse::Ack,
        ("FAIL", reason) => ControlResponse::Fail(reason.unwrap_or_default().to_string()),
        ("ERR", reason) => ControlResponse::Err(reason.unwrap_or_default().to_string()),
        ("DISK", Some(arg)) => {
            let (used, total) = arg.split_once('/')?;
            ControlResponse::Disk(DiskUsage {
                used_mb: used.trim().parse().ok()?,
                total_mb: total.trim().parse().ok()?,
            })
        }
        ("LOGS", Some(arg)) => {
            let len: usize = arg.trim().parse().ok()?;
            if len > MAX_LOG_BYTES {
                return None;
            }
            return Some(Header::Logs(len));
        }
        _ => return None,
    };
    Some(Header::Complete(response))
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Sends control commands to the guest. Cheap to clone.
#[derive(Clone)]
pub struct ControlClient {
    opener: Arc<dyn ChannelOpener>,
    port: u32,
    default_timeout: Duration,
}

impl ControlClient {
    pub fn new(opener: Arc<dyn ChannelOpener>, port: u32, default_timeout: Duration) -> Self {
        Self {
            opener,
            port,
            default_timeout,
        }
    }

    /// Send one command and wait at most `timeout` for its response.
    ///
    /// The channel is closed on every path, including timeout, because it is
    /// owned by the future that the timer drops.
    pub async fn send(&self, command: &ControlCommand, timeout: Duration) -> Option<ControlResponse> {
        match tokio::time::timeout(timeout, self.exchange(command)).await {
            Ok(Ok(response)) => {
                debug!(command = %command, response = ?response, "control call answered");
                Some(response)
            }
            Ok(Err(e)) => {
                debug!(command = %command, error = %e, "control call failed");
                None
            }
            Err(_) => {
                debug!(command = %command, timeout_ms = timeout.as_millis() as u64, "control call timed out");
                None
            }
        }
    }

    async fn exchange(&self, command: &ControlCommand) -> anyhow::Result<ControlResponse> {
        let mut stream = self
            .opener
            .open_channel(self.port)
            .await
            .with_context(|| format!("open control channel on port {}", self.port))?;

        let result = converse(&mut stream, command).await;
        let _ = stream.shutdown().await;
        result
    }

    pub async fn health(&self) -> Option<GuestHealth> {
        match self.send(&ControlCommand::Health, self.default_timeout).await? {
            ControlResponse::Ok => Some(GuestHealth::Healthy),
            ControlResponse::Fail(reason) => Some(GuestHealth::Unhealthy(reason)),
            _ => None,
        }
    }

    pub async fn disk_usage(&self) -> Option<DiskUsage> {
        match self.send(&ControlCommand::Disk, self.default_timeout).await? {
            ControlResponse::Disk(usage) => Some(usage),
            _ => None,
        }
    }

    /// Last `lines` lines of workload output.
    pub async fn logs(&self, lines: u32) -> Option<String> {
        match self.send(&ControlCommand::Logs(lines), self.default_timeout).await? {
            ControlResponse::Logs(text) => Some(text),
            _ => None,
        }
    }

    /// Ask the guest to power itself off; `true` once acknowledged.
    pub async fn shutdown(&self, ack_timeout: Duration) -> bool {
        matches!(
            self.send(&ControlCommand::Shutdown, ack_timeout).await,
            Some(ControlResponse::Ack)
        )
    }

    /// Ask the guest to relay `channel_port` to its local `guest_port`.
    pub async fn forward(&self, channel_port: u32, guest_port: u16) -> Result<(), String> {
        let command = ControlCommand::Forward {
            channel_port,
            guest_port,
        };
        match self.send(&command, self.default_timeout).await {
            Some(ControlResponse::Ack) => Ok(()),
            Some(ControlResponse::Err(reason)) => Err(reason),
            Some(other) => Err(format!("unexpected response {other:?}")),
            None => Err("no response".to_string()),
        }
    }

    pub async fn forward_stop(&self) -> bool {
        matches!(
            self.send(&ControlCommand::ForwardStop, self.default_timeout).await,
            Some(ControlResponse::Ack)
        )
    }
}

async fn converse(stream: &mut GuestStream, command: &ControlCommand) -> anyhow::Result<ControlResponse> {
    stream
        .write_all(format!("{command}\n").as_bytes())
        .await
        .context("write command")?;
    stream.flush().await.context("flush command")?;

    let mut reader = BufReader::new(stream);
    let line = read_line(&mut reader).await?;

    match parse_header(&line).ok_or_else(|| anyhow!("malformed response {line:?}"))? {
        Header::Complete(response) => Ok(response),
        Header::Logs(len) => {
            let mut payload = vec![0u8; len];
            reader
                .read_exact(&mut payload)
                .await
                .context("read LOGS payload")?;
            Ok(ControlResponse::Logs(
                String::from_utf8_lossy(&payload).into_owned(),
            ))
        }
    }
}

async fn read_line<R>(reader: &mut R) -> anyhow::Result<String>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = reader
        .take(MAX_LINE_BYTES as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await
        .context("read response line")?;

    if n == 0 {
        bail!("channel closed before a response arrived");
    }
    if buf.last() != Some(&b'\n') {
        if buf.len() > MAX_LINE_BYTES {
            bail!("response line exceeds {MAX_LINE_BYTES} bytes");
        }
        bail!("channel closed mid-line");
    }
    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    String::from_utf8(buf).context("response is not UTF-8")
}
