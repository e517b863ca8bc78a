//! Connection bridge: one host TCP connection paired with one guest channel.
//!
//! ```text
//! host client ──TCP──► [ConnectionBridge #id] ──guest channel──► guest port
//! ```
//!
//! A bridge is consumed by [`ConnectionBridge::run`], so a closed bridge can
//! never be reused. The relay ends as soon as either side reaches
//! end-of-stream or errors; both ends are then shut down.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::GuestStream;
use crate::config::PortMapping;

/// Called exactly once with the bridge id when the relay ends on its own.
pub type CloseHook = Box<dyn FnOnce(u64) + Send>;

/// Bytes relayed in each direction over the life of a bridge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub host_to_guest: u64,
    pub guest_to_host: u64,
}

pub struct ConnectionBridge {
    id: u64,
    mapping: PortMapping,
    peer: SocketAddr,
    host: TcpStream,
    guest: GuestStream,
    on_close: Option<CloseHook>,
}

impl ConnectionBridge {
    pub fn new(
        id: u64,
        mapping: PortMapping,
        peer: SocketAddr,
        host: TcpStream,
        guest: GuestStream,
    ) -> Self {
        Self {
            id,
            mapping,
            peer,
            host,
            guest,
            on_close: None,
        }
    }

    /// Register the hook that unregisters this bridge from its owner.
    pub fn on_close(mut self, hook: CloseHook) -> Self {
        self.on_close = Some(hook);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Relay bytes until either side closes. Returns the byte counts, or
    /// the error that ended the relay.
    pub async fn run(mut self) -> std::io::Result<BridgeStats> {
        debug!(bridge = self.id, peer = %self.peer, mapping = %self.mapping, "bridge opened");

        let mut stats = BridgeStats::default();
        let result = {
            let (mut host_read, mut host_write) = self.host.split();
            let (mut guest_read, mut guest_write) = tokio::io::split(&mut self.guest);
            tokio::select! {
                r = pump(&mut host_read, &mut guest_write, &mut stats.host_to_guest) => r,
                r = pump(&mut guest_read, &mut host_write, &mut stats.guest_to_host) => r,
            }
        };

        let _ = self.host.shutdown().await;
        let _ = self.guest.shutdown().await;

        let outcome = match result {
            Ok(()) => {
                info!(
                    bridge = self.id,
                    peer = %self.peer,
                    mapping = %self.mapping,
                    host_to_guest = stats.host_to_guest,
                    guest_to_host = stats.guest_to_host,
                    "bridge closed"
                );
                Ok(stats)
            }
            Err(e) => {
                debug!(bridge = self.id, peer = %self.peer, error = %e, "bridge ended with error");
                Err(e)
            }
        };

        if let Some(hook) = self.on_close.take() {
            hook(self.id);
        }
        outcome
    }
}

/// Copy `from` into `to` until end-of-stream, counting bytes as they land.
async fn pump<R, W>(from: &mut R, to: &mut W, count: &mut u64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = from.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        to.write_all(&buf[..n]).await?;
        to.flush().await?;
        *count += n as u64;
    }
}
