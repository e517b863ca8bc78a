//! TCP port forwarder.
//!
//! Makes every configured guest TCP port reachable as a host TCP port without
//! any network-layer address translation:
//!
//! ```text
//! 127.0.0.1:<host_port> ──accept──► open guest channel <base + guest_port>
//!                                        └─► ConnectionBridge (one per connection)
//! ```
//!
//! Startup is all-or-nothing: the guest must acknowledge `FORWARD` for every
//! mapping before a single listener is bound. Guest channels are opened fresh
//! for every accepted connection and never pooled.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::bridge::{CloseHook, ConnectionBridge};
use super::{ChannelOpener, ControlClient};
use crate::config::PortMapping;
use crate::error::SupervisorError;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("host port {port} is already in use")]
    PortInUse { port: u16 },

    #[error("forwarding setup failed for port {port}: {reason}")]
    Rejected { port: u16, reason: String },

    #[error("failed to bind host port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

impl From<ForwardError> for SupervisorError {
    fn from(err: ForwardError) -> Self {
        match err {
            ForwardError::PortInUse { port } => SupervisorError::PortInUse { port },
            ForwardError::Rejected { port, .. } => SupervisorError::ForwardingRejected { port },
            ForwardError::Bind { port, source } => SupervisorError::Listen {
                port,
                reason: source.to_string(),
            },
        }
    }
}

/// Test-bind `port` on the loopback interface and release it again.
///
/// Detects a host port held by another process before any guest-side setup
/// happens.
pub fn probe_host_port(port: u16) -> Result<(), ForwardError> {
    match std::net::TcpListener::bind(("127.0.0.1", port)) {
        Ok(listener) => {
            drop(listener);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => Err(ForwardError::PortInUse { port }),
        Err(source) => Err(ForwardError::Bind { port, source }),
    }
}

// ---------------------------------------------------------------------------
// Bridge registry
// ---------------------------------------------------------------------------

/// Live bridges keyed by id. The forwarder holds the only strong reference;
/// bridges reach it through a `Weak` close hook.
#[derive(Default)]
struct BridgeRegistry {
    live: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl BridgeRegistry {
    fn close_hook(self: &Arc<Self>) -> CloseHook {
        let registry: Weak<Self> = Arc::downgrade(self);
        Box::new(move |id| {
            if let Some(registry) = registry.upgrade() {
                registry
                    .live
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
            }
        })
    }

    /// Spawn `task` and register it under `id`. The lock is held across the
    /// spawn so a task that finishes immediately cannot unregister before it
    /// was registered.
    fn spawn<F>(&self, id: u64, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = tokio::spawn(task);
        live.insert(id, handle);
    }

    fn len(&self) -> usize {
        self.live.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Abort every live bridge and wait until each task has finished.
    async fn cancel_all(&self) -> usize {
        let handles: Vec<JoinHandle<()>> = self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, handle)| handle)
            .collect();

        let count = handles.len();
        for handle in &handles {
            handle.abort();
        }
        join_all(handles).await;
        count
    }

    fn abort_all(&self) {
        for (_, handle) in self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
        {
            handle.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// PortForwarder
// ---------------------------------------------------------------------------

pub struct PortForwarder {
    control: ControlClient,
    listeners: Vec<JoinHandle<()>>,
    local_addrs: Vec<SocketAddr>,
    bridges: Arc<BridgeRegistry>,
    rebuilds: usize,
}

impl PortForwarder {
    /// Ask the guest to forward every mapping, then bind one listener per
    /// mapping. Nothing is bound unless every mapping was acknowledged.
    pub async fn start(
        mappings: &[PortMapping],
        channel_port_base: u32,
        control: ControlClient,
        opener: Arc<dyn ChannelOpener>,
    ) -> Result<Self, ForwardError> {
        let replies = join_all(mappings.iter().map(|mapping| {
            let control = control.clone();
            let channel_port = mapping.channel_port(channel_port_base);
            let guest_port = mapping.guest_port;
            async move { control.forward(channel_port, guest_port).await }
        }))
        .await;

        for (mapping, reply) in mappings.iter().zip(replies) {
            if let Err(reason) = reply {
                warn!(mapping = %mapping, reason = %reason, "guest rejected port forwarding");
                spawn_forward_stop(control.clone());
                return Err(ForwardError::Rejected {
                    port: mapping.guest_port,
                    reason,
                });
            }
        }

        let mut bound = Vec::with_capacity(mappings.len());
        for mapping in mappings {
            match TcpListener::bind(("127.0.0.1", mapping.host_port)).await {
                Ok(listener) => bound.push((*mapping, listener)),
                Err(e) => {
                    spawn_forward_stop(control.clone());
                    if e.kind() == std::io::ErrorKind::AddrInUse {
                        return Err(ForwardError::PortInUse {
                            port: mapping.host_port,
                        });
                    }
                    return Err(ForwardError::Bind {
                        port: mapping.host_port,
                        source: e,
                    });
                }
            }
        }

        let bridges = Arc::new(BridgeRegistry::default());
        let next_id = Arc::new(AtomicU64::new(1));
        let mut listeners = Vec::with_capacity(bound.len());
        let mut local_addrs = Vec::with_capacity(bound.len());

        for (mapping, listener) in bound {
            let addr = listener.local_addr().map_err(|source| ForwardError::Bind {
                port: mapping.host_port,
                source,
            })?;
            info!(mapping = %mapping, addr = %addr, "forwarding host port");
            local_addrs.push(addr);
            listeners.push(tokio::spawn(accept_loop(
                listener,
                mapping,
                mapping.channel_port(channel_port_base),
                Arc::clone(&opener),
                Arc::clone(&bridges),
                Arc::clone(&next_id),
            )));
        }

        Ok(Self {
            control,
            listeners,
            local_addrs,
            bridges,
            rebuilds: 0,
        })
    }

    /// Host addresses the listeners are bound to.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn live_bridges(&self) -> usize {
        self.bridges.len()
    }

    /// How many times [`Self::rebuild_connections`] ran.
    pub fn rebuild_count(&self) -> usize {
        self.rebuilds
    }

    /// Drop every live bridge but keep the listeners bound, so host-side
    /// addresses stay valid across a guest suspend.
    pub async fn rebuild_connections(&mut self) -> usize {
        let cancelled = self.bridges.cancel_all().await;
        self.rebuilds += 1;
        info!(cancelled, "rebuilt forwarded connections");
        cancelled
    }

    /// Cancel every bridge and listener, then ask the guest to stop
    /// forwarding without waiting for the acknowledgement.
    pub async fn stop(mut self) {
        for listener in &self.listeners {
            listener.abort();
        }
        join_all(self.listeners.drain(..)).await;

        let cancelled = self.bridges.cancel_all().await;
        debug!(cancelled, "port forwarder stopped");

        spawn_forward_stop(self.control.clone());
    }
}

impl Drop for PortForwarder {
    fn drop(&mut self) {
        for listener in &self.listeners {
            listener.abort();
        }
        self.bridges.abort_all();
    }
}

fn spawn_forward_stop(control: ControlClient) {
    tokio::spawn(async move {
        if !control.forward_stop().await {
            debug!("FORWARD-STOP was not acknowledged");
        }
    });
}

async fn accept_loop(
    listener: TcpListener,
    mapping: PortMapping,
    channel_port: u32,
    opener: Arc<dyn ChannelOpener>,
    bridges: Arc<BridgeRegistry>,
    next_id: Arc<AtomicU64>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(mapping = %mapping, error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let id = next_id.fetch_add(1, Ordering::Relaxed);
        let opener = Arc::clone(&opener);
        let close = bridges.close_hook();

        bridges.spawn(id, async move {
            let guest = match opener.open_channel(channel_port).await {
                Ok(guest) => guest,
                Err(e) => {
                    warn!(mapping = %mapping, peer = %peer, error = %e, "could not open guest channel; dropping connection");
                    close(id);
                    return;
                }
            };
            let bridge = ConnectionBridge::new(id, mapping, peer, stream, guest).on_close(close);
            let _ = bridge.run().await;
        });
    }
}
