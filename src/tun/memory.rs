//! In-process virtual interface backed by channels
//!
//! Used by tests and loopback setups: the [`MemoryPeer`] plays the role of
//! the host network stack on the other side of the interface.

use super::{InterfaceProvider, TunError, VirtualInterface};
use crate::config::Config;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Packets buffered per direction
const CHANNEL_DEPTH: usize = 256;

/// Channel-backed interface
pub struct MemoryInterface {
    name: String,
    from_host: Mutex<mpsc::Receiver<Bytes>>,
    to_host: mpsc::Sender<Bytes>,
}

/// Host side of a [`MemoryInterface`]
pub struct MemoryPeer {
    to_iface: mpsc::Sender<Bytes>,
    from_iface: mpsc::Receiver<Bytes>,
}

impl MemoryInterface {
    /// Create an interface and its host-side peer
    pub fn pair(name: impl Into<String>) -> (Self, MemoryPeer) {
        let (to_iface, from_host) = mpsc::channel(CHANNEL_DEPTH);
        let (to_host, from_iface) = mpsc::channel(CHANNEL_DEPTH);

        (
            Self {
                name: name.into(),
                from_host: Mutex::new(from_host),
                to_host,
            },
            MemoryPeer {
                to_iface,
                from_iface,
            },
        )
    }
}

#[async_trait]
impl VirtualInterface for MemoryInterface {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize, TunError> {
        let packet = self
            .from_host
            .lock()
            .await
            .recv()
            .await
            .ok_or(TunError::Closed)?;

        let n = packet.len().min(buf.len());
        buf[..n].copy_from_slice(&packet[..n]);
        Ok(n)
    }

    async fn send(&self, packet: &[u8]) -> Result<usize, TunError> {
        self.to_host
            .send(Bytes::copy_from_slice(packet))
            .await
            .map_err(|_| TunError::Closed)?;
        Ok(packet.len())
    }
}

impl MemoryPeer {
    /// Hand a packet to the interface, as if the host routed it there
    pub async fn inject(&self, packet: impl Into<Bytes>) -> Result<(), TunError> {
        self.to_iface
            .send(packet.into())
            .await
            .map_err(|_| TunError::Closed)
    }

    /// Next packet the interface delivered to the host
    pub async fn next_packet(&mut self) -> Option<Bytes> {
        self.from_iface.recv().await
    }
}

/// Provider handing out [`MemoryInterface`]s and recording lifecycle calls
#[derive(Default)]
pub struct MemoryProvider {
    peers: std::sync::Mutex<Vec<MemoryPeer>>,
    gateway_v4: Option<IpAddr>,
    gateway_v6: Option<IpAddr>,
    fail_create: AtomicBool,
    created: AtomicUsize,
    route_resets: AtomicUsize,
    closes: AtomicUsize,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report fixed gateways instead of reading host tables
    pub fn with_gateways(mut self, v4: Option<IpAddr>, v6: Option<IpAddr>) -> Self {
        self.gateway_v4 = v4;
        self.gateway_v6 = v6;
        self
    }

    /// Make subsequent `create` calls fail
    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Take the host-side peer of the most recently created interface
    pub fn take_peer(&self) -> Option<MemoryPeer> {
        self.peers.lock().ok()?.pop()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn route_resets(&self) -> usize {
        self.route_resets.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InterfaceProvider for MemoryProvider {
    async fn create(&self, config: &Config) -> Result<Arc<dyn VirtualInterface>, TunError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(TunError::Create("creation disabled".to_string()));
        }

        let index = self.created.fetch_add(1, Ordering::SeqCst);
        let name = if config.intf.is_empty() {
            format!("mem{}", index)
        } else {
            config.intf.clone()
        };

        let (iface, peer) = MemoryInterface::pair(name);
        if let Ok(mut peers) = self.peers.lock() {
            peers.push(peer);
        }
        debug!(name = %iface.name(), cidr = %config.cidr, "memory interface created");
        Ok(Arc::new(iface))
    }

    async fn reset_route(&self, _config: &Config) -> Result<(), TunError> {
        self.route_resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self, iface: Arc<dyn VirtualInterface>) -> Result<(), TunError> {
        debug!(name = %iface.name(), "memory interface closed");
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn discover_gateway(&self, ipv4: bool) -> Option<IpAddr> {
        if ipv4 {
            self.gateway_v4
        } else {
            self.gateway_v6
        }
    }
}
