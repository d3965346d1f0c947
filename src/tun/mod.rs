//! Virtual interface collaborators
//!
//! The orchestrator owns exactly one [`VirtualInterface`], obtained from an
//! [`InterfaceProvider`] during init and handed back to it on stop.
//! Strategies only see the interface through `Arc<dyn VirtualInterface>`.

mod memory;

#[cfg(feature = "tun")]
mod linux;

pub use memory::{MemoryInterface, MemoryPeer, MemoryProvider};

#[cfg(feature = "tun")]
pub use linux::LinuxTunProvider;

use crate::config::Config;
use async_trait::async_trait;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

/// Virtual interface errors
#[derive(Debug, Error)]
pub enum TunError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Interface creation failed: {0}")]
    Create(String),

    #[error("Route command failed: {0}")]
    Route(String),

    #[error("Interface closed")]
    Closed,
}

/// Packet I/O endpoint exchanging raw IP packets with user space
#[async_trait]
pub trait VirtualInterface: Send + Sync {
    /// Interface name
    fn name(&self) -> &str;

    /// Receive one packet from the host stack
    async fn recv(&self, buf: &mut [u8]) -> Result<usize, TunError>;

    /// Inject one packet into the host stack
    async fn send(&self, packet: &[u8]) -> Result<usize, TunError>;
}

/// Creates, routes and releases virtual interfaces
#[async_trait]
pub trait InterfaceProvider: Send + Sync {
    /// Create an interface bound to the configured address block
    async fn create(&self, config: &Config) -> Result<Arc<dyn VirtualInterface>, TunError>;

    /// Undo OS routing state associated with the address block
    async fn reset_route(&self, config: &Config) -> Result<(), TunError>;

    /// Release the interface
    async fn close(&self, iface: Arc<dyn VirtualInterface>) -> Result<(), TunError>;

    /// Default gateway of the host uplink
    fn discover_gateway(&self, ipv4: bool) -> Option<IpAddr> {
        crate::netutil::discover_gateway(ipv4)
    }
}
