//! Transport strategies
//!
//! Every wire protocol implements [`TransportStrategy`]: run as tunnel
//! server or tunnel client, given a [`TunnelContext`]. Both entry points
//! block until cancelled (the future is dropped) and own their connection
//! handling, framing, encryption and retry logic.
//!
//! Strategies shipped here:
//! - `udp`: one sealed packet per datagram (the default)
//! - `tcp`: raw stream sockets
//! - `http`: plain HTTP upgrade with sniffing and decoy responses (TLS when
//!   `config.tls` is set)

mod frame;
mod http;
mod pump;
mod runner;
mod stats;
mod tcp;
mod udp;

#[cfg(feature = "tls")]
mod tls;

pub use frame::{read_frame, write_frame};
pub use http::HttpStrategy;
pub use pump::{packet_addrs, pump, PeerRouter};
pub use stats::{format_bytes, report, StatsSnapshot, TrafficStats, STATS_INTERVAL};
pub use tcp::TcpStrategy;
pub use udp::UdpStrategy;

pub use crate::protocol::ProtocolKind;

use crate::config::Config;
use crate::crypto::{CryptoError, DerivedKey};
use crate::sniff::SniffError;
use crate::protocol::{INITIAL_BACKOFF, MAX_BACKOFF};
use crate::tun::{TunError, VirtualInterface};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Interface error: {0}")]
    Tun(#[from] TunError),

    #[error("Sniff error: {0}")]
    Sniff(#[from] SniffError),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,
}

/// Everything a strategy needs to run a tunnel
#[derive(Clone)]
pub struct TunnelContext {
    /// The orchestrator's virtual interface
    pub iface: Arc<dyn VirtualInterface>,
    /// Resolved configuration snapshot
    pub config: Arc<Config>,
    /// Key derived at init
    pub key: Arc<DerivedKey>,
    /// Traffic counters owned by the orchestrator
    pub stats: Arc<TrafficStats>,
}

impl TunnelContext {
    /// Packet buffer size, as fixed by init
    pub fn buffer_size(&self) -> usize {
        if self.config.buffer_size == 0 {
            crate::BUFFER_SIZE
        } else {
            self.config.buffer_size
        }
    }
}

/// A tunnel implementation over one wire protocol
#[async_trait]
pub trait TransportStrategy: Send + Sync {
    /// Accept tunnel peers until cancelled
    async fn run_server(&self, ctx: TunnelContext) -> Result<(), TransportError>;

    /// Keep a tunnel to the server up until cancelled
    async fn run_client(&self, ctx: TunnelContext) -> Result<(), TransportError>;
}

/// Registry of strategies by kind
#[derive(Clone, Default)]
pub struct StrategySet {
    strategies: HashMap<ProtocolKind, Arc<dyn TransportStrategy>>,
}

impl StrategySet {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the strategies shipped in this crate
    pub fn builtin() -> Self {
        Self::new()
            .with(ProtocolKind::Udp, UdpStrategy::new())
            .with(ProtocolKind::Tcp, TcpStrategy::new())
            .with(ProtocolKind::Http, HttpStrategy::new())
    }

    /// Register (or replace) the strategy for `kind`
    pub fn with(mut self, kind: ProtocolKind, strategy: impl TransportStrategy + 'static) -> Self {
        self.strategies.insert(kind, Arc::new(strategy));
        self
    }

    pub fn get(&self, kind: ProtocolKind) -> Option<Arc<dyn TransportStrategy>> {
        self.strategies.get(&kind).cloned()
    }

    pub fn contains(&self, kind: ProtocolKind) -> bool {
        self.strategies.contains_key(&kind)
    }
}

/// Exponential reconnect delay for clients
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            current: initial,
            max,
        }
    }

    /// Delay to wait before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Start over after a successful session
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_BACKOFF, MAX_BACKOFF)
    }
}
