//! # vtun
//!
//! A VPN endpoint that carries IP packets over a caller-selected disguise
//! transport, so tunnel traffic blends with ordinary web traffic in
//! filtered network environments.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Orchestrator                      │
//! │         (init → start → stop, release-once)          │
//! ├─────────────────────────────────────────────────────┤
//! │                 Transport Strategies                 │
//! │   udp ws tls grpc quic kcp utls dtls h2 tcp http     │
//! ├─────────────────────────────────────────────────────┤
//! │                 Connection Sniffer                   │
//! │      (single-shot peek, decoy web responses)         │
//! ├─────────────────────────────────────────────────────┤
//! │           Virtual Interface + Derived Key            │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod app;
pub mod config;
pub mod crypto;
pub mod netutil;
pub mod protocol;
pub mod sniff;
pub mod transport;
pub mod tun;

pub use app::App;
pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// I/O buffer size fixed at init (64 KB)
pub const BUFFER_SIZE: usize = 64 * 1024;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Interface error: {0}")]
    Tun(#[from] tun::TunError),

    #[error("Sniff error: {0}")]
    Sniff(#[from] sniff::SniffError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No strategy registered for protocol '{0}'")]
    StrategyUnavailable(transport::ProtocolKind),

    #[error("Not initialized")]
    NotInitialized,

    #[error("Already stopped")]
    AlreadyStopped,
}
