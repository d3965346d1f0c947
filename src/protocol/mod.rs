//! Protocol names and tunnel-wide constants

use std::fmt;
use std::time::Duration;
use tracing::warn;

/// Maximum sealed frame size carried over stream transports
pub const MAX_FRAME_SIZE: usize = 65535;

/// Handshake timeout for stream transports
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// First reconnect delay for clients
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Upper bound on the reconnect delay
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Transport strategy kind.
///
/// Closed set of the eleven wire protocols; `ws` and `wss` share one
/// strategy, the TLS flag deciding whether it is encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
    Udp,
    Ws,
    Tls,
    Grpc,
    Quic,
    Kcp,
    Utls,
    Dtls,
    H2,
    Tcp,
    Http,
}

/// Configuration name → strategy kind (exact, case-sensitive)
const LOOKUP_TABLE: [(&str, ProtocolKind); 12] = [
    ("udp", ProtocolKind::Udp),
    ("ws", ProtocolKind::Ws),
    ("wss", ProtocolKind::Ws),
    ("tls", ProtocolKind::Tls),
    ("grpc", ProtocolKind::Grpc),
    ("quic", ProtocolKind::Quic),
    ("kcp", ProtocolKind::Kcp),
    ("utls", ProtocolKind::Utls),
    ("dtls", ProtocolKind::Dtls),
    ("h2", ProtocolKind::H2),
    ("tcp", ProtocolKind::Tcp),
    ("http", ProtocolKind::Http),
];

impl ProtocolKind {
    /// All strategy kinds
    pub const ALL: [ProtocolKind; 11] = [
        ProtocolKind::Udp,
        ProtocolKind::Ws,
        ProtocolKind::Tls,
        ProtocolKind::Grpc,
        ProtocolKind::Quic,
        ProtocolKind::Kcp,
        ProtocolKind::Utls,
        ProtocolKind::Dtls,
        ProtocolKind::H2,
        ProtocolKind::Tcp,
        ProtocolKind::Http,
    ];

    /// The strategy used when the configured name is not recognized
    pub const DEFAULT: ProtocolKind = ProtocolKind::Udp;

    /// Exact lookup of a configured protocol name
    pub fn lookup(name: &str) -> Option<Self> {
        LOOKUP_TABLE
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, kind)| *kind)
    }

    /// Resolve a configured protocol name, falling back to [`Self::DEFAULT`].
    ///
    /// A typo or a missing protocol field never prevents startup.
    pub fn resolve(name: &str) -> Self {
        match Self::lookup(name) {
            Some(kind) => kind,
            None => {
                warn!(
                    "unrecognized protocol '{}', falling back to {}",
                    name,
                    Self::DEFAULT
                );
                Self::DEFAULT
            }
        }
    }

    /// Canonical configuration name
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Udp => "udp",
            ProtocolKind::Ws => "ws",
            ProtocolKind::Tls => "tls",
            ProtocolKind::Grpc => "grpc",
            ProtocolKind::Quic => "quic",
            ProtocolKind::Kcp => "kcp",
            ProtocolKind::Utls => "utls",
            ProtocolKind::Dtls => "dtls",
            ProtocolKind::H2 => "h2",
            ProtocolKind::Tcp => "tcp",
            ProtocolKind::Http => "http",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
