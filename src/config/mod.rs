//! Configuration management

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

/// Default tunnel path for HTTP-shaped transports
pub const DEFAULT_PATH: &str = "/freedom";

/// Default peek timeout for the connection sniffer
pub const DEFAULT_PEEK_TIMEOUT_SECS: u64 = 10;

/// Main configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local address (server listens here, client binds here)
    pub local_addr: String,
    /// Remote server address (client only)
    pub server_addr: String,
    /// Interface address block, e.g. `172.16.0.10/24`
    pub cidr: String,
    /// Optional IPv6 address block
    pub cidr_v6: Option<String>,
    /// Pre-shared key
    pub key: String,
    /// Transport protocol name
    pub protocol: String,
    /// Run as tunnel server
    pub server_mode: bool,
    /// Wrap stream transports in TLS
    pub tls: bool,
    /// TLS certificate chain (PEM, server only)
    pub tls_cert: Option<String>,
    /// TLS private key (PEM, server only)
    pub tls_key: Option<String>,
    /// Extra trusted CA (PEM, client only)
    pub tls_ca: Option<String>,
    /// TLS server name sent by the client
    pub tls_sni: Option<String>,
    /// Request path expected by HTTP-shaped transports
    pub path: String,
    /// Virtual interface name (empty = kernel assigned)
    pub intf: String,
    /// Interface MTU
    pub mtu: u16,
    /// Bound on the sniffer's initial read
    pub peek_timeout_secs: u64,
    /// Log traffic statistics
    pub verbose: bool,
    /// Logging configuration
    pub logging: LoggingConfig,

    /// I/O buffer size, fixed at init
    #[serde(skip)]
    pub buffer_size: usize,
    /// Discovered IPv4 default gateway (client only)
    #[serde(skip)]
    pub local_gateway: Option<IpAddr>,
    /// Discovered IPv6 default gateway (client only)
    #[serde(skip)]
    pub local_gateway_v6: Option<IpAddr>,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Check the settings that init cannot proceed without
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.key.is_empty() {
            return Err(crate::Error::Config("key must not be empty".to_string()));
        }

        self.address_block()?;

        if self.server_mode && self.tls && (self.tls_cert.is_none() || self.tls_key.is_none()) {
            return Err(crate::Error::Config(
                "tls server mode requires tls_cert and tls_key".to_string(),
            ));
        }

        Ok(())
    }

    /// Parse `cidr` into the interface address and prefix length
    pub fn address_block(&self) -> Result<(Ipv4Addr, u8), crate::Error> {
        parse_cidr(&self.cidr)
    }

    /// One-line summary for logs, with the key redacted
    pub fn summary(&self) -> String {
        format!("{:?}", self)
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("local_addr", &self.local_addr)
            .field("server_addr", &self.server_addr)
            .field("cidr", &self.cidr)
            .field("cidr_v6", &self.cidr_v6)
            .field("key", &"<redacted>")
            .field("protocol", &self.protocol)
            .field("server_mode", &self.server_mode)
            .field("tls", &self.tls)
            .field("tls_sni", &self.tls_sni)
            .field("path", &self.path)
            .field("intf", &self.intf)
            .field("mtu", &self.mtu)
            .field("buffer_size", &self.buffer_size)
            .field("local_gateway", &self.local_gateway)
            .field("local_gateway_v6", &self.local_gateway_v6)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_addr: "0.0.0.0:3001".to_string(),
            server_addr: "127.0.0.1:3001".to_string(),
            cidr: "172.16.0.10/24".to_string(),
            cidr_v6: None,
            key: String::new(),
            protocol: "udp".to_string(),
            server_mode: false,
            tls: false,
            tls_cert: None,
            tls_key: None,
            tls_ca: None,
            tls_sni: None,
            path: DEFAULT_PATH.to_string(),
            intf: String::new(),
            mtu: 1500,
            peek_timeout_secs: DEFAULT_PEEK_TIMEOUT_SECS,
            verbose: false,
            logging: LoggingConfig::default(),
            buffer_size: 0,
            local_gateway: None,
            local_gateway_v6: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Parse `a.b.c.d/len`
pub fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u8), crate::Error> {
    let (addr, len) = cidr
        .split_once('/')
        .ok_or_else(|| crate::Error::Config(format!("Invalid cidr '{}'", cidr)))?;

    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|e| crate::Error::Config(format!("Invalid cidr address '{}': {}", addr, e)))?;
    let len: u8 = len
        .parse()
        .map_err(|e| crate::Error::Config(format!("Invalid cidr prefix '{}': {}", len, e)))?;

    if len > 32 {
        return Err(crate::Error::Config(format!("Invalid cidr prefix {}", len)));
    }

    Ok((addr, len))
}

/// Netmask for a prefix length
pub fn prefix_to_netmask(len: u8) -> Ipv4Addr {
    let bits = if len == 0 { 0 } else { u32::MAX << (32 - len.min(32) as u32) };
    Ipv4Addr::from(bits)
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        key: "change-me".to_string(),
        ..Config::default()
    }
}
