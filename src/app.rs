//! Orchestrator
//!
//! Owns the configuration, the derived key and the virtual interface, and
//! runs exactly one transport strategy:
//!
//! ```text
//! init  ─▶ discover gateways (client) ─▶ derive key ─▶ create interface
//! start ─▶ resolve protocol ─▶ run_server | run_client (until dropped)
//! stop  ─▶ reset routes ─▶ close interface (once)
//! ```

use crate::config::Config;
use crate::crypto::DerivedKey;
use crate::protocol::ProtocolKind;
use crate::transport::{report, StrategySet, TrafficStats, TunnelContext, STATS_INTERVAL};
use crate::tun::{InterfaceProvider, VirtualInterface};
use crate::{Error, Result, BUFFER_SIZE};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Tunnel endpoint lifecycle
pub struct App<P: InterfaceProvider> {
    config: Arc<Config>,
    provider: P,
    strategies: StrategySet,
    iface: Option<Arc<dyn VirtualInterface>>,
    key: Option<Arc<DerivedKey>>,
    stats: Arc<TrafficStats>,
    stopped: bool,
}

impl<P: InterfaceProvider> App<P> {
    pub fn new(config: Config, provider: P, strategies: StrategySet) -> Self {
        Self {
            config: Arc::new(config),
            provider,
            strategies,
            iface: None,
            key: None,
            stats: Arc::new(TrafficStats::new()),
            stopped: false,
        }
    }

    /// Resolve runtime settings, derive the key and create the interface.
    ///
    /// Any failure here is fatal: nothing can run without an interface.
    pub async fn init(&mut self) -> Result<()> {
        if self.stopped {
            return Err(Error::AlreadyStopped);
        }
        if self.iface.is_some() {
            return Err(Error::Config("already initialized".to_string()));
        }

        let mut config = (*self.config).clone();
        if !config.server_mode {
            config.local_gateway = self.provider.discover_gateway(true);
            config.local_gateway_v6 = self.provider.discover_gateway(false);
            if config.local_gateway.is_none() {
                warn!("no IPv4 default gateway found");
            }
        }
        config.buffer_size = BUFFER_SIZE;
        config.validate()?;

        let key = DerivedKey::derive(&config.key)?;
        let iface = self.provider.create(&config).await?;

        info!(
            iface = %iface.name(),
            mode = if config.server_mode { "server" } else { "client" },
            "vtun {} initialized: {}",
            crate::VERSION,
            config.summary()
        );

        self.config = Arc::new(config);
        self.key = Some(Arc::new(key));
        self.iface = Some(iface);
        Ok(())
    }

    /// Run the configured strategy. Blocks until the future is dropped.
    ///
    /// Unknown or empty protocol names run the default strategy. With
    /// `verbose` set, traffic totals are logged every [`STATS_INTERVAL`].
    pub async fn start(&self) -> Result<()> {
        if self.stopped {
            return Err(Error::AlreadyStopped);
        }
        let (Some(iface), Some(key)) = (&self.iface, &self.key) else {
            return Err(Error::NotInitialized);
        };

        let kind = ProtocolKind::resolve(&self.config.protocol);
        let strategy = self
            .strategies
            .get(kind)
            .ok_or(Error::StrategyUnavailable(kind))?;

        let ctx = TunnelContext {
            iface: iface.clone(),
            config: self.config.clone(),
            key: key.clone(),
            stats: self.stats.clone(),
        };

        let server_mode = self.config.server_mode;
        let run = async {
            if server_mode {
                info!(protocol = %kind, addr = %self.config.local_addr, "starting tunnel server");
                strategy.run_server(ctx).await
            } else {
                info!(protocol = %kind, server = %self.config.server_addr, "starting tunnel client");
                strategy.run_client(ctx).await
            }
        };

        if self.config.verbose {
            tokio::select! {
                result = run => result?,
                _ = report(self.stats.clone(), STATS_INTERVAL, server_mode) => {}
            }
        } else {
            run.await?;
        }
        Ok(())
    }

    /// Reset routes and release the interface. Only the first call acts.
    pub async fn stop(&mut self) -> Result<()> {
        if self.stopped {
            error!("stop called on an already stopped endpoint");
            return Err(Error::AlreadyStopped);
        }
        self.stopped = true;
        self.key = None;

        let Some(iface) = self.iface.take() else {
            debug!("stop before init, nothing to release");
            return Ok(());
        };

        let routes = self.provider.reset_route(&self.config).await;
        if let Err(e) = &routes {
            warn!("Failed to reset routes: {}", e);
        }
        let name = iface.name().to_string();
        self.provider.close(iface).await?;
        routes?;

        info!(iface = %name, "interface released");
        Ok(())
    }

    /// Resolved configuration (runtime fields filled in after init)
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Traffic counters shared with the running strategy
    pub fn stats(&self) -> &TrafficStats {
        &self.stats
    }

    pub fn is_initialized(&self) -> bool {
        self.iface.is_some()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}
