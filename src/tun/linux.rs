//! Kernel TUN device provider (Linux)

use super::{InterfaceProvider, TunError, VirtualInterface};
use crate::config::{prefix_to_netmask, Config};
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::process::Command;
use tokio_tun::{Tun, TunBuilder};
use tracing::{info, warn};

/// Kernel TUN device
pub struct LinuxTun {
    name: String,
    tun: Tun,
}

#[async_trait]
impl VirtualInterface for LinuxTun {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize, TunError> {
        let n = self.tun.recv(buf).await?;
        if n == 0 {
            return Err(TunError::Closed);
        }
        Ok(n)
    }

    async fn send(&self, packet: &[u8]) -> Result<usize, TunError> {
        Ok(self.tun.send(packet).await?)
    }
}

/// Creates TUN devices and manages the client's split default routes
#[derive(Debug, Default)]
pub struct LinuxTunProvider;

impl LinuxTunProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl InterfaceProvider for LinuxTunProvider {
    async fn create(&self, config: &Config) -> Result<Arc<dyn VirtualInterface>, TunError> {
        let (address, prefix_len) = config
            .address_block()
            .map_err(|e| TunError::Create(e.to_string()))?;

        let mut builder = TunBuilder::new();
        if !config.intf.is_empty() {
            builder = builder.name(&config.intf);
        }

        // TUN mode without packet info is the builder default
        let tun = builder
            .mtu(config.mtu as i32)
            .address(address)
            .netmask(prefix_to_netmask(prefix_len))
            .up()
            .try_build()
            .map_err(|e| TunError::Create(e.to_string()))?;

        let name = tun.name().to_string();
        info!(name = %name, cidr = %config.cidr, mtu = config.mtu, "TUN device created");

        if let Some(cidr_v6) = &config.cidr_v6 {
            run_ip(&["-6", "addr", "add", cidr_v6, "dev", &name]).await?;
        }

        if !config.server_mode {
            setup_client_routes(&name, config).await?;
        }

        Ok(Arc::new(LinuxTun { name, tun }))
    }

    async fn reset_route(&self, config: &Config) -> Result<(), TunError> {
        if config.server_mode {
            return Ok(());
        }

        if let (Some(server), Some(gateway)) = (server_ip(config), config.local_gateway) {
            let host = host_route(server);
            if let Err(e) = run_ip(&["route", "del", &host, "via", &gateway.to_string()]).await {
                warn!("failed to remove server route (may not exist): {}", e);
            }
        }

        info!("routing restored");
        Ok(())
    }

    async fn close(&self, iface: Arc<dyn VirtualInterface>) -> Result<(), TunError> {
        // The device is removed by the kernel once the last handle drops
        info!(name = %iface.name(), "TUN device released");
        drop(iface);
        Ok(())
    }
}

/// Route everything through the tunnel except the path to the server
async fn setup_client_routes(name: &str, config: &Config) -> Result<(), TunError> {
    run_ip(&["route", "add", "0.0.0.0/1", "dev", name]).await?;
    run_ip(&["route", "add", "128.0.0.0/1", "dev", name]).await?;

    match (server_ip(config), config.local_gateway) {
        (Some(server), Some(gateway)) => {
            run_ip(&["route", "add", &host_route(server), "via", &gateway.to_string()]).await?;
        }
        _ => warn!("no server route pinned (server address or local gateway unknown)"),
    }

    info!(tun = %name, "client routing configured");
    Ok(())
}

fn server_ip(config: &Config) -> Option<IpAddr> {
    config
        .server_addr
        .parse::<SocketAddr>()
        .map(|addr| addr.ip())
        .or_else(|_| config.server_addr.parse::<IpAddr>())
        .ok()
}

fn host_route(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(ip) => format!("{}/32", ip),
        IpAddr::V6(ip) => format!("{}/128", ip),
    }
}

async fn run_ip(args: &[&str]) -> Result<(), TunError> {
    let status = Command::new("ip").args(args).status().await?;
    if !status.success() {
        return Err(TunError::Route(format!("ip {} exited with {}", args.join(" "), status)));
    }
    Ok(())
}
