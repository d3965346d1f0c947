//! Datagram strategy
//!
//! Every IP packet travels as exactly one UDP datagram holding the sealed
//! packet (`nonce || ciphertext || tag`), with no extra framing. The server
//! learns each peer's UDP address from the source of its datagrams, keyed
//! by the tunnel address inside the packet, and routes interface packets
//! back by destination address. Datagrams that fail to open are dropped.

use super::runner::reconnect_loop;
use super::{packet_addrs, TrafficStats, TransportError, TransportStrategy, TunnelContext};
use crate::crypto::{Cipher, SEAL_OVERHEAD};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

type PeerAddrs = Mutex<HashMap<IpAddr, SocketAddr>>;

/// UDP strategy
#[derive(Debug, Default, Clone)]
pub struct UdpStrategy;

impl UdpStrategy {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportStrategy for UdpStrategy {
    async fn run_server(&self, ctx: TunnelContext) -> Result<(), TransportError> {
        let cipher = Cipher::from_key(&ctx.key)?;
        let socket = UdpSocket::bind(&ctx.config.local_addr).await?;
        info!(
            protocol = "udp",
            addr = %ctx.config.local_addr,
            iface = %ctx.iface.name(),
            "tunnel server listening"
        );

        let peers = PeerAddrs::default();
        tokio::select! {
            result = server_inbound(&socket, &ctx, &cipher, &peers) => result,
            result = server_outbound(&socket, &ctx, &cipher, &peers) => result,
        }
    }

    async fn run_client(&self, ctx: TunnelContext) -> Result<(), TransportError> {
        let cipher = Arc::new(Cipher::from_key(&ctx.key)?);

        reconnect_loop("udp", || {
            let ctx = ctx.clone();
            let cipher = cipher.clone();
            async move {
                let socket = connect(&ctx.config.server_addr).await?;
                info!(server = %ctx.config.server_addr, "udp tunnel ready");

                // Only a session that heard from the server counts as established
                let before = ctx.stats.snapshot().received_packets;
                let result = client_session(&socket, &ctx, &cipher).await;
                let heard = ctx.stats.snapshot().received_packets > before;

                match result {
                    Err(e) if !heard => Err(e),
                    Err(e) => {
                        info!("udp tunnel closed: {}", e);
                        Ok(())
                    }
                    Ok(()) => Ok(()),
                }
            }
        })
        .await
    }
}

/// Bind a socket of the right family and connect it to `addr`
async fn connect(addr: &str) -> Result<UdpSocket, TransportError> {
    let server = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", addr, e)))?
        .next()
        .ok_or_else(|| TransportError::ConnectionFailed(format!("{}: no address", addr)))?;

    let bind = if server.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(server).await?;
    Ok(socket)
}

fn datagram_buffer(ctx: &TunnelContext) -> Vec<u8> {
    vec![0u8; ctx.buffer_size() + SEAL_OVERHEAD]
}

/// Peer datagrams into the interface, learning peer addresses
async fn server_inbound(
    socket: &UdpSocket,
    ctx: &TunnelContext,
    cipher: &Cipher,
    peers: &PeerAddrs,
) -> Result<(), TransportError> {
    let mut buf = datagram_buffer(ctx);
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                debug!("udp receive error: {}", e);
                continue;
            }
        };

        let packet = match cipher.open(&buf[..n]) {
            Ok(packet) => packet,
            Err(_) => {
                trace!(%from, len = n, "dropping datagram that does not open");
                continue;
            }
        };

        if let Some((src, _)) = packet_addrs(&packet) {
            learn(peers, src, from);
        }
        ctx.iface.send(&packet).await?;
        ctx.stats.record_received(packet.len());
    }
}

fn learn(peers: &PeerAddrs, tunnel_addr: IpAddr, from: SocketAddr) {
    let Ok(mut peers) = peers.lock() else {
        warn!("peer table poisoned");
        return;
    };
    match peers.insert(tunnel_addr, from) {
        Some(old) if old == from => {}
        Some(old) => info!(%tunnel_addr, %old, new = %from, "udp peer moved"),
        None => info!(%tunnel_addr, %from, "udp peer registered"),
    }
}

/// Interface packets out to the peer owning their destination
async fn server_outbound(
    socket: &UdpSocket,
    ctx: &TunnelContext,
    cipher: &Cipher,
    peers: &PeerAddrs,
) -> Result<(), TransportError> {
    let mut buf = vec![0u8; ctx.buffer_size()];
    loop {
        let n = ctx.iface.recv(&mut buf).await?;
        let packet = &buf[..n];

        let Some((_, dst)) = packet_addrs(packet) else {
            trace!(len = n, "dropping non-IP packet");
            continue;
        };
        let peer = peers.lock().ok().and_then(|p| p.get(&dst).copied());
        let Some(peer) = peer else {
            trace!(%dst, "no peer for destination");
            continue;
        };

        send_sealed(socket, cipher, packet, Some(peer), &ctx.stats).await;
    }
}

/// Seal and send one packet; failures drop the packet
async fn send_sealed(
    socket: &UdpSocket,
    cipher: &Cipher,
    packet: &[u8],
    to: Option<SocketAddr>,
    stats: &TrafficStats,
) {
    let sealed = match cipher.seal(packet) {
        Ok(sealed) => sealed,
        Err(e) => {
            warn!("failed to seal packet: {}", e);
            return;
        }
    };

    let sent = match to {
        Some(peer) => socket.send_to(&sealed, peer).await,
        None => socket.send(&sealed).await,
    };
    match sent {
        Ok(_) => stats.record_sent(packet.len()),
        Err(e) => debug!("udp send error: {}", e),
    }
}

/// Move packets over a connected socket until it reports an error
async fn client_session(
    socket: &UdpSocket,
    ctx: &TunnelContext,
    cipher: &Cipher,
) -> Result<(), TransportError> {
    tokio::select! {
        result = client_outbound(socket, ctx, cipher) => result,
        result = client_inbound(socket, ctx, cipher) => result,
    }
}

async fn client_outbound(
    socket: &UdpSocket,
    ctx: &TunnelContext,
    cipher: &Cipher,
) -> Result<(), TransportError> {
    let mut buf = vec![0u8; ctx.buffer_size()];
    loop {
        let n = ctx.iface.recv(&mut buf).await?;
        send_sealed(socket, cipher, &buf[..n], None, &ctx.stats).await;
    }
}

async fn client_inbound(
    socket: &UdpSocket,
    ctx: &TunnelContext,
    cipher: &Cipher,
) -> Result<(), TransportError> {
    let mut buf = datagram_buffer(ctx);
    loop {
        // ICMP unreachable surfaces here as ConnectionRefused and ends the session
        let n = socket.recv(&mut buf).await?;
        match cipher.open(&buf[..n]) {
            Ok(packet) => {
                ctx.iface.send(&packet).await?;
                ctx.stats.record_received(packet.len());
            }
            Err(_) => trace!(len = n, "dropping datagram that does not open"),
        }
    }
}
