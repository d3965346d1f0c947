//! Moving packets between the virtual interface and framed streams
//!
//! Clients have one stream and use [`pump`]. Servers share one interface
//! between many peers: a [`PeerRouter`] learns each peer's tunnel address
//! from the source of the packets it sends and dispatches packets read from
//! the interface by destination address.

use super::{read_frame, write_frame, TrafficStats, TransportError};
use crate::crypto::Cipher;
use crate::tun::VirtualInterface;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Packets queued per peer before the router starts dropping
const PEER_QUEUE_DEPTH: usize = 512;

/// Pump packets between `iface` and `stream` until either side closes
pub async fn pump<S>(
    iface: Arc<dyn VirtualInterface>,
    stream: S,
    cipher: Arc<Cipher>,
    stats: Arc<TrafficStats>,
    buffer_size: usize,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    tokio::select! {
        result = iface_to_stream(iface.as_ref(), &mut writer, &cipher, &stats, buffer_size) => result,
        result = stream_to_iface(iface.as_ref(), &mut reader, &cipher, &stats) => result,
    }
}

async fn iface_to_stream<W>(
    iface: &dyn VirtualInterface,
    writer: &mut W,
    cipher: &Cipher,
    stats: &TrafficStats,
    buffer_size: usize,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = iface.recv(&mut buf).await?;
        trace!(len = n, "iface -> stream");
        write_frame(writer, cipher, &buf[..n]).await?;
        stats.record_sent(n);
    }
}

async fn stream_to_iface<R>(
    iface: &dyn VirtualInterface,
    reader: &mut R,
    cipher: &Cipher,
    stats: &TrafficStats,
) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let packet = read_frame(reader, cipher).await?;
        trace!(len = packet.len(), "stream -> iface");
        iface.send(&packet).await?;
        stats.record_received(packet.len());
    }
}

/// Source and destination address of an IP packet
pub fn packet_addrs(packet: &[u8]) -> Option<(IpAddr, IpAddr)> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => {
            let src: [u8; 4] = packet[12..16].try_into().ok()?;
            let dst: [u8; 4] = packet[16..20].try_into().ok()?;
            Some((Ipv4Addr::from(src).into(), Ipv4Addr::from(dst).into()))
        }
        6 if packet.len() >= 40 => {
            let src: [u8; 16] = packet[8..24].try_into().ok()?;
            let dst: [u8; 16] = packet[24..40].try_into().ok()?;
            Some((Ipv6Addr::from(src).into(), Ipv6Addr::from(dst).into()))
        }
        _ => None,
    }
}

type PeerMap = HashMap<IpAddr, mpsc::Sender<Bytes>>;

/// Shares one interface between many tunnel peers
#[derive(Clone)]
pub struct PeerRouter {
    iface: Arc<dyn VirtualInterface>,
    peers: Arc<Mutex<PeerMap>>,
    stats: Arc<TrafficStats>,
}

impl PeerRouter {
    pub fn new(iface: Arc<dyn VirtualInterface>, stats: Arc<TrafficStats>) -> Self {
        Self {
            iface,
            peers: Arc::new(Mutex::new(HashMap::new())),
            stats,
        }
    }

    /// Number of peers with a learned address
    pub fn peer_count(&self) -> usize {
        self.peers.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Read the interface and fan packets out to peers until it closes
    pub async fn dispatch(self, buffer_size: usize) -> Result<(), TransportError> {
        let mut buf = vec![0u8; buffer_size];
        loop {
            let n = self.iface.recv(&mut buf).await?;
            let packet = &buf[..n];

            let Some((_, dst)) = packet_addrs(packet) else {
                trace!(len = n, "dropping non-IP packet");
                continue;
            };

            let sender = self.peers.lock().ok().and_then(|p| p.get(&dst).cloned());
            match sender {
                Some(tx) => {
                    if tx.try_send(Bytes::copy_from_slice(packet)).is_err() {
                        debug!(%dst, "peer queue full or gone, dropping packet");
                    }
                }
                None => trace!(%dst, "no peer for destination"),
            }
        }
    }

    /// Serve one peer connection until it closes
    pub async fn serve<S>(&self, stream: S, cipher: Arc<Cipher>) -> Result<(), TransportError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::channel::<Bytes>(PEER_QUEUE_DEPTH);
        let mut learned: Option<IpAddr> = None;

        let result = tokio::select! {
            result = self.peer_to_iface(&mut reader, &cipher, &tx, &mut learned) => result,
            result = queue_to_peer(&mut rx, &mut writer, &cipher, &self.stats) => result,
        };

        if let Some(addr) = learned {
            self.unregister(addr, &tx);
        }
        result
    }

    async fn peer_to_iface<R>(
        &self,
        reader: &mut R,
        cipher: &Cipher,
        tx: &mpsc::Sender<Bytes>,
        learned: &mut Option<IpAddr>,
    ) -> Result<(), TransportError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let packet = read_frame(reader, cipher).await?;
            if let Some((src, _)) = packet_addrs(&packet) {
                if *learned != Some(src) {
                    self.register(src, tx.clone());
                    if let Some(old) = learned.replace(src) {
                        self.unregister(old, tx);
                    }
                }
            }
            self.iface.send(&packet).await?;
            self.stats.record_received(packet.len());
        }
    }

    fn register(&self, addr: IpAddr, tx: mpsc::Sender<Bytes>) {
        match self.peers.lock() {
            Ok(mut peers) => {
                if peers.insert(addr, tx).is_some() {
                    warn!(%addr, "tunnel address taken over by a new peer");
                } else {
                    debug!(%addr, "peer registered");
                }
            }
            Err(_) => warn!("peer table poisoned"),
        }
    }

    /// Drop the route for `addr` if it still points at this connection's queue.
    ///
    /// A reconnecting peer may have taken the address over already.
    fn unregister(&self, addr: IpAddr, tx: &mpsc::Sender<Bytes>) {
        if let Ok(mut peers) = self.peers.lock() {
            if peers.get(&addr).is_some_and(|current| current.same_channel(tx)) {
                peers.remove(&addr);
                debug!(%addr, "peer unregistered");
            }
        }
    }
}

async fn queue_to_peer<W>(
    rx: &mut mpsc::Receiver<Bytes>,
    writer: &mut W,
    cipher: &Cipher,
    stats: &TrafficStats,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(packet) = rx.recv().await {
        write_frame(writer, cipher, &packet).await?;
        stats.record_sent(packet.len());
    }
    Ok(())
}
