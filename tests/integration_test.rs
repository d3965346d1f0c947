//! Integration tests for vtun
//!
//! Covers the full flow over real loopback sockets:
//! - Sniffing and decoy responses on accepted TCP connections
//! - Protocol resolution and server/client dispatch
//! - Packet delivery through the udp, tcp and http strategies

use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use vtun::protocol::ProtocolKind;
use vtun::sniff::{Classification, SniffConn, SniffError, DECOY_CONTENT_LENGTH, DECOY_RESPONSE};
use vtun::transport::{StrategySet, TransportError, TransportStrategy, TunnelContext};
use vtun::tun::{MemoryPeer, MemoryProvider};
use vtun::{App, Config, Error};

const WAIT: Duration = Duration::from_secs(10);

/// Accept one connection and sniff it, with `client` as the peer's script
async fn sniff_tcp(client_bytes: &'static [u8]) -> (SniffConn<TcpStream>, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(client_bytes).await.unwrap();

    let (stream, _) = listener.accept().await.unwrap();
    let conn = SniffConn::with_timeout(stream, Duration::from_secs(2)).await;
    (conn, client)
}

#[tokio::test]
async fn test_sniff_http_request_over_tcp() {
    let (mut conn, client) = sniff_tcp(b"GET /foo HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert_eq!(conn.classification(), Classification::HttpRequest);
    assert_eq!(conn.path(), "/foo");

    drop(client);
    let mut all = Vec::new();
    conn.read_to_end(&mut all).await.unwrap();
    assert_eq!(all, b"GET /foo HTTP/1.1\r\nHost: x\r\n\r\n");
}

#[tokio::test]
async fn test_sniff_http2_preface_over_tcp() {
    let (conn, _client) = sniff_tcp(b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n").await;
    assert_eq!(conn.classification(), Classification::Http2Preface);
}

#[tokio::test]
async fn test_sniff_closed_connection_is_unknown() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
    drop(client);

    let (stream, _) = listener.accept().await.unwrap();
    let conn = SniffConn::with_timeout(stream, Duration::from_secs(2)).await;
    assert_eq!(conn.classification(), Classification::Unknown);
    assert!(conn.prefix().is_empty());
}

#[tokio::test]
async fn test_sniff_stream_matches_raw_stream() {
    let mut payload = b"\x16\x03\x01\x02\x00".to_vec();
    payload.extend((0..=255u8).cycle().take(5000));
    let expected = payload.clone();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let writer = tokio::spawn(async move {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&payload).await.unwrap();
    });

    let (stream, _) = listener.accept().await.unwrap();
    let mut conn = SniffConn::new(stream).await;
    assert_eq!(conn.classification(), Classification::Unknown);

    writer.await.unwrap();
    let mut all = Vec::new();
    conn.read_to_end(&mut all).await.unwrap();
    assert_eq!(all, expected);
}

#[tokio::test]
async fn test_sniff_usage_errors() {
    let (mut conn, _client) = sniff_tcp(b"GET /a HTTP/1.1\r\n\r\n").await;
    assert!(matches!(conn.peek(8).await, Err(SniffError::AlreadyPeeked)));

    let mut byte = [0u8; 1];
    conn.read_exact(&mut byte).await.unwrap();
    assert!(matches!(conn.peek(8).await, Err(SniffError::ReadBeforePeek)));
    assert!(matches!(conn.set_path("/b"), Err(SniffError::PrefixReplayed)));
}

#[tokio::test]
async fn test_sniff_set_path_then_read() {
    let (mut conn, client) = sniff_tcp(b"POST /old HTTP/1.1\r\n\r\n").await;
    conn.set_path("/new").unwrap();
    assert_eq!(conn.path(), "/new");

    drop(client);
    let mut all = Vec::new();
    conn.read_to_end(&mut all).await.unwrap();
    assert_eq!(all, b"POST /new HTTP/1.1\r\n\r\n");
}

#[tokio::test]
async fn test_decoy_over_tcp() {
    let (mut conn, mut client) = sniff_tcp(b"HEAD / HTTP/1.0\r\n\r\n").await;
    conn.handle().await.unwrap();
    drop(conn);

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, DECOY_RESPONSE);

    let text = String::from_utf8(response).unwrap();
    let (_, body) = text.split_once("\n\n").unwrap();
    assert_eq!(body.len(), DECOY_CONTENT_LENGTH);
}

#[derive(Default)]
struct Calls {
    server: AtomicUsize,
    client: AtomicUsize,
}

struct Recording(Arc<Calls>);

#[async_trait]
impl TransportStrategy for Recording {
    async fn run_server(&self, _ctx: TunnelContext) -> Result<(), TransportError> {
        self.0.server.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn run_client(&self, _ctx: TunnelContext) -> Result<(), TransportError> {
        self.0.client.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Register a recorder under every kind, one counter per kind
fn recorders() -> (StrategySet, Vec<(ProtocolKind, Arc<Calls>)>) {
    let mut set = StrategySet::new();
    let mut calls = Vec::new();
    for kind in ProtocolKind::ALL {
        let c = Arc::new(Calls::default());
        set = set.with(kind, Recording(c.clone()));
        calls.push((kind, c));
    }
    (set, calls)
}

async fn dispatched(protocol: &str, server_mode: bool) -> Vec<(ProtocolKind, usize, usize)> {
    let (set, calls) = recorders();
    let config = Config {
        protocol: protocol.to_string(),
        server_mode,
        key: "k".to_string(),
        ..Config::default()
    };

    let mut app = App::new(config, MemoryProvider::new(), set);
    app.init().await.unwrap();
    app.start().await.unwrap();
    app.stop().await.unwrap();

    calls
        .iter()
        .map(|(kind, c)| {
            (
                *kind,
                c.server.load(Ordering::SeqCst),
                c.client.load(Ordering::SeqCst),
            )
        })
        .filter(|(_, s, c)| s + c > 0)
        .collect()
}

#[tokio::test]
async fn test_unrecognized_protocols_behave_like_udp() {
    let udp = dispatched("udp", false).await;
    assert_eq!(udp, vec![(ProtocolKind::Udp, 0, 1)]);

    for name in ["bogus", "", "Http", " udp", "wss2"] {
        assert_eq!(dispatched(name, false).await, udp, "protocol {:?}", name);
    }
}

#[tokio::test]
async fn test_every_table_entry_dispatches_once() {
    let table = [
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

    for (name, kind) in table {
        assert_eq!(dispatched(name, true).await, vec![(kind, 1, 0)], "{}", name);
        assert_eq!(dispatched(name, false).await, vec![(kind, 0, 1)], "{}", name);
    }
}

#[tokio::test]
async fn test_init_failure_is_fatal() {
    let provider = MemoryProvider::new();
    provider.fail_create(true);
    let config = Config {
        key: "k".to_string(),
        ..Config::default()
    };

    let mut app = App::new(config, provider, StrategySet::builtin());
    assert!(matches!(app.init().await, Err(Error::Tun(_))));
    assert!(matches!(app.start().await, Err(Error::NotInitialized)));
}

fn ipv4_packet(src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![0u8; 20];
    packet[0] = 0x45;
    packet[12..16].copy_from_slice(&src);
    packet[16..20].copy_from_slice(&dst);
    packet.extend_from_slice(payload);
    packet
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start an endpoint in the background, returning its host-side peer
async fn spawn_endpoint(config: Config) -> (JoinHandle<()>, MemoryPeer) {
    let mut app = App::new(config, MemoryProvider::new(), StrategySet::builtin());
    app.init().await.unwrap();
    let peer = app.provider().take_peer().unwrap();

    let handle = tokio::spawn(async move {
        let _ = app.start().await;
    });
    (handle, peer)
}

async fn tunnel_round_trip(protocol: &str) {
    let port = free_port().await;
    let base = Config {
        protocol: protocol.to_string(),
        key: "shared-secret".to_string(),
        local_addr: format!("127.0.0.1:{}", port),
        server_addr: format!("127.0.0.1:{}", port),
        ..Config::default()
    };

    let (server, mut server_host) = spawn_endpoint(Config {
        server_mode: true,
        cidr: "10.9.0.1/24".to_string(),
        ..base.clone()
    })
    .await;
    let (client, mut client_host) = spawn_endpoint(Config {
        server_mode: false,
        cidr: "10.9.0.2/24".to_string(),
        ..base
    })
    .await;

    // Datagrams sent before the server binds are lost, so keep resending
    let outbound = ipv4_packet([10, 9, 0, 2], [10, 9, 0, 1], b"ping");
    let received = tokio::time::timeout(WAIT, async {
        loop {
            client_host.inject(outbound.clone()).await.unwrap();
            let next = tokio::time::timeout(Duration::from_millis(500), server_host.next_packet());
            if let Ok(Some(packet)) = next.await {
                break packet;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(received, outbound);

    let inbound = ipv4_packet([10, 9, 0, 1], [10, 9, 0, 2], b"pong");
    server_host.inject(inbound.clone()).await.unwrap();
    let received = tokio::time::timeout(WAIT, client_host.next_packet())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, inbound);

    client.abort();
    server.abort();
}

#[tokio::test]
async fn test_udp_tunnel_round_trip() {
    tunnel_round_trip("udp").await;
}

#[tokio::test]
async fn test_unrecognized_protocol_tunnels_over_udp() {
    tunnel_round_trip("bogus").await;
}

#[tokio::test]
async fn test_tcp_tunnel_round_trip() {
    tunnel_round_trip("tcp").await;
}

#[tokio::test]
async fn test_http_tunnel_round_trip() {
    tunnel_round_trip("http").await;
}

#[tokio::test]
async fn test_http_server_answers_strangers_with_decoy() {
    let port = free_port().await;
    let config = Config {
        protocol: "http".to_string(),
        server_mode: true,
        key: "shared-secret".to_string(),
        local_addr: format!("127.0.0.1:{}", port),
        peek_timeout_secs: 1,
        ..Config::default()
    };
    let (server, _host) = spawn_endpoint(config).await;

    let requests: [&[u8]; 3] = [
        b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n",
        b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n",
        b"\x16\x03\x01\x00\x05hello",
    ];

    for request in requests {
        let mut stream = connect_with_retry(port).await;
        stream.write_all(request).await.unwrap();

        let mut response = Vec::new();
        tokio::time::timeout(WAIT, stream.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response, DECOY_RESPONSE);
    }

    server.abort();
}

async fn connect_with_retry(port: u16) -> TcpStream {
    for _ in 0..50 {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("server on port {} never came up", port);
}

#[test]
fn test_peer_addresses_are_ip() {
    let packet = ipv4_packet([10, 9, 0, 2], [10, 9, 0, 1], b"");
    let (src, dst) = vtun::transport::packet_addrs(&packet).unwrap();
    assert_eq!(src, IpAddr::from([10, 9, 0, 2]));
    assert_eq!(dst, IpAddr::from([10, 9, 0, 1]));
}
