//! Plain HTTP strategy (HTTPS when `config.tls` is set)
//!
//! The client opens the tunnel with an ordinary-looking upgrade request for
//! `config.path`. The server sniffs every accepted connection first: only
//! an HTTP request for the tunnel path is upgraded, anything else (scanners,
//! browsers, HTTP/2 prefaces, garbage) receives the decoy web page.
//!
//! ```text
//! client                                server
//!   │ GET /freedom HTTP/1.1 + Upgrade ──▶ │  sniff → HttpRequest, path ok
//!   │ ◀── HTTP/1.1 101 Switching Protocols│
//!   │ ◀═════════ framed packets ═════════▶│
//! ```

use super::runner::{accept_loop, connect, reconnect_loop};
use super::{pump, PeerRouter, TransportError, TransportStrategy, TunnelContext};
use crate::crypto::Cipher;
use crate::protocol::HANDSHAKE_TIMEOUT;
use crate::sniff::{Classification, SniffConn};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

/// Upper bound on a request or response head
const MAX_HEAD_SIZE: usize = 8192;

const UPGRADE_RESPONSE: &[u8] =
    b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// HTTP upgrade strategy
#[derive(Debug, Default, Clone)]
pub struct HttpStrategy;

impl HttpStrategy {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportStrategy for HttpStrategy {
    async fn run_server(&self, ctx: TunnelContext) -> Result<(), TransportError> {
        let cipher = Arc::new(Cipher::from_key(&ctx.key)?);
        let acceptor = server_tls(&ctx)?;
        let path = Arc::new(ctx.config.path.clone());
        let peek_timeout = Duration::from_secs(ctx.config.peek_timeout_secs);

        accept_loop(&ctx, "http", |stream, _peer, router| {
            let cipher = cipher.clone();
            let path = path.clone();
            let acceptor = acceptor.clone();
            async move {
                match acceptor {
                    #[cfg(feature = "tls")]
                    Some(acceptor) => {
                        let stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream))
                            .await
                            .map_err(|_| TransportError::Timeout)?
                            .map_err(|e| TransportError::Tls(format!("TLS accept failed: {}", e)))?;
                        serve_connection(stream, &path, peek_timeout, router, cipher).await
                    }
                    _ => serve_connection(stream, &path, peek_timeout, router, cipher).await,
                }
            }
        })
        .await
    }

    async fn run_client(&self, ctx: TunnelContext) -> Result<(), TransportError> {
        let cipher = Arc::new(Cipher::from_key(&ctx.key)?);

        reconnect_loop("http", || {
            let ctx = ctx.clone();
            let cipher = cipher.clone();
            async move {
                let stream = connect(&ctx.config.server_addr, HANDSHAKE_TIMEOUT).await?;

                if ctx.config.tls {
                    let stream = client_tls(&ctx, stream).await?;
                    client_session(stream, &ctx, cipher).await
                } else {
                    client_session(stream, &ctx, cipher).await
                }
            }
        })
        .await
    }
}

#[cfg(feature = "tls")]
type Acceptor = Option<tokio_rustls::TlsAcceptor>;

#[cfg(not(feature = "tls"))]
type Acceptor = Option<std::convert::Infallible>;

fn server_tls(ctx: &TunnelContext) -> Result<Acceptor, TransportError> {
    if !ctx.config.tls {
        return Ok(None);
    }

    #[cfg(feature = "tls")]
    {
        super::tls::build_acceptor(&ctx.config).map(Some)
    }
    #[cfg(not(feature = "tls"))]
    {
        Err(TransportError::Tls("built without TLS support".to_string()))
    }
}

#[cfg(feature = "tls")]
async fn client_tls(
    ctx: &TunnelContext,
    stream: tokio::net::TcpStream,
) -> Result<tokio_rustls::client::TlsStream<tokio::net::TcpStream>, TransportError> {
    let (connector, server_name) = super::tls::build_connector(&ctx.config)?;

    tokio::time::timeout(HANDSHAKE_TIMEOUT, connector.connect(server_name, stream))
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::Tls(e.to_string()))
}

#[cfg(not(feature = "tls"))]
async fn client_tls(
    _ctx: &TunnelContext,
    _stream: tokio::net::TcpStream,
) -> Result<tokio::net::TcpStream, TransportError> {
    Err(TransportError::Tls("built without TLS support".to_string()))
}

/// Sniff one accepted connection and either upgrade it or serve the decoy
async fn serve_connection<S>(
    stream: S,
    tunnel_path: &str,
    peek_timeout: Duration,
    router: PeerRouter,
    cipher: Arc<Cipher>,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut conn = SniffConn::with_timeout(stream, peek_timeout).await;

    let is_tunnel =
        conn.classification() == Classification::HttpRequest && conn.path() == tunnel_path;
    if !is_tunnel {
        debug!(
            classification = ?conn.classification(),
            path = %conn.path(),
            "serving decoy"
        );
        conn.handle().await?;
        conn.shutdown().await.ok();
        return Ok(());
    }

    // The request head is replayed from the sniffed prefix first
    read_head(&mut conn).await?;
    conn.write_all(UPGRADE_RESPONSE).await?;
    conn.flush().await?;
    info!(path = %tunnel_path, "http tunnel upgraded");

    router.serve(conn, cipher).await
}

/// Upgrade handshake followed by packet pumping
async fn client_session<S>(
    mut stream: S,
    ctx: &TunnelContext,
    cipher: Arc<Cipher>,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let request = upgrade_request(&ctx.config.path, &ctx.config.server_addr);
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let head = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_head(&mut stream))
        .await
        .map_err(|_| TransportError::Timeout)??;
    if !head.starts_with(b"HTTP/1.1 101") {
        let status = head.split(|b| *b == b'\n').next().unwrap_or_default();
        return Err(TransportError::Handshake(format!(
            "unexpected response: {}",
            String::from_utf8_lossy(status).trim_end()
        )));
    }
    info!(server = %ctx.config.server_addr, "http tunnel connected");

    if let Err(e) = pump(ctx.iface.clone(), stream, cipher, ctx.stats.clone(), ctx.buffer_size()).await {
        info!("http tunnel closed: {}", e);
    }
    Ok(())
}

fn upgrade_request(path: &str, host: &str) -> String {
    format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
        path, host, USER_AGENT
    )
}

/// Read an HTTP head up to and including the blank line.
///
/// Reads byte by byte so no tunnel frame bytes are consumed.
async fn read_head<S>(stream: &mut S) -> Result<Vec<u8>, TransportError>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];

    while !head.ends_with(b"\r\n\r\n") && !head.ends_with(b"\n\n") {
        if head.len() >= MAX_HEAD_SIZE {
            return Err(TransportError::Handshake("HTTP head too large".to_string()));
        }
        if stream.read(&mut byte).await? == 0 {
            return Err(TransportError::Closed);
        }
        head.push(byte[0]);
    }

    Ok(head)
}
