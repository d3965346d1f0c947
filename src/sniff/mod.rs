//! Connection sniffing for HTTP-shaped transports
//!
//! A freshly accepted connection is wrapped in a [`SniffConn`], which reads
//! one prefix of up to [`PEEK_SIZE`] bytes and classifies it before any
//! tunnel-specific processing starts:
//!
//! ```text
//! Unconstructed ──peek──▶ Classified{HttpRequest|Http2Preface|Unknown}
//!                                   │
//!                              first read
//!                                   ▼
//!                               Streaming
//! ```
//!
//! The prefix is replayed exactly once ahead of live bytes, so readers see
//! the same stream they would have seen on the raw connection. Connections
//! that turn out not to be tunnel handshakes can be answered with a
//! [`DECOY_RESPONSE`] that looks like a stock web server.

mod decoy;

pub use decoy::{DECOY_CONTENT_LENGTH, DECOY_RESPONSE};

use bytes::Bytes;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, trace};

/// Size of the classification prefix
pub const PEEK_SIZE: usize = 64;

/// Default bound on the initial peek
pub const DEFAULT_PEEK_TIMEOUT: Duration = Duration::from_secs(10);

/// Request methods recognized as an HTTP/1.x request line
const HTTP_METHODS: [&[u8]; 7] = [
    b"GET", b"POST", b"HEAD", b"PUT", b"DELETE", b"OPTIONS", b"CONNECT",
];

/// HTTP/2 connection preface (request-line part)
const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0";

const SEP: u8 = b' ';

/// Sniffer errors
#[derive(Debug, Error)]
pub enum SniffError {
    #[error("can only peek once")]
    AlreadyPeeked,

    #[error("pre-data must be peeked before read")]
    ReadBeforePeek,

    #[error("connection is not an HTTP request")]
    NotHttpRequest,

    #[error("prefix already replayed to a reader")]
    PrefixReplayed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Application-level shape of a connection prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// HTTP/1.x request line with a known method
    HttpRequest,
    /// HTTP/2 connection preface
    Http2Preface,
    /// Anything else, including an empty or failed peek
    Unknown,
}

/// Classify a prefix, returning the request path for HTTP requests
pub fn classify(prefix: &[u8]) -> (Classification, Option<String>) {
    let mut tokens = prefix.split(|b| *b == SEP);
    if let (Some(method), Some(path)) = (tokens.next(), tokens.next()) {
        if HTTP_METHODS.contains(&method) {
            let path = String::from_utf8_lossy(path).into_owned();
            return (Classification::HttpRequest, Some(path));
        }
    }

    if prefix.starts_with(HTTP2_PREFACE) {
        return (Classification::Http2Preface, None);
    }

    (Classification::Unknown, None)
}

/// A connection wrapped with its sniffed prefix.
///
/// Reads and writes are forwarded to the inner stream; the only observable
/// difference from the raw connection is the classification step done in
/// the constructor.
pub struct SniffConn<S> {
    inner: S,
    classification: Classification,
    pre_data: Bytes,
    path: String,
    peeked: bool,
    read: bool,
}

impl<S> SniffConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap and classify `stream` using [`DEFAULT_PEEK_TIMEOUT`]
    pub async fn new(stream: S) -> Self {
        Self::with_timeout(stream, DEFAULT_PEEK_TIMEOUT).await
    }

    /// Wrap and classify `stream`, bounding the initial peek by `timeout`
    pub async fn with_timeout(stream: S, timeout: Duration) -> Self {
        let mut conn = Self {
            inner: stream,
            classification: Classification::Unknown,
            pre_data: Bytes::new(),
            path: String::new(),
            peeked: false,
            read: false,
        };
        conn.classification = conn.sniff(timeout).await;
        conn
    }

    /// Read up to `n` bytes from the connection into the prefix buffer.
    ///
    /// Succeeds at most once and only before the first read.
    pub async fn peek(&mut self, n: usize) -> Result<Bytes, SniffError> {
        if self.read {
            return Err(SniffError::ReadBeforePeek);
        }
        if self.peeked {
            return Err(SniffError::AlreadyPeeked);
        }
        self.peeked = true;

        let mut buf = vec![0u8; n];
        let n = match self.inner.read(&mut buf).await {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => 0,
            Err(e) => return Err(e.into()),
        };
        buf.truncate(n);

        self.pre_data = Bytes::from(buf);
        Ok(self.pre_data.clone())
    }

    async fn sniff(&mut self, timeout: Duration) -> Classification {
        match tokio::time::timeout(timeout, self.peek(PEEK_SIZE)).await {
            Ok(Ok(prefix)) => trace!(len = prefix.len(), "peeked connection prefix"),
            Ok(Err(e)) => {
                debug!("peek failed: {}", e);
                return Classification::Unknown;
            }
            Err(_) => {
                debug!("peek timed out after {:?}", timeout);
                return Classification::Unknown;
            }
        }

        let (classification, path) = classify(&self.pre_data);
        if let Some(path) = path {
            self.path = path;
        }
        classification
    }

    /// Replace the request path in the not-yet-replayed prefix
    pub fn set_path(&mut self, path: &str) -> Result<(), SniffError> {
        if self.read {
            return Err(SniffError::PrefixReplayed);
        }
        if self.classification != Classification::HttpRequest {
            return Err(SniffError::NotHttpRequest);
        }

        let mut tokens: Vec<&[u8]> = self.pre_data.split(|b| *b == SEP).collect();
        if tokens.len() < 2 {
            return Err(SniffError::NotHttpRequest);
        }
        tokens[1] = path.as_bytes();
        let rebuilt = tokens.join(&SEP);

        self.pre_data = Bytes::from(rebuilt);
        self.path = path.to_string();
        Ok(())
    }

    /// Answer the connection with the canned web page
    pub async fn handle(&mut self) -> Result<(), SniffError> {
        self.inner.write_all(DECOY_RESPONSE).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

impl<S> SniffConn<S> {
    /// Classification decided at construction
    pub fn classification(&self) -> Classification {
        self.classification
    }

    /// Recorded request path (empty unless `HttpRequest`)
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Prefix bytes not yet handed to a reader
    pub fn prefix(&self) -> &[u8] {
        &self.pre_data
    }

    /// Whether streaming reads have begun
    pub fn is_streaming(&self) -> bool {
        self.read
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for SniffConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.read = true;

        if !this.pre_data.is_empty() {
            let n = this.pre_data.len().min(buf.remaining());
            buf.put_slice(&this.pre_data.split_to(n));
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SniffConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<S> std::fmt::Debug for SniffConn<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniffConn")
            .field("classification", &self.classification)
            .field("path", &self.path)
            .field("peeked", &self.peeked)
            .field("read", &self.read)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    /// Sniff a connection whose peer sends `data` then closes
    async fn sniff_bytes(data: &[u8]) -> SniffConn<tokio::io::DuplexStream> {
        let (mut client, server) = duplex(4096);
        client.write_all(data).await.unwrap();
        drop(client);
        SniffConn::new(server).await
    }

    #[test]
    fn test_classify() {
        let (c, path) = classify(b"GET /foo HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(c, Classification::HttpRequest);
        assert_eq!(path.as_deref(), Some("/foo"));

        let (c, _) = classify(b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n");
        assert_eq!(c, Classification::Http2Preface);

        assert_eq!(classify(b"").0, Classification::Unknown);
        assert_eq!(classify(b"GET").0, Classification::Unknown);
        assert_eq!(classify(b"get / HTTP/1.1").0, Classification::Unknown);
        assert_eq!(classify(b"PATCH / HTTP/1.1").0, Classification::Unknown);
        assert_eq!(classify(b"PRI * HTTP/2").0, Classification::Unknown);
        assert_eq!(classify(b"\x16\x03\x01\x02\x00").0, Classification::Unknown);
    }

    #[test]
    fn test_classify_all_methods() {
        for method in HTTP_METHODS {
            let mut line = method.to_vec();
            line.extend_from_slice(b" /x HTTP/1.1");
            assert_eq!(classify(&line).0, Classification::HttpRequest);
        }
    }

    #[tokio::test]
    async fn test_http_request() {
        let conn = sniff_bytes(b"GET /foo HTTP/1.1\r\nHost: example.com\r\n\r\n").await;
        assert_eq!(conn.classification(), Classification::HttpRequest);
        assert_eq!(conn.path(), "/foo");
    }

    #[tokio::test]
    async fn test_http2_preface() {
        let conn = sniff_bytes(b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n").await;
        assert_eq!(conn.classification(), Classification::Http2Preface);
        assert_eq!(conn.path(), "");
    }

    #[tokio::test]
    async fn test_immediate_close_is_unknown() {
        let conn = sniff_bytes(b"").await;
        assert_eq!(conn.classification(), Classification::Unknown);
        assert!(conn.prefix().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let (_client, server) = duplex(64);
        let conn = SniffConn::with_timeout(server, Duration::from_secs(2)).await;
        assert_eq!(conn.classification(), Classification::Unknown);
    }

    #[tokio::test]
    async fn test_prefix_replayed_once() {
        let mut payload = b"GET /tunnel HTTP/1.1\r\n".to_vec();
        payload.extend((0..200u8).collect::<Vec<_>>());

        let mut conn = sniff_bytes(&payload).await;
        let mut out = Vec::new();
        conn.read_to_end(&mut out).await.unwrap();

        assert_eq!(out, payload);
        assert!(conn.is_streaming());
        assert!(conn.prefix().is_empty());
    }

    #[tokio::test]
    async fn test_http2_preface_replayed_byte_exact() {
        let mut payload = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n".to_vec();
        payload.extend((0..=255u8).cycle().take(300));

        let mut conn = sniff_bytes(&payload).await;
        assert_eq!(conn.classification(), Classification::Http2Preface);

        let mut out = Vec::new();
        conn.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, payload);
    }

    /// Stream whose reads always fail with a non-EOF error
    struct ResetStream;

    impl AsyncRead for ResetStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
        }
    }

    impl AsyncWrite for ResetStream {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_read_error_is_unknown() {
        let conn = SniffConn::new(ResetStream).await;
        assert_eq!(conn.classification(), Classification::Unknown);
        assert!(conn.prefix().is_empty());
        assert_eq!(conn.path(), "");
    }

    #[tokio::test]
    async fn test_small_reads_see_same_stream() {
        let payload = b"POST /upload HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc".to_vec();
        let mut conn = sniff_bytes(&payload).await;

        let mut out = Vec::new();
        let mut buf = [0u8; 5];
        loop {
            let n = conn.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, payload);
    }

    #[tokio::test]
    async fn test_peek_twice() {
        let mut conn = sniff_bytes(b"GET / HTTP/1.1\r\n").await;
        assert!(matches!(conn.peek(8).await, Err(SniffError::AlreadyPeeked)));
    }

    #[tokio::test]
    async fn test_peek_after_read() {
        let mut conn = sniff_bytes(b"GET / HTTP/1.1\r\n").await;
        let mut buf = [0u8; 4];
        conn.read(&mut buf).await.unwrap();
        assert!(matches!(conn.peek(8).await, Err(SniffError::ReadBeforePeek)));
    }

    #[tokio::test]
    async fn test_set_path_rewrites_request_line() {
        let mut conn = sniff_bytes(b"GET /old HTTP/1.1\r\nHost: a\r\n\r\n").await;
        conn.set_path("/new").unwrap();
        assert_eq!(conn.path(), "/new");

        let mut out = Vec::new();
        conn.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"GET /new HTTP/1.1\r\nHost: a\r\n\r\n");
    }

    #[tokio::test]
    async fn test_set_path_rejected() {
        let mut conn = sniff_bytes(b"GETXXXXXXXXX").await;
        assert!(matches!(conn.set_path("/x"), Err(SniffError::NotHttpRequest)));

        let mut conn = sniff_bytes(b"PRI * HTTP/2.0\r\n\r\n").await;
        assert!(matches!(conn.set_path("/x"), Err(SniffError::NotHttpRequest)));

        let mut conn = sniff_bytes(b"GET /a HTTP/1.1\r\n").await;
        let mut buf = [0u8; 1];
        conn.read(&mut buf).await.unwrap();
        assert!(matches!(conn.set_path("/x"), Err(SniffError::PrefixReplayed)));
    }

    #[tokio::test]
    async fn test_handle_writes_decoy() {
        let (mut client, server) = duplex(4096);
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let mut conn = SniffConn::new(server).await;
        conn.handle().await.unwrap();
        drop(conn);

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, DECOY_RESPONSE);
    }

    #[tokio::test]
    async fn test_writes_forwarded() {
        let (mut client, server) = duplex(4096);
        client.write_all(b"hello").await.unwrap();

        let mut conn = SniffConn::new(server).await;
        conn.write_all(b"world").await.unwrap();

        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
    }
}
