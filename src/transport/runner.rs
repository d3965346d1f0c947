//! Accept and reconnect loops shared by stream strategies

use super::{Backoff, PeerRouter, TransportError, TunnelContext};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Pause after a failed accept (e.g. file descriptor exhaustion)
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// Listen on `local_addr` and hand every connection to `handler`.
///
/// Connection tasks and the interface dispatcher are owned by this future:
/// dropping it aborts them. Returns only if the interface closes.
pub(crate) async fn accept_loop<F, Fut>(
    ctx: &TunnelContext,
    name: &'static str,
    handler: F,
) -> Result<(), TransportError>
where
    F: Fn(TcpStream, SocketAddr, PeerRouter) -> Fut,
    Fut: Future<Output = Result<(), TransportError>> + Send + 'static,
{
    let listener = TcpListener::bind(&ctx.config.local_addr).await?;
    info!(
        protocol = name,
        addr = %ctx.config.local_addr,
        iface = %ctx.iface.name(),
        "tunnel server listening"
    );

    let router = PeerRouter::new(ctx.iface.clone(), ctx.stats.clone());
    let mut dispatcher = JoinSet::new();
    dispatcher.spawn(router.clone().dispatch(ctx.buffer_size()));

    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        debug!(protocol = name, %peer_addr, "new connection");
                        stream.set_nodelay(true).ok();

                        let conn = handler(stream, peer_addr, router.clone());
                        connections.spawn(async move {
                            if let Err(e) = conn.await {
                                debug!(%peer_addr, "connection ended: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                    }
                }
            }
            Some(result) = dispatcher.join_next() => {
                return match result {
                    Ok(result) => result,
                    Err(e) => Err(TransportError::ConnectionFailed(format!("dispatcher task failed: {}", e))),
                };
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

/// Run `session` forever, backing off between failed attempts.
///
/// `session` returns `Ok` once a tunnel was established and later ended,
/// which resets the backoff; `Err` means it never came up.
pub(crate) async fn reconnect_loop<F, Fut>(name: &'static str, mut session: F) -> Result<(), TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), TransportError>>,
{
    let mut backoff = Backoff::default();

    loop {
        match session().await {
            Ok(()) => {
                info!(protocol = name, "tunnel session ended");
                backoff.reset();
            }
            Err(e) => warn!(protocol = name, "tunnel session failed: {}", e),
        }

        let delay = backoff.next_delay();
        info!("Reconnecting in {:?}...", delay);
        tokio::time::sleep(delay).await;
    }
}

/// Connect to `addr` within `timeout`
pub(crate) async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream, TransportError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", addr, e)))?;

    // Small control writes must not wait on Nagle
    stream.set_nodelay(true).ok();
    Ok(stream)
}
