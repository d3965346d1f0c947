//! Raw stream socket strategy
//!
//! Frames go straight onto a TCP connection with no disguise. Useful on
//! internal networks and as the simplest end-to-end check of a deployment.

use super::runner::{accept_loop, connect, reconnect_loop};
use super::{pump, TransportError, TransportStrategy, TunnelContext};
use crate::crypto::Cipher;
use crate::protocol::HANDSHAKE_TIMEOUT;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Raw TCP strategy
#[derive(Debug, Default, Clone)]
pub struct TcpStrategy;

impl TcpStrategy {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportStrategy for TcpStrategy {
    async fn run_server(&self, ctx: TunnelContext) -> Result<(), TransportError> {
        let cipher = Arc::new(Cipher::from_key(&ctx.key)?);

        accept_loop(&ctx, "tcp", |stream, _peer, router| {
            let cipher = cipher.clone();
            async move { router.serve(stream, cipher).await }
        })
        .await
    }

    async fn run_client(&self, ctx: TunnelContext) -> Result<(), TransportError> {
        let cipher = Arc::new(Cipher::from_key(&ctx.key)?);

        reconnect_loop("tcp", || {
            let ctx = ctx.clone();
            let cipher = cipher.clone();
            async move {
                let stream = connect(&ctx.config.server_addr, HANDSHAKE_TIMEOUT).await?;
                info!(server = %ctx.config.server_addr, "tcp tunnel connected");

                if let Err(e) = pump(ctx.iface.clone(), stream, cipher, ctx.stats.clone(), ctx.buffer_size()).await {
                    info!("tcp tunnel closed: {}", e);
                }
                Ok(())
            }
        })
        .await
    }
}
