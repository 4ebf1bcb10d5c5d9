//! Loopback SOCKS5 listener

use super::dialer::Dialer;
use super::handler::handle_client;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// SOCKS5 server forwarding every CONNECT through a [`Dialer`]
pub struct SocksServer {
    listener: TcpListener,
    dial_timeout: Duration,
}

impl SocksServer {
    /// Bind to `addr` (normally `127.0.0.1:0`)
    pub async fn bind(addr: SocketAddr, dial_timeout: Duration) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        debug!("SOCKS server bound to {}", listener.local_addr()?);
        Ok(SocksServer {
            listener,
            dial_timeout,
        })
    }

    /// Address the server listens on
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept clients until `cancel` fires
    ///
    /// Client tasks are aborted when the server stops.
    pub async fn serve(self, dialer: Arc<dyn Dialer>, cancel: CancellationToken) {
        let addr = self.listener.local_addr().ok();
        info!("SOCKS server listening on {:?}", addr);
        let mut clients = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let dialer = Arc::clone(&dialer);
                        let timeout = self.dial_timeout;
                        clients.spawn(async move {
                            if let Err(e) = handle_client(stream, dialer.as_ref(), timeout).await {
                                debug!("SOCKS client {} failed: {:#}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("SOCKS accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                Some(_) = clients.join_next(), if !clients.is_empty() => {}
            }
        }

        debug!("SOCKS server stopping with {} active client(s)", clients.len());
        clients.shutdown().await;
    }
}
