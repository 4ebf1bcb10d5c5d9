//! Outbound connection seam for the SOCKS server

use super::types::TargetAddr;
use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream returned by a [`Dialer`]
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}

/// Opens connections on behalf of SOCKS clients
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `target`
    async fn dial(&self, target: &TargetAddr) -> io::Result<Box<dyn ProxyStream>>;

    /// Release the underlying transport
    async fn close(&self) {}
}
