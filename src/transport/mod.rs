//! Pub/sub transport
//!
//! The bridge talks to its peer through a channel-addressed publish/subscribe
//! service. [`PubSub`] is the seam; [`TransportClient`] implements it over a
//! WebSocket connection and [`MemoryHub`] provides an in-process broker.

mod memory;
mod proxy;
mod signer;
mod tls;
mod websocket;

pub use memory::{MemoryHub, MemoryPubSub};
pub use proxy::{connect_tcp, ProxySettings};
pub use signer::{
    encode_auth_subprotocol, ApiKeySigner, FnSigner, RequestSigner, SigningRequest, StaticHeaders,
};
pub use tls::client_config;
pub use websocket::TransportClient;

use crate::config::TcpConfig;
use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::net::TcpStream;

/// A message received on a subscribed channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Channel the message was published to
    pub channel: String,
    /// Raw message bytes
    pub payload: Bytes,
}

/// Readiness of a transport connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No connection; publishes are queued
    Disconnected,
    /// Connecting or re-subscribing
    Connecting,
    /// Every desired channel is subscribed
    Connected,
}

/// Channel-addressed publish/subscribe
///
/// Inbound messages are delivered on the receiver handed out when the
/// implementation is created.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Add a channel to the subscription set
    async fn subscribe(&self, channel: &str) -> Result<(), TransportError>;

    /// Publish one frame; a frame whose base64 event exceeds
    /// [`PubSub::max_frame_bytes`] is rejected
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Largest event, in bytes, accepted by `publish`
    fn max_frame_bytes(&self) -> usize;

    /// Close the connection and fail queued operations
    async fn close(&self) -> Result<(), TransportError>;
}

/// Socket options for outbound connections
#[derive(Debug, Clone)]
pub struct SocketOpts {
    /// Enable TCP_NODELAY
    pub nodelay: bool,
    /// TCP keepalive timeout
    pub keepalive_secs: Option<u64>,
    /// TCP keepalive interval
    pub keepalive_interval: Option<u64>,
}

impl Default for SocketOpts {
    fn default() -> Self {
        SocketOpts {
            nodelay: true,
            keepalive_secs: Some(20),
            keepalive_interval: Some(8),
        }
    }
}

impl SocketOpts {
    /// Create socket options from TCP config
    pub fn from_tcp_config(config: &TcpConfig) -> Self {
        SocketOpts {
            nodelay: config.nodelay,
            keepalive_secs: Some(config.keepalive_secs),
            keepalive_interval: Some(config.keepalive_interval),
        }
    }

    /// Socket options for short-lived relayed flows
    pub fn for_flow() -> Self {
        SocketOpts {
            nodelay: true,
            keepalive_secs: None,
            keepalive_interval: None,
        }
    }

    /// Apply socket options to a TCP stream
    pub fn apply(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(self.nodelay)?;

        if let (Some(timeout), Some(interval)) = (self.keepalive_secs, self.keepalive_interval) {
            let socket = socket2::SockRef::from(stream);
            let keepalive = socket2::TcpKeepalive::new()
                .with_time(Duration::from_secs(timeout))
                .with_interval(Duration::from_secs(interval));
            socket.set_tcp_keepalive(&keepalive)?;
        }

        Ok(())
    }
}

/// Size of a frame once published as a base64 JSON string event
pub fn event_len(frame_len: usize) -> usize {
    4 * frame_len.div_ceil(3) + 2
}

/// Reject a frame whose published event would exceed the transport limit
pub(crate) fn check_frame(len: usize, max: usize) -> Result<(), TransportError> {
    let size = event_len(len);
    if size > max {
        return Err(TransportError::Protocol(
            crate::error::ProtocolError::FrameTooLarge { size, max },
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_socket_opts_default() {
        let opts = SocketOpts::default();
        assert!(opts.nodelay);
        assert_eq!(opts.keepalive_secs, Some(20));
        assert_eq!(opts.keepalive_interval, Some(8));
    }

    #[test]
    fn test_socket_opts_from_tcp_config() {
        let config = TcpConfig {
            nodelay: false,
            keepalive_secs: 60,
            keepalive_interval: 15,
        };
        let opts = SocketOpts::from_tcp_config(&config);
        assert!(!opts.nodelay);
        assert_eq!(opts.keepalive_secs, Some(60));
        assert_eq!(opts.keepalive_interval, Some(15));
    }

    #[tokio::test]
    async fn test_socket_opts_apply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();

        SocketOpts::default().apply(&stream).unwrap();
        assert!(stream.nodelay().unwrap());

        SocketOpts::for_flow().apply(&stream).unwrap();
    }

    #[test]
    fn test_check_frame() {
        // 9 bytes are 12 base64 characters plus two quotes
        assert_eq!(event_len(9), 14);
        assert_eq!(event_len(10), 18);
        assert_eq!(event_len(0), 2);

        assert!(check_frame(9, 14).is_ok());
        let err = check_frame(10, 14).unwrap_err();
        assert!(matches!(
            err,
            TransportError::Protocol(crate::error::ProtocolError::FrameTooLarge { size: 18, max: 14 })
        ));
        assert!(!err.is_retryable());
    }
}
