//! # devtunnel - Local development bridge and private network tunnel
//!
//! devtunnel lets a developer run serverless handlers on their own machine
//! while they are invoked as if deployed, and gives local processes routed
//! access to private network resources.
//!
//! ## Features
//!
//! - **Live invocation bridge**: requests published by a remote stub over a
//!   WebSocket pub/sub service are executed locally and answered on the same
//!   channel pair, with chunking for payloads larger than one frame
//! - **Resilient transport**: reconnects with backoff and re-subscribes the
//!   full channel set before publishing again
//! - **Network tunnel**: a TUN device captures traffic for private ranges and
//!   relays every TCP flow through SOCKS5 over one SSH session to a bastion
//! - **Three platform drivers**: Linux (`ip`), macOS (`ifconfig`/`route`) and
//!   Windows (`netsh`) behind one interface
//!
//! ## Usage
//!
//! ```rust,ignore
//! use devtunnel::bridge::{BridgeChannels, DevBridge};
//! use devtunnel::config::load_config;
//! use devtunnel::host::ExecutionHost;
//! use devtunnel::transport::{ApiKeySigner, TransportClient};
//! use std::sync::Arc;
//! use tokio::sync::broadcast;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config("devtunnel.toml")?;
//!     let transport = config.transport.clone().unwrap();
//!     let signer = Arc::new(ApiKeySigner::new("da2-key"));
//!     let (client, inbound) = TransportClient::connect(transport, signer).await?;
//!
//!     let channels = BridgeChannels::new("devtunnel", &config.channel_base("dev"));
//!     let host = ExecutionHost::from_config(&config, "dev");
//!     let bridge = DevBridge::new(Arc::new(client), host, channels, &config.bridge);
//!     bridge.start().await?;
//!
//!     let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
//!     bridge.run(inbound, shutdown_rx).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! stub -> pub/sub -> TransportClient -> DevBridge -> ExecutionHost -> handler
//! app socket -> OS routes -> TUN -> RelayEngine -> SOCKS5 -> SSH -> bastion
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod bridge;
pub mod config;
pub mod error;
pub mod helper;
pub mod host;
pub mod protocol;
pub mod relay;
pub mod socks;
pub mod ssh;
pub mod transport;
pub mod tunnel;

// Re-export commonly used items
pub use bridge::{BridgeChannels, DevBridge, Invoker};
pub use config::{load_config, Config};
pub use error::{DevTunnelError, TunnelError};
pub use tunnel::{TunnelController, TunnelState};

/// Version of the devtunnel library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_name() {
        assert_eq!(NAME, "devtunnel");
    }
}
