//! Test utilities and fakes for devtunnel
//!
//! This module provides common test utilities used across integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use devtunnel::bridge::{BridgeChannels, DevBridge, Invoker};
use devtunnel::config::BridgeConfig;
use devtunnel::host::{ExecutionHost, FnHandler, HandlerFailure, InvocationContext};
use devtunnel::protocol::FunctionMetadata;
use devtunnel::socks::{Dialer, ProxyStream, TargetAddr};
use devtunnel::transport::{MemoryHub, PubSub};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Frame limit used by the in-memory hub
pub const FRAME_LIMIT: usize = 240 * 1024;

/// Create a test TCP listener on an available port
pub async fn create_test_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Metadata for a test function
pub fn function(id: &str) -> FunctionMetadata {
    FunctionMetadata {
        function_id: id.to_string(),
        function_name: format!("shop-dev-{}", id),
        handler: format!("{}.handler", id),
        memory_mb: 128,
        timeout_ms: 10_000,
        environment: BTreeMap::new(),
    }
}

/// A host with one closure-backed function
pub fn host_with<F>(id: &str, f: F) -> ExecutionHost
where
    F: Fn(&InvocationContext, &Value) -> Result<Value, HandlerFailure> + Send + Sync + 'static,
{
    let mut host = ExecutionHost::new(BridgeConfig::default().limits());
    host.register(function(id), Arc::new(FnHandler::new(f)));
    host
}

/// Both bridge endpoints wired through one hub
pub struct BridgePair {
    pub hub: MemoryHub,
    pub invoker: Arc<Invoker>,
    pub channels: BridgeChannels,
    shutdown_tx: broadcast::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl BridgePair {
    /// Start a dev bridge serving `host` and an invoker talking to it
    pub async fn start(host: ExecutionHost) -> Self {
        let hub = MemoryHub::new(FRAME_LIMIT);
        let channels = BridgeChannels::new("devtunnel", "shop/dev");
        let config = BridgeConfig::default();
        let (shutdown_tx, _) = broadcast::channel(1);

        let (dev_client, dev_rx) = hub.client();
        let bridge = DevBridge::new(Arc::new(dev_client), host, channels.clone(), &config);
        bridge.start().await.unwrap();

        let (stub_client, stub_rx) = hub.client();
        let invoker = Arc::new(Invoker::new(Arc::new(stub_client), channels.clone(), &config));
        invoker.start().await.unwrap();

        let dev_shutdown = shutdown_tx.subscribe();
        let dev = tokio::spawn(async move { bridge.run(dev_rx, dev_shutdown).await });
        let stub_shutdown = shutdown_tx.subscribe();
        let stub = Arc::clone(&invoker);
        let stub = tokio::spawn(async move { stub.run(stub_rx, stub_shutdown).await });

        BridgePair {
            hub,
            invoker,
            channels,
            shutdown_tx,
            tasks: vec![dev, stub],
        }
    }

    /// Stop both loops
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            task.await.unwrap();
        }
    }
}

/// Subscribe a raw observer to `channel`
pub async fn observe(hub: &MemoryHub, channel: &str) -> (impl PubSub, mpsc::Receiver<devtunnel::transport::InboundMessage>) {
    let (client, rx) = hub.client();
    client.subscribe(channel).await.unwrap();
    (client, rx)
}

/// Dialer that records targets and refuses them
#[derive(Default)]
pub struct RecordingDialer {
    targets: Mutex<Vec<TargetAddr>>,
    notify: tokio::sync::Notify,
}

impl RecordingDialer {
    /// Targets dialed so far
    pub fn targets(&self) -> Vec<TargetAddr> {
        self.targets.lock().unwrap().clone()
    }

    /// Wait for the next dial
    pub async fn dialed(&self) {
        self.notify.notified().await
    }
}

#[async_trait]
impl Dialer for RecordingDialer {
    async fn dial(&self, target: &TargetAddr) -> io::Result<Box<dyn ProxyStream>> {
        self.targets.lock().unwrap().push(target.clone());
        self.notify.notify_one();
        Err(io::Error::new(io::ErrorKind::ConnectionRefused, "recorded"))
    }
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn sum_words(data: &[u8]) -> u32 {
    data.chunks(2)
        .map(|c| u32::from(u16::from_be_bytes([c[0], *c.get(1).unwrap_or(&0)])))
        .sum()
}

/// TCP flag bits
pub const TCP_SYN: u8 = 0x02;
pub const TCP_RST: u8 = 0x04;
pub const TCP_ACK: u8 = 0x10;

/// Build an IPv4 TCP segment with valid checksums
pub fn tcp_packet(src: SocketAddrV4, dst: SocketAddrV4, flags: u8, seq: u32) -> Vec<u8> {
    let mut tcp = Vec::with_capacity(20);
    tcp.extend_from_slice(&src.port().to_be_bytes());
    tcp.extend_from_slice(&dst.port().to_be_bytes());
    tcp.extend_from_slice(&seq.to_be_bytes());
    tcp.extend_from_slice(&0u32.to_be_bytes());
    tcp.extend_from_slice(&[0x50, flags, 0xff, 0xff, 0, 0, 0, 0]);

    let mut pseudo = Vec::with_capacity(12);
    pseudo.extend_from_slice(&src.ip().octets());
    pseudo.extend_from_slice(&dst.ip().octets());
    pseudo.extend_from_slice(&[0, 6, 0, tcp.len() as u8]);
    let csum = fold(sum_words(&pseudo) + sum_words(&tcp));
    tcp[16..18].copy_from_slice(&csum.to_be_bytes());

    let total = (20 + tcp.len()) as u16;
    let mut packet = vec![0x45, 0];
    packet.extend_from_slice(&total.to_be_bytes());
    packet.extend_from_slice(&[0, 1, 0x40, 0, 64, 6, 0, 0]);
    packet.extend_from_slice(&src.ip().octets());
    packet.extend_from_slice(&dst.ip().octets());
    let csum = fold(sum_words(&packet));
    packet[10..12].copy_from_slice(&csum.to_be_bytes());

    packet.extend_from_slice(&tcp);
    packet
}

/// Flags byte of a TCP segment built or emitted over IPv4
pub fn tcp_flags(packet: &[u8]) -> u8 {
    let ihl = usize::from(packet[0] & 0x0f) * 4;
    packet[ihl + 13]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_create_test_listener() {
        let (listener, addr) = create_test_listener().await;
        assert!(addr.port() > 0);
        drop(listener);
    }

    #[test]
    fn test_tcp_packet_checksums() {
        let packet = tcp_packet(
            SocketAddrV4::new(Ipv4Addr::new(100, 100, 0, 1), 40000),
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 5432),
            TCP_SYN,
            1,
        );
        assert_eq!(packet.len(), 40);
        assert_eq!(fold(sum_words(&packet[..20])), 0);
        assert_eq!(tcp_flags(&packet), TCP_SYN);
    }
}
