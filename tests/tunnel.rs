//! Tunnel lifecycle and relay tests with recorded OS commands

mod common;

use async_trait::async_trait;
use common::{tcp_flags, tcp_packet, RecordingDialer, TCP_ACK, TCP_RST, TCP_SYN};
use devtunnel::config::{BastionConfig, TunnelConfig};
use devtunnel::error::TunnelError;
use devtunnel::relay::{RelayEngine, RelaySettings};
use devtunnel::socks::{Dialer, SocksServer, TargetAddr};
use devtunnel::ssh::BastionConnector;
use devtunnel::tunnel::driver::CommandOutput;
use devtunnel::tunnel::{
    memory_device, InstallOutcome, MemoryOpener, NetworkDriver, PacketPeer, RecordingRunner,
    TunnelController, TunnelState,
};
use ipnet::IpNet;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn config() -> TunnelConfig {
    TunnelConfig {
        device: "devtun0".to_string(),
        ..Default::default()
    }
}

fn root_runner() -> Arc<RecordingRunner> {
    let runner = Arc::new(RecordingRunner::new());
    runner.script("id -u", CommandOutput::ok("0\n"));
    runner
}

fn routes(cidrs: &[&str]) -> Vec<IpNet> {
    cidrs.iter().map(|c| c.parse().unwrap()).collect()
}

fn host() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(100, 100, 0, 1), 40000)
}

fn database() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 5432)
}

/// Wait for the relay to reset the flow, skipping its SYN-ACK
async fn expect_reset(peer: &mut PacketPeer) {
    let reset = async {
        while let Some(packet) = peer.next_packet().await {
            if tcp_flags(&packet) & TCP_RST != 0 {
                return true;
            }
        }
        false
    };
    assert!(tokio::time::timeout(Duration::from_secs(5), reset).await.unwrap());
}

#[tokio::test]
async fn test_install_twice_creates_device_once() {
    let runner = root_runner();
    runner.script_once("ip link show", CommandOutput::failed(1, "does not exist"));
    let driver = NetworkDriver::for_os("linux", &config(), runner.clone()).unwrap();

    assert_eq!(driver.install().await.unwrap(), InstallOutcome::Created);
    assert_eq!(driver.install().await.unwrap(), InstallOutcome::AlreadyPresent);

    let creates = runner
        .calls()
        .iter()
        .filter(|c| c.starts_with("ip tuntap add"))
        .count();
    assert_eq!(creates, 1);
}

#[tokio::test]
async fn test_install_without_root_is_denied() {
    let runner = Arc::new(RecordingRunner::new());
    runner.script("id -u", CommandOutput::ok("1000\n"));
    let driver = NetworkDriver::for_os("linux", &config(), runner.clone()).unwrap();

    let err = driver.install().await.unwrap_err();
    assert!(matches!(err, TunnelError::PrivilegeDenied(_)));
    assert_eq!(err.exit_code(), 77);
    assert!(!runner.calls().iter().any(|c| c.starts_with("ip tuntap")));
}

#[tokio::test]
async fn test_second_start_replaces_routes() {
    let runner = root_runner();
    let mut driver = NetworkDriver::for_os("linux", &config(), runner.clone()).unwrap();

    driver.start(&routes(&["10.0.0.0/22", "10.1.0.0/16"])).await.unwrap();
    runner.clear();
    driver.start(&routes(&["172.16.0.0/12"])).await.unwrap();

    assert_eq!(driver.active_routes().len(), 1);
    assert_eq!(driver.active_routes()[0].to_string(), "172.16.0.0/12");
    assert_eq!(
        runner.calls(),
        vec![
            "ip link set dev devtun0 up",
            "ip -4 route show dev devtun0",
            "ip route flush dev devtun0",
            "ip route add 172.16.0.0/12 dev devtun0",
        ]
    );
}

#[tokio::test]
async fn test_relay_dials_destination_through_socks() {
    let dialer = Arc::new(RecordingDialer::default());
    let cancel = CancellationToken::new();

    let socks = SocksServer::bind("127.0.0.1:0".parse().unwrap(), Duration::from_secs(5))
        .await
        .unwrap();
    let socks_addr = socks.local_addr().unwrap();
    tokio::spawn(socks.serve(dialer.clone() as Arc<dyn Dialer>, cancel.child_token()));

    let engine = RelayEngine::new(RelaySettings {
        stack_address: Ipv4Addr::new(100, 100, 0, 2),
        mtu: 1500,
        idle_timeout: Duration::from_secs(60),
        dial_timeout: Duration::from_secs(5),
        socks_addr,
    })
    .unwrap();
    let (device, mut peer) = memory_device(1500);
    let relay = tokio::spawn(engine.run(device, cancel.child_token()));

    assert!(peer.inject(tcp_packet(host(), database(), TCP_SYN, 1000)).await);
    let answer = tokio::time::timeout(Duration::from_secs(5), peer.next_packet())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tcp_flags(&answer) & (TCP_SYN | TCP_ACK), TCP_SYN | TCP_ACK);

    tokio::time::timeout(Duration::from_secs(5), dialer.dialed())
        .await
        .unwrap();
    assert_eq!(dialer.targets(), vec![TargetAddr::ipv4(*database().ip(), 5432)]);

    // The bastion refused, so the host sees a reset
    expect_reset(&mut peer).await;

    cancel.cancel();
    relay.await.unwrap().unwrap();
}

struct RecordingConnector(Arc<RecordingDialer>);

#[async_trait]
impl BastionConnector for RecordingConnector {
    async fn connect(&self, _: &BastionConfig) -> Result<Arc<dyn Dialer>, TunnelError> {
        Ok(self.0.clone() as Arc<dyn Dialer>)
    }
}

fn bastion() -> BastionConfig {
    BastionConfig {
        host: "bastion.example.com".to_string(),
        port: 22,
        user: "ec2-user".to_string(),
        key_path: "~/.ssh/id_ed25519".into(),
        passphrase: None,
        fingerprint: None,
        connect_timeout: 5,
        keepalive_interval: 30,
    }
}

#[tokio::test]
async fn test_controller_relays_routed_traffic() {
    let runner = root_runner();
    let driver = NetworkDriver::for_os("linux", &config(), runner.clone()).unwrap();
    let (opener, mut peers) = MemoryOpener::new();
    let dialer = Arc::new(RecordingDialer::default());
    let mut controller = TunnelController::new(
        config(),
        driver,
        Arc::new(opener),
        Arc::new(RecordingConnector(dialer.clone())),
    );

    assert_eq!(controller.discover().await.unwrap(), TunnelState::Installed);
    controller
        .start(&routes(&["10.0.0.0/22"]), &bastion())
        .await
        .unwrap();
    assert!(runner
        .calls()
        .contains(&"ip route add 10.0.0.0/22 dev devtun0".to_string()));

    let mut peer = peers.recv().await.unwrap();
    assert!(peer.inject(tcp_packet(host(), database(), TCP_SYN, 7)).await);
    tokio::time::timeout(Duration::from_secs(5), dialer.dialed())
        .await
        .unwrap();
    assert_eq!(dialer.targets(), vec![TargetAddr::ipv4(*database().ip(), 5432)]);
    expect_reset(&mut peer).await;

    controller.stop().await.unwrap();
    assert_eq!(controller.state(), TunnelState::Stopped);

    controller.destroy().await.unwrap();
    assert_eq!(controller.state(), TunnelState::Destroyed);
    assert!(runner
        .calls()
        .contains(&"ip tuntap del dev devtun0 mode tun".to_string()));
}
