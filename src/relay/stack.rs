//! User-space TCP/IP stack terminating tunnelled flows
//!
//! The interface runs in `any_ip` mode with a default route via its own
//! address, so it accepts packets for every destination routed into the
//! tunnel. Each flow gets a socket listening on the exact destination the
//! client asked for.

use super::device::QueueDevice;
use crate::error::TunnelError;
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp;
use smoltcp::time::Instant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, IpListenEndpoint};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;
use tracing::debug;

/// Receive buffer per flow
const TCP_RX_BUF_SIZE: usize = 65536;

/// Transmit buffer per flow
const TCP_TX_BUF_SIZE: usize = 65536;

/// smoltcp interface, sockets and device
pub struct RelayStack {
    iface: Interface,
    sockets: SocketSet<'static>,
    device: QueueDevice,
}

impl RelayStack {
    /// Create a stack owning `stack_ip`
    pub fn new(stack_ip: Ipv4Addr, mtu: usize) -> Result<Self, TunnelError> {
        let mut device = QueueDevice::new(mtu);
        let config = Config::new(HardwareAddress::Ip);
        let mut iface = Interface::new(config, &mut device, Instant::now());

        iface.update_ip_addrs(|addrs| {
            addrs.push(IpCidr::new(IpAddress::Ipv4(stack_ip), 32)).ok();
        });
        iface
            .routes_mut()
            .add_default_ipv4_route(stack_ip)
            .map_err(|_| TunnelError::Device("relay route table is full".to_string()))?;
        iface.set_any_ip(true);

        debug!("Relay stack created: ip={}, mtu={}", stack_ip, mtu);
        Ok(Self {
            iface,
            sockets: SocketSet::new(Vec::new()),
            device,
        })
    }

    /// Create a socket listening on `dst`
    pub fn listen(&mut self, dst: SocketAddrV4) -> Result<SocketHandle, TunnelError> {
        let rx = tcp::SocketBuffer::new(vec![0u8; TCP_RX_BUF_SIZE]);
        let tx = tcp::SocketBuffer::new(vec![0u8; TCP_TX_BUF_SIZE]);
        let mut socket = tcp::Socket::new(rx, tx);
        socket.set_nagle_enabled(false);
        socket
            .listen(IpListenEndpoint {
                addr: Some(IpAddress::Ipv4(*dst.ip())),
                port: dst.port(),
            })
            .map_err(|e| TunnelError::Device(format!("cannot listen on {}: {:?}", dst, e)))?;
        Ok(self.sockets.add(socket))
    }

    /// Process queued packets and socket state
    pub fn poll(&mut self) {
        let _ = self
            .iface
            .poll(Instant::now(), &mut self.device, &mut self.sockets);
    }

    /// How long until the stack needs polling again
    pub fn poll_delay(&mut self) -> Option<Duration> {
        self.iface
            .poll_delay(Instant::now(), &self.sockets)
            .map(|d| Duration::from_micros(d.total_micros()))
    }

    /// Queue an inbound packet
    pub fn inject_packet(&mut self, packet: &[u8]) {
        self.device.inject_rx(packet);
    }

    /// Take outbound packets
    pub fn drain_tx_packets(&mut self) -> Vec<Vec<u8>> {
        self.device.drain_tx().collect()
    }

    /// Socket for a flow
    pub fn socket(&self, handle: SocketHandle) -> &tcp::Socket<'static> {
        self.sockets.get::<tcp::Socket<'static>>(handle)
    }

    /// Mutable socket for a flow
    pub fn socket_mut(&mut self, handle: SocketHandle) -> &mut tcp::Socket<'static> {
        self.sockets.get_mut::<tcp::Socket<'static>>(handle)
    }

    /// Drop a socket
    pub fn remove(&mut self, handle: SocketHandle) {
        self.sockets.remove(handle);
    }
}

impl std::fmt::Debug for RelayStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayStack")
            .field("device", &self.device)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use smoltcp::wire::{Ipv4Packet, TcpPacket};

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

    /// A bare IPv4 TCP segment with valid checksums
    pub(crate) fn tcp_segment(src: SocketAddrV4, dst: SocketAddrV4, flags: u8, seq: u32, ack: u32) -> Vec<u8> {
        let mut tcp = Vec::with_capacity(20);
        tcp.extend_from_slice(&src.port().to_be_bytes());
        tcp.extend_from_slice(&dst.port().to_be_bytes());
        tcp.extend_from_slice(&seq.to_be_bytes());
        tcp.extend_from_slice(&ack.to_be_bytes());
        tcp.extend_from_slice(&[0x50, flags, 0xff, 0xff, 0, 0, 0, 0]);

        let mut pseudo = Vec::with_capacity(12);
        pseudo.extend_from_slice(&src.ip().octets());
        pseudo.extend_from_slice(&dst.ip().octets());
        pseudo.extend_from_slice(&[0, 6, 0, tcp.len() as u8]);
        let csum = fold(sum_words(&pseudo) + sum_words(&tcp));
        tcp[16..18].copy_from_slice(&csum.to_be_bytes());

        let total = (20 + tcp.len()) as u16;
        let mut ip = vec![0x45, 0];
        ip.extend_from_slice(&total.to_be_bytes());
        ip.extend_from_slice(&[0, 1, 0x40, 0, 64, 6, 0, 0]);
        ip.extend_from_slice(&src.ip().octets());
        ip.extend_from_slice(&dst.ip().octets());
        let csum = fold(sum_words(&ip));
        ip[10..12].copy_from_slice(&csum.to_be_bytes());

        ip.extend_from_slice(&tcp);
        ip
    }

    fn client() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(100, 100, 0, 1), 40000)
    }

    fn target() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 5), 5432)
    }

    #[test]
    fn test_listener_answers_syn_for_foreign_address() {
        let mut stack = RelayStack::new(Ipv4Addr::new(100, 100, 0, 2), 1500).unwrap();
        let handle = stack.listen(target()).unwrap();

        stack.inject_packet(&tcp_segment(client(), target(), 0x02, 1000, 0));
        stack.poll();

        let packets = stack.drain_tx_packets();
        assert_eq!(packets.len(), 1);
        let ip = Ipv4Packet::new_checked(&packets[0][..]).unwrap();
        assert_eq!(ip.src_addr(), *target().ip());
        assert_eq!(ip.dst_addr(), *client().ip());
        let tcp = TcpPacket::new_checked(ip.payload()).unwrap();
        assert!(tcp.syn() && tcp.ack());
        assert_eq!(tcp.dst_port(), 40000);
        assert_eq!(tcp.ack_number().0, 1001);
        assert_eq!(stack.socket(handle).state(), tcp::State::SynReceived);
    }

    #[test]
    fn test_syn_without_listener_is_reset() {
        let mut stack = RelayStack::new(Ipv4Addr::new(100, 100, 0, 2), 1500).unwrap();
        stack.inject_packet(&tcp_segment(client(), target(), 0x02, 1000, 0));
        stack.poll();

        let packets = stack.drain_tx_packets();
        assert_eq!(packets.len(), 1);
        let ip = Ipv4Packet::new_checked(&packets[0][..]).unwrap();
        let tcp = TcpPacket::new_checked(ip.payload()).unwrap();
        assert!(tcp.rst());
    }
}
