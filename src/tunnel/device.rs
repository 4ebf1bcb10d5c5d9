//! Packet device abstraction
//!
//! The relay reads and writes raw IPv4 packets through [`PacketSource`] and
//! [`PacketSink`]. [`TunOpener`] binds them to the OS TUN device;
//! [`MemoryOpener`] backs them with channels for tests.

use super::driver::DeviceSpec;
use crate::error::TunnelError;
use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Inbound side of a packet device
#[async_trait]
pub trait PacketSource: Send {
    /// Read one packet into `buf`, returning its length
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Outbound side of a packet device
#[async_trait]
pub trait PacketSink: Send {
    /// Write one packet
    async fn send(&mut self, packet: &[u8]) -> io::Result<()>;
}

/// An opened device, split into its two directions
pub struct PacketDevice {
    /// Packets leaving the host towards the tunnel
    pub source: Box<dyn PacketSource>,
    /// Packets delivered back to the host
    pub sink: Box<dyn PacketSink>,
    /// Device MTU
    pub mtu: usize,
}

/// Opens the packet device for a session
#[async_trait]
pub trait DeviceOpener: Send + Sync {
    /// Open the device described by `spec`
    async fn open(&self, spec: &DeviceSpec) -> Result<PacketDevice, TunnelError>;
}

/// Map an open error onto the tunnel error taxonomy
fn open_error(name: &str, e: io::Error) -> TunnelError {
    match e.raw_os_error() {
        Some(16) => TunnelError::DeviceBusy(format!("{} is held by another process", name)),
        Some(1) | Some(13) => TunnelError::PrivilegeDenied(format!("cannot open {}: {}", name, e)),
        _ if e.kind() == io::ErrorKind::PermissionDenied => {
            TunnelError::PrivilegeDenied(format!("cannot open {}: {}", name, e))
        }
        _ => TunnelError::Device(format!("cannot open {}: {}", name, e)),
    }
}

/// Opens the OS TUN device with the `tun` crate
#[derive(Debug, Default, Clone, Copy)]
pub struct TunOpener;

/// Whether reads and writes carry the 4-byte address family header
const PACKET_INFO: bool = cfg!(target_os = "macos");

/// AF_INET in the header macOS prepends to every utun packet
const AF_INET_HEADER: [u8; 4] = [0, 0, 0, 2];

struct TunSource {
    inner: ReadHalf<tun::AsyncDevice>,
    scratch: Vec<u8>,
}

#[async_trait]
impl PacketSource for TunSource {
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !PACKET_INFO {
            return self.inner.read(buf).await;
        }
        loop {
            let n = self.inner.read(&mut self.scratch).await?;
            if n == 0 {
                return Ok(0);
            }
            if n <= AF_INET_HEADER.len() {
                continue;
            }
            let len = (n - AF_INET_HEADER.len()).min(buf.len());
            buf[..len].copy_from_slice(&self.scratch[AF_INET_HEADER.len()..AF_INET_HEADER.len() + len]);
            return Ok(len);
        }
    }
}

struct TunSink {
    inner: WriteHalf<tun::AsyncDevice>,
    scratch: Vec<u8>,
}

#[async_trait]
impl PacketSink for TunSink {
    async fn send(&mut self, packet: &[u8]) -> io::Result<()> {
        if !PACKET_INFO {
            return self.inner.write_all(packet).await;
        }
        self.scratch.clear();
        self.scratch.extend_from_slice(&AF_INET_HEADER);
        self.scratch.extend_from_slice(packet);
        self.inner.write_all(&self.scratch).await
    }
}

#[async_trait]
impl DeviceOpener for TunOpener {
    async fn open(&self, spec: &DeviceSpec) -> Result<PacketDevice, TunnelError> {
        let mut config = tun::Configuration::default();
        config
            .name(&spec.name)
            .address(spec.address)
            .destination(spec.peer)
            .netmask(spec.link_net().netmask())
            .mtu(spec.mtu as i32)
            .up();
        #[cfg(target_os = "linux")]
        config.platform(|platform| {
            platform.packet_information(false);
        });

        let device = tun::create_as_async(&config).map_err(|e| match e {
            tun::Error::Io(io) => open_error(&spec.name, io),
            other => TunnelError::Device(format!("cannot open {}: {}", spec.name, other)),
        })?;
        info!("Opened tunnel device {}", spec.name);

        let (reader, writer) = tokio::io::split(device);
        let frame = spec.mtu + AF_INET_HEADER.len();
        Ok(PacketDevice {
            source: Box::new(TunSource {
                inner: reader,
                scratch: vec![0u8; frame],
            }),
            sink: Box::new(TunSink {
                inner: writer,
                scratch: Vec::with_capacity(frame),
            }),
            mtu: spec.mtu,
        })
    }
}

/// The test side of a memory device
pub struct PacketPeer {
    to_device: mpsc::Sender<Vec<u8>>,
    from_device: mpsc::Receiver<Vec<u8>>,
}

impl PacketPeer {
    /// Deliver a packet as if the host had sent it into the tunnel
    pub async fn inject(&self, packet: Vec<u8>) -> bool {
        self.to_device.send(packet).await.is_ok()
    }

    /// Next packet the relay wrote back to the host
    pub async fn next_packet(&mut self) -> Option<Vec<u8>> {
        self.from_device.recv().await
    }
}

struct MemorySource(mpsc::Receiver<Vec<u8>>);

#[async_trait]
impl PacketSource for MemorySource {
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.0.recv().await {
            Some(packet) => {
                let len = packet.len().min(buf.len());
                buf[..len].copy_from_slice(&packet[..len]);
                Ok(len)
            }
            None => Ok(0),
        }
    }
}

struct MemorySink(mpsc::Sender<Vec<u8>>);

#[async_trait]
impl PacketSink for MemorySink {
    async fn send(&mut self, packet: &[u8]) -> io::Result<()> {
        self.0
            .send(packet.to_vec())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "packet peer dropped"))
    }
}

/// Create a channel-backed device and the peer driving it
pub fn memory_device(mtu: usize) -> (PacketDevice, PacketPeer) {
    let (to_device, device_rx) = mpsc::channel(256);
    let (device_tx, from_device) = mpsc::channel(256);
    let device = PacketDevice {
        source: Box::new(MemorySource(device_rx)),
        sink: Box::new(MemorySink(device_tx)),
        mtu,
    };
    (device, PacketPeer { to_device, from_device })
}

/// Hands out channel-backed devices; each open publishes its peer
pub struct MemoryOpener {
    peers: mpsc::UnboundedSender<PacketPeer>,
    busy: bool,
}

impl MemoryOpener {
    /// Create an opener and the stream of peers for opened devices
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PacketPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (MemoryOpener { peers, busy: false }, rx)
    }

    /// An opener whose device is always held elsewhere
    pub fn busy() -> Self {
        let (mut opener, _) = Self::new();
        opener.busy = true;
        opener
    }
}

#[async_trait]
impl DeviceOpener for MemoryOpener {
    async fn open(&self, spec: &DeviceSpec) -> Result<PacketDevice, TunnelError> {
        if self.busy {
            return Err(open_error(&spec.name, io::Error::from_raw_os_error(16)));
        }
        let (device, peer) = memory_device(spec.mtu);
        if self.peers.send(peer).is_err() {
            debug!("Nobody is watching memory device {}", spec.name);
        }
        Ok(device)
    }
}
