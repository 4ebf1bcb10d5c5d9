//! Network tunnel
//!
//! A TUN device captures traffic for private ranges; the relay terminates it
//! and forwards each TCP flow through SOCKS5 over an SSH session to the
//! bastion. [`TunnelController`] owns the lifecycle, [`NetworkDriver`] the OS
//! side.

mod controller;
mod device;
pub mod driver;

pub use controller::{TunnelController, TunnelState};
pub use device::{
    memory_device, DeviceOpener, MemoryOpener, PacketDevice, PacketPeer, PacketSink, PacketSource,
    TunOpener,
};
pub use driver::{CommandRunner, DeviceSpec, InstallOutcome, NetworkDriver, RecordingRunner, SystemRunner};
