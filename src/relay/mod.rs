//! User-space TCP relay
//!
//! Packets read from the TUN device feed a smoltcp interface that accepts
//! connections for any routed destination. Each accepted flow is re-dialed
//! through the local SOCKS5 listener.

mod device;
mod engine;
mod stack;

pub use device::QueueDevice;
pub use engine::{RelayEngine, RelaySettings};
pub use stack::RelayStack;
