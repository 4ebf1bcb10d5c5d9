//! SSH bastion client
//!
//! One authenticated session per tunnel; every relayed flow becomes a
//! `direct-tcpip` channel multiplexed over it.

mod client;

pub use client::{BastionConnector, SshConnector, SshSession};
