//! Local SOCKS5 proxy
//!
//! A loopback-only SOCKS5 server (NONE auth, CONNECT only) that hands every
//! request to a [`Dialer`]. The tunnel plugs the bastion SSH session in as
//! the dialer so connections leave from inside the private network.

mod auth;
mod command;
mod consts;
mod dialer;
mod handler;
mod server;
mod types;

pub use auth::negotiate;
pub use command::{build_reply, io_error_to_reply_code, parse_command, Request};
pub use consts::*;
pub use dialer::{Dialer, ProxyStream};
pub use handler::handle_client;
pub use server::SocksServer;
pub use types::{SocksCommand, TargetAddr};
