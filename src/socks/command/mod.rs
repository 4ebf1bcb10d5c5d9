//! SOCKS5 request parsing and replies

mod parser;
mod reply;

pub use parser::{parse_command, Request};
pub use reply::{build_reply, io_error_to_reply_code, send_command_not_supported, send_success};
