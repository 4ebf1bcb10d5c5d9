//! SOCKS5 reply builder

use crate::socks::consts::*;
use anyhow::Result;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Send a SOCKS5 reply
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
/// +----+-----+-------+------+----------+----------+
/// ```
///
/// `bind_addr` defaults to `0.0.0.0:0`.
pub async fn build_reply<S>(stream: &mut S, reply_code: u8, bind_addr: Option<SocketAddr>) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let bind_addr = bind_addr.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));

    let mut reply = vec![SOCKS5_VERSION, reply_code, SOCKS5_RESERVED];
    match bind_addr {
        SocketAddr::V4(addr) => {
            reply.push(SOCKS5_ADDR_TYPE_IPV4);
            reply.extend_from_slice(&addr.ip().octets());
        }
        SocketAddr::V6(addr) => {
            reply.push(SOCKS5_ADDR_TYPE_IPV6);
            reply.extend_from_slice(&addr.ip().octets());
        }
    }
    reply.extend_from_slice(&bind_addr.port().to_be_bytes());

    stream.write_all(&reply).await?;
    stream.flush().await?;
    Ok(())
}

/// Send a success reply
pub async fn send_success<S>(stream: &mut S, bind_addr: Option<SocketAddr>) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    build_reply(stream, SOCKS5_REPLY_SUCCEEDED, bind_addr).await
}

/// Send a "command not supported" reply
pub async fn send_command_not_supported<S>(stream: &mut S) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    build_reply(stream, SOCKS5_REPLY_COMMAND_NOT_SUPPORTED, None).await
}

/// Reply code for a failed dial
pub fn io_error_to_reply_code(error: &io::Error) -> u8 {
    match error.kind() {
        io::ErrorKind::ConnectionRefused => SOCKS5_REPLY_CONNECTION_REFUSED,
        io::ErrorKind::TimedOut => SOCKS5_REPLY_HOST_UNREACHABLE,
        io::ErrorKind::AddrNotAvailable => SOCKS5_REPLY_HOST_UNREACHABLE,
        io::ErrorKind::NotFound => SOCKS5_REPLY_HOST_UNREACHABLE,
        io::ErrorKind::PermissionDenied => SOCKS5_REPLY_CONNECTION_NOT_ALLOWED,
        io::ErrorKind::Unsupported => SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED,
        io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe => SOCKS5_REPLY_NETWORK_UNREACHABLE,
        _ => SOCKS5_REPLY_GENERAL_FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[tokio::test]
    async fn test_reply_ipv4() {
        let mut buffer = Vec::new();
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)), 8080);
        send_success(&mut buffer, Some(addr)).await.unwrap();

        assert_eq!(&buffer[..4], &[SOCKS5_VERSION, SOCKS5_REPLY_SUCCEEDED, SOCKS5_RESERVED, SOCKS5_ADDR_TYPE_IPV4]);
        assert_eq!(&buffer[4..8], &[192, 168, 1, 1]);
        assert_eq!(&buffer[8..10], &8080u16.to_be_bytes());
    }

    #[tokio::test]
    async fn test_reply_ipv6_and_default() {
        let mut buffer = Vec::new();
        let addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 443);
        build_reply(&mut buffer, SOCKS5_REPLY_SUCCEEDED, Some(addr)).await.unwrap();
        assert_eq!(buffer.len(), 3 + 1 + 16 + 2);

        let mut buffer = Vec::new();
        send_command_not_supported(&mut buffer).await.unwrap();
        assert_eq!(buffer, vec![5, SOCKS5_REPLY_COMMAND_NOT_SUPPORTED, 0, 1, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_io_error_to_reply_code() {
        let cases = [
            (io::ErrorKind::ConnectionRefused, SOCKS5_REPLY_CONNECTION_REFUSED),
            (io::ErrorKind::TimedOut, SOCKS5_REPLY_HOST_UNREACHABLE),
            (io::ErrorKind::PermissionDenied, SOCKS5_REPLY_CONNECTION_NOT_ALLOWED),
            (io::ErrorKind::BrokenPipe, SOCKS5_REPLY_NETWORK_UNREACHABLE),
            (io::ErrorKind::Other, SOCKS5_REPLY_GENERAL_FAILURE),
        ];
        for (kind, code) in cases {
            assert_eq!(io_error_to_reply_code(&io::Error::new(kind, "x")), code);
        }
    }
}
