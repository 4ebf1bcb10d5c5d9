//! SOCKS5 request parser

use super::reply::build_reply;
use crate::socks::consts::*;
use crate::socks::types::{SocksCommand, TargetAddr};
use anyhow::{bail, Context, Result};
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

/// A parsed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Requested command, `None` when the byte is unknown
    pub command: Option<SocksCommand>,
    /// Destination
    pub target: TargetAddr,
}

/// Parse a SOCKS5 request
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
///
/// An unknown address type is answered with "address type not supported"
/// since the rest of the request cannot be framed.
pub async fn parse_command<S>(stream: &mut S) -> Result<Request>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 4];
    stream
        .read_exact(&mut header)
        .await
        .with_context(|| "Failed to read command header")?;

    let [version, cmd_byte, _reserved, addr_type] = header;
    if version != SOCKS5_VERSION {
        bail!("Unsupported SOCKS version in command: {}", version);
    }

    let target = match addr_type {
        SOCKS5_ADDR_TYPE_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            TargetAddr::ipv4(Ipv4Addr::from(addr), read_port(stream).await?)
        }
        SOCKS5_ADDR_TYPE_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            if len == 0 || len > MAX_DOMAIN_LEN {
                bail!("Invalid domain length: {}", len);
            }
            let mut domain = vec![0u8; len];
            stream.read_exact(&mut domain).await?;
            let domain = String::from_utf8(domain).with_context(|| "Invalid UTF-8 in domain name")?;
            TargetAddr::domain(domain, read_port(stream).await?)
        }
        SOCKS5_ADDR_TYPE_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            TargetAddr::ipv6(Ipv6Addr::from(addr), read_port(stream).await?)
        }
        other => {
            build_reply(stream, SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED, None).await?;
            bail!("Unsupported address type: {}", other);
        }
    };

    Ok(Request {
        command: SocksCommand::from_byte(cmd_byte),
        target,
    })
}

async fn read_port<S: AsyncRead + Unpin>(stream: &mut S) -> Result<u16> {
    Ok(stream.read_u16().await?)
}
