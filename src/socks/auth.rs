//! SOCKS5 method negotiation
//!
//! The local server only listens on loopback and accepts the NONE method.

use super::consts::*;
use anyhow::{bail, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read the client's methods and select NONE
pub async fn negotiate<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;

    let version = buf[0];
    let num_methods = buf[1];
    if version != SOCKS5_VERSION {
        bail!("Unsupported SOCKS version: {}", version);
    }
    if num_methods == 0 {
        bail!("No authentication methods provided");
    }

    let mut methods = vec![0u8; num_methods as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&SOCKS5_AUTH_METHOD_NONE) {
        stream
            .write_all(&[SOCKS5_VERSION, SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE])
            .await?;
        stream.flush().await?;
        bail!("No acceptable authentication method");
    }

    stream
        .write_all(&[SOCKS5_VERSION, SOCKS5_AUTH_METHOD_NONE])
        .await?;
    stream.flush().await?;
    Ok(())
}
