//! Per-client SOCKS5 handling
//!
//! Negotiation, request parsing, the outbound dial and the relay for one
//! accepted client connection.

use super::auth::negotiate;
use super::command::{
    build_reply, io_error_to_reply_code, parse_command, send_command_not_supported, send_success,
};
use super::consts::*;
use super::dialer::Dialer;
use super::types::SocksCommand;
use anyhow::{bail, Context, Result};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// Handle one SOCKS5 client
pub async fn handle_client<S>(mut stream: S, dialer: &dyn Dialer, dial_timeout: Duration) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    negotiate(&mut stream)
        .await
        .with_context(|| "Authentication negotiation failed")?;

    let request = parse_command(&mut stream)
        .await
        .with_context(|| "Failed to parse SOCKS5 command")?;

    match request.command {
        Some(SocksCommand::Connect) => {}
        Some(command) => {
            warn!("{} is not supported", command);
            send_command_not_supported(&mut stream).await?;
            return Ok(());
        }
        None => {
            send_command_not_supported(&mut stream).await?;
            bail!("Unknown SOCKS5 command");
        }
    }

    let target = request.target;
    debug!("CONNECT {}", target);
    let upstream = match tokio::time::timeout(dial_timeout, dialer.dial(&target)).await {
        Ok(Ok(upstream)) => upstream,
        Ok(Err(e)) => {
            warn!("Dial to {} failed: {}", target, e);
            build_reply(&mut stream, io_error_to_reply_code(&e), None).await?;
            return Ok(());
        }
        Err(_) => {
            warn!("Dial to {} timed out after {:?}", target, dial_timeout);
            build_reply(&mut stream, SOCKS5_REPLY_HOST_UNREACHABLE, None).await?;
            return Ok(());
        }
    };

    send_success(&mut stream, None).await?;
    info!("Tunnel established to {}", target);

    relay(stream, upstream).await;
    Ok(())
}

/// Copy in both directions until both sides have finished
async fn relay<A, B>(mut a: A, mut b: B)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::io::copy_bidirectional(&mut a, &mut b).await {
        Ok((up, down)) => debug!("Relay finished: {} bytes up, {} bytes down", up, down),
        Err(e) => debug!("Relay error: {}", e),
    }
}
