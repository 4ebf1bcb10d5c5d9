//! russh client session to the bastion

use crate::config::BastionConfig;
use crate::error::TunnelError;
use crate::socks::{Dialer, ProxyStream, TargetAddr};
use async_trait::async_trait;
use russh::client::{self, Handle, Handler};
use russh::keys::{load_secret_key, HashAlg, PrivateKeyWithHashAlg, PublicKey};
use russh::{ChannelOpenFailure, Disconnect};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Opens bastion sessions
#[async_trait]
pub trait BastionConnector: Send + Sync {
    /// Connect and authenticate, returning a dialer over the session
    async fn connect(&self, bastion: &BastionConfig) -> Result<Arc<dyn Dialer>, TunnelError>;
}

/// Verifies the bastion host key
struct HostKeyCheck {
    endpoint: String,
    pinned: Option<String>,
}

impl Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        match &self.pinned {
            Some(pinned) if pinned == &fingerprint => {
                debug!("Host key for {} matches pinned fingerprint", self.endpoint);
                Ok(true)
            }
            Some(pinned) => {
                warn!(
                    "Host key mismatch for {}: expected {}, got {}",
                    self.endpoint, pinned, fingerprint
                );
                Ok(false)
            }
            None => {
                info!("Bastion {} host key {}", self.endpoint, fingerprint);
                Ok(true)
            }
        }
    }
}

/// Connects to the bastion with russh and public-key auth
#[derive(Debug, Default, Clone, Copy)]
pub struct SshConnector;

#[async_trait]
impl BastionConnector for SshConnector {
    async fn connect(&self, bastion: &BastionConfig) -> Result<Arc<dyn Dialer>, TunnelError> {
        Ok(Arc::new(SshSession::connect(bastion).await?))
    }
}

/// An authenticated bastion session
pub struct SshSession {
    handle: Handle<HostKeyCheck>,
    endpoint: String,
    closed: Mutex<bool>,
}

impl SshSession {
    /// Connect to and authenticate with the bastion
    pub async fn connect(bastion: &BastionConfig) -> Result<Self, TunnelError> {
        let key_path = bastion.resolved_key_path();
        let key = load_secret_key(&key_path, bastion.passphrase.as_deref()).map_err(|e| {
            TunnelError::SshAuth(format!("cannot load key {}: {}", key_path.display(), e))
        })?;

        let endpoint = bastion.endpoint();
        let config = Arc::new(client::Config {
            keepalive_interval: Some(Duration::from_secs(bastion.keepalive_interval)),
            ..Default::default()
        });
        let check = HostKeyCheck {
            endpoint: endpoint.clone(),
            pinned: bastion.fingerprint.clone(),
        };

        debug!("Connecting to bastion {}", endpoint);
        let connect = client::connect(config, (bastion.host.as_str(), bastion.port), check);
        let mut handle = match tokio::time::timeout(Duration::from_secs(bastion.connect_timeout), connect).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(russh::Error::UnknownKey)) => {
                return Err(TunnelError::SshConnect(format!(
                    "{}: host key does not match the pinned fingerprint",
                    endpoint
                )))
            }
            Ok(Err(e)) => return Err(TunnelError::SshConnect(format!("{}: {}", endpoint, e))),
            Err(_) => {
                return Err(TunnelError::SshConnect(format!(
                    "{}: timed out after {}s",
                    endpoint, bastion.connect_timeout
                )))
            }
        };

        let hash = handle
            .best_supported_rsa_hash()
            .await
            .map_err(|e| TunnelError::SshConnect(format!("{}: {}", endpoint, e)))?
            .flatten();
        let auth = handle
            .authenticate_publickey(&bastion.user, PrivateKeyWithHashAlg::new(Arc::new(key), hash))
            .await
            .map_err(|e| TunnelError::SshAuth(format!("{}: {}", endpoint, e)))?;
        if !auth.success() {
            return Err(TunnelError::SshAuth(format!(
                "{} rejected public key for {}",
                endpoint, bastion.user
            )));
        }

        info!("SSH session to {} as {} established", endpoint, bastion.user);
        Ok(SshSession {
            handle,
            endpoint,
            closed: Mutex::new(false),
        })
    }
}

/// Map a channel open failure to the closest I/O error
fn channel_error(target: &TargetAddr, error: russh::Error) -> io::Error {
    let kind = match &error {
        russh::Error::ChannelOpenFailure(ChannelOpenFailure::ConnectFailed) => {
            io::ErrorKind::ConnectionRefused
        }
        russh::Error::ChannelOpenFailure(ChannelOpenFailure::AdministrativelyProhibited) => {
            io::ErrorKind::PermissionDenied
        }
        russh::Error::Disconnect | russh::Error::SendError => io::ErrorKind::NotConnected,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, format!("direct-tcpip to {}: {}", target, error))
}

#[async_trait]
impl Dialer for SshSession {
    async fn dial(&self, target: &TargetAddr) -> io::Result<Box<dyn ProxyStream>> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(target.host(), target.port() as u32, "127.0.0.1", 0)
            .await
            .map_err(|e| channel_error(target, e))?;
        debug!("Opened channel to {} via {}", target, self.endpoint);
        Ok(Box::new(channel.into_stream()))
    }

    async fn close(&self) {
        let mut closed = self.closed.lock().await;
        if *closed {
            return;
        }
        *closed = true;
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "tunnel stopped", "en")
            .await
        {
            debug!("Disconnect from {}: {}", self.endpoint, e);
        }
        info!("SSH session to {} closed", self.endpoint);
    }
}
