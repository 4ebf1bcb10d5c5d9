//! Tunnel configuration types
//!
//! Device addressing, relay timeouts and bastion connection settings.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default device name for the host operating system
fn default_device() -> String {
    match std::env::consts::OS {
        "macos" => "utun9".to_string(),
        "windows" => "devtunnel".to_string(),
        _ => "devtun0".to_string(),
    }
}

/// Default local address of the tunnel interface
fn default_address() -> Ipv4Addr {
    Ipv4Addr::new(100, 100, 0, 1)
}

/// Default address of the user-space stack behind the interface
fn default_stack_address() -> Ipv4Addr {
    Ipv4Addr::new(100, 100, 0, 2)
}

/// Default MTU
fn default_mtu() -> usize {
    1500
}

/// Default flow idle timeout in seconds
fn default_idle_timeout() -> u64 {
    300
}

/// Default SOCKS dial timeout in seconds
fn default_dial_timeout() -> u64 {
    10
}

/// Network tunnel configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TunnelConfig {
    /// Interface name (`utunN` on macOS)
    #[serde(default = "default_device")]
    pub device: String,

    /// Address assigned to the interface
    #[serde(default = "default_address")]
    pub address: Ipv4Addr,

    /// Peer address used by the relay's TCP stack
    #[serde(default = "default_stack_address")]
    pub stack_address: Ipv4Addr,

    /// Interface MTU
    #[serde(default = "default_mtu")]
    pub mtu: usize,

    /// User that owns the persistent device (Linux); defaults to `$SUDO_USER`
    #[serde(default)]
    pub owner: Option<String>,

    /// Seconds before an idle flow is torn down
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    /// Seconds to wait for a SOCKS/SSH dial
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        TunnelConfig {
            device: default_device(),
            address: default_address(),
            stack_address: default_stack_address(),
            mtu: default_mtu(),
            owner: None,
            idle_timeout: default_idle_timeout(),
            dial_timeout: default_dial_timeout(),
        }
    }
}

impl TunnelConfig {
    /// Owner of the persistent device
    pub fn device_owner(&self) -> Option<String> {
        self.owner
            .clone()
            .or_else(|| std::env::var("SUDO_USER").ok())
            .filter(|u| !u.is_empty())
    }

    /// Flow idle timeout as a duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    /// Dial timeout as a duration
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.device.is_empty() || self.device.len() > 15 {
            return Err(format!("Invalid tunnel device name: {:?}", self.device));
        }
        if std::env::consts::OS == "macos" && !self.device.starts_with("utun") {
            return Err(format!(
                "macOS tunnel device must be named utunN, got {:?}",
                self.device
            ));
        }
        if self.address == self.stack_address {
            return Err("tunnel.address and tunnel.stack_address must differ".to_string());
        }
        if !(576..=65535).contains(&self.mtu) {
            return Err(format!("Invalid tunnel MTU: {}", self.mtu));
        }
        Ok(())
    }
}

/// Default SSH port
fn default_ssh_port() -> u16 {
    22
}

/// Default SSH keepalive in seconds
fn default_ssh_keepalive() -> u64 {
    15
}

/// Bastion host reached over SSH
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct BastionConfig {
    /// Host name or address
    pub host: String,

    /// SSH port
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Login user
    pub user: String,

    /// Private key file (`~` is expanded)
    pub key_path: PathBuf,

    /// Key passphrase
    #[serde(default)]
    pub passphrase: Option<String>,

    /// Pinned host key fingerprint (`SHA256:...`)
    #[serde(default)]
    pub fingerprint: Option<String>,

    /// Connect timeout in seconds
    #[serde(default = "default_dial_timeout")]
    pub connect_timeout: u64,

    /// SSH keepalive interval in seconds
    #[serde(default = "default_ssh_keepalive")]
    pub keepalive_interval: u64,
}

impl BastionConfig {
    /// Key path with a leading `~` replaced by the home directory
    pub fn resolved_key_path(&self) -> PathBuf {
        expand_home(&self.key_path)
    }

    /// `host:port` for logging
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("bastion.host must be set".to_string());
        }
        if self.user.is_empty() {
            return Err("bastion.user must be set".to_string());
        }
        if let Some(fp) = &self.fingerprint {
            if !fp.starts_with("SHA256:") {
                return Err(format!("Unsupported fingerprint format: {}", fp));
            }
        }
        Ok(())
    }
}

/// Expand a leading `~` using `$HOME` (or `%USERPROFILE%`)
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}
