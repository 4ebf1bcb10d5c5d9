//! Platform network drivers
//!
//! A [`NetworkDriver`] owns the OS side of the tunnel: the persistent TUN
//! device, its addressing and the routes pointing into it. The variant is
//! chosen once from the host OS; everything else is plain command execution
//! through a [`CommandRunner`].

mod linux;
mod macos;
mod runner;
mod windows;

pub use linux::LinuxDriver;
pub use macos::MacOsDriver;
pub use runner::{check, command_line, CommandOutput, CommandRunner, RecordingRunner, SystemRunner};
pub use windows::WindowsDriver;

use crate::config::TunnelConfig;
use crate::error::TunnelError;
use ipnet::{IpNet, Ipv4Net};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of an install
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// The device was created (or will be created when the tunnel opens it)
    Created,
    /// The device already existed
    AlreadyPresent,
}

/// Device naming and addressing shared by every driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    /// Interface name
    pub name: String,
    /// Address of the interface
    pub address: Ipv4Addr,
    /// Point-to-point peer (the relay stack)
    pub peer: Ipv4Addr,
    /// Interface MTU
    pub mtu: usize,
    /// Owner of the persistent device
    pub owner: Option<String>,
}

impl DeviceSpec {
    /// Build from tunnel configuration
    pub fn from_config(config: &TunnelConfig) -> Self {
        DeviceSpec {
            name: config.device.clone(),
            address: config.address,
            peer: config.stack_address,
            mtu: config.mtu,
            owner: config.device_owner(),
        }
    }

    /// Smallest network holding both the address and the peer
    pub fn link_net(&self) -> Ipv4Net {
        let common = (u32::from(self.address) ^ u32::from(self.peer)).leading_zeros() as u8;
        Ipv4Net::new(self.address, common.min(32))
            .map(|n| n.trunc())
            .unwrap_or_else(|_| Ipv4Net::from(self.address))
    }
}

/// Command execution plus the device it targets
#[derive(Clone)]
pub struct DriverContext {
    runner: Arc<dyn CommandRunner>,
    device: DeviceSpec,
}

impl DriverContext {
    /// Create a context
    pub fn new(runner: Arc<dyn CommandRunner>, device: DeviceSpec) -> Self {
        DriverContext { runner, device }
    }

    /// Device this context targets
    pub fn device(&self) -> &DeviceSpec {
        &self.device
    }

    /// Run a command, failing on a non-zero exit
    pub(crate) async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, TunnelError> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let output = self.runner.run(program, &args).await?;
        check(program, &args, output)
    }

    /// Run a command and return its output whatever the exit code
    pub(crate) async fn probe(&self, program: &str, args: &[&str]) -> Result<CommandOutput, TunnelError> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.runner.run(program, &args).await
    }

    /// Run a cleanup command, logging failures
    pub(crate) async fn run_quiet(&self, program: &str, args: &[&str]) {
        if let Err(e) = self.run(program, args).await {
            debug!("Ignoring cleanup failure: {}", e);
        }
    }

    /// Fail unless running as root
    pub(crate) async fn require_root(&self) -> Result<(), TunnelError> {
        let output = self.probe("id", &["-u"]).await?;
        if output.success() && output.stdout.trim() == "0" {
            Ok(())
        } else {
            Err(TunnelError::PrivilegeDenied(
                "root privileges are required (try sudo)".to_string(),
            ))
        }
    }
}

/// OS-specific network driver
pub enum NetworkDriver {
    /// `ip` based driver
    Linux(LinuxDriver),
    /// `ifconfig`/`route` based driver
    MacOs(MacOsDriver),
    /// `netsh` based driver
    Windows(WindowsDriver),
}

impl NetworkDriver {
    /// Driver for the running OS
    pub fn for_host(config: &TunnelConfig, runner: Arc<dyn CommandRunner>) -> Result<Self, TunnelError> {
        Self::for_os(std::env::consts::OS, config, runner)
    }

    /// Driver for a named OS (`linux`, `macos`, `windows`)
    pub fn for_os(
        os: &str,
        config: &TunnelConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, TunnelError> {
        let ctx = DriverContext::new(runner, DeviceSpec::from_config(config));
        match os {
            "linux" => Ok(NetworkDriver::Linux(LinuxDriver::new(ctx))),
            "macos" => Ok(NetworkDriver::MacOs(MacOsDriver::new(ctx))),
            "windows" => Ok(NetworkDriver::Windows(WindowsDriver::new(ctx))),
            other => Err(TunnelError::Unsupported(format!(
                "no network driver for {}",
                other
            ))),
        }
    }

    fn context(&self) -> &DriverContext {
        match self {
            NetworkDriver::Linux(d) => &d.ctx,
            NetworkDriver::MacOs(d) => &d.ctx,
            NetworkDriver::Windows(d) => &d.ctx,
        }
    }

    /// Interface name
    pub fn device_name(&self) -> &str {
        &self.context().device.name
    }

    /// Device addressing
    pub fn device(&self) -> &DeviceSpec {
        &self.context().device
    }

    /// Whether the device exists
    pub async fn is_installed(&self) -> Result<bool, TunnelError> {
        match self {
            NetworkDriver::Linux(d) => d.is_installed().await,
            NetworkDriver::MacOs(d) => d.is_installed().await,
            NetworkDriver::Windows(d) => d.is_installed().await,
        }
    }

    /// Create the persistent device; safe to repeat
    pub async fn install(&self) -> Result<InstallOutcome, TunnelError> {
        match self {
            NetworkDriver::Linux(d) => d.install().await,
            NetworkDriver::MacOs(d) => d.install().await,
            NetworkDriver::Windows(d) => d.install().await,
        }
    }

    /// Bring the device up and route exactly `routes` into it
    ///
    /// On failure the previously active route set is re-applied.
    pub async fn start(&mut self, routes: &[IpNet]) -> Result<(), TunnelError> {
        let routes = ipv4_routes(routes)?;
        match self {
            NetworkDriver::Linux(d) => d.start(&routes).await,
            NetworkDriver::MacOs(d) => d.start(&routes).await,
            NetworkDriver::Windows(d) => d.start(&routes).await,
        }
    }

    /// Remove routes, take the device down and delete it
    pub async fn destroy(&mut self) -> Result<(), TunnelError> {
        match self {
            NetworkDriver::Linux(d) => d.destroy().await,
            NetworkDriver::MacOs(d) => d.destroy().await,
            NetworkDriver::Windows(d) => d.destroy().await,
        }
    }

    /// Routes applied by the last successful `start`
    pub fn active_routes(&self) -> &[Ipv4Net] {
        match self {
            NetworkDriver::Linux(d) => &d.routes,
            NetworkDriver::MacOs(d) => &d.routes,
            NetworkDriver::Windows(d) => &d.routes,
        }
    }
}

/// Normalize routes to IPv4 networks
fn ipv4_routes(routes: &[IpNet]) -> Result<Vec<Ipv4Net>, TunnelError> {
    let mut out: Vec<Ipv4Net> = Vec::with_capacity(routes.len());
    for route in routes {
        match route {
            IpNet::V4(net) => {
                let net = net.trunc();
                if !out.contains(&net) {
                    out.push(net);
                }
            }
            IpNet::V6(net) => {
                warn!("Refusing IPv6 route {}", net);
                return Err(TunnelError::Unsupported(format!(
                    "IPv6 route {} (the relay carries IPv4 only)",
                    net
                )));
            }
        }
    }
    Ok(out)
}
