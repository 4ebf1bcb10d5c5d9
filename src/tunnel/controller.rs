//! Tunnel lifecycle
//!
//! [`TunnelController`] owns the one tunnel session of the process and walks
//! it through `Uninstalled → Installed → Started ⇄ Stopped → Destroyed`.

use super::device::{DeviceOpener, PacketDevice};
use super::driver::{InstallOutcome, NetworkDriver};
use crate::config::{BastionConfig, TunnelConfig};
use crate::error::TunnelError;
use crate::relay::{RelayEngine, RelaySettings};
use crate::socks::{Dialer, SocksServer};
use crate::ssh::BastionConnector;
use ipnet::{IpNet, Ipv4Net};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle state of the tunnel session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// No device on the host
    Uninstalled,
    /// Device present, nothing running
    Installed,
    /// Relay running and routes applied
    Started,
    /// Relay stopped, routes left in place
    Stopped,
    /// Device removed
    Destroyed,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelState::Uninstalled => "uninstalled",
            TunnelState::Installed => "installed",
            TunnelState::Started => "started",
            TunnelState::Stopped => "stopped",
            TunnelState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Tasks of a started session
struct RelayHandle {
    cancel: CancellationToken,
    relay: JoinHandle<Result<(), TunnelError>>,
    socks: JoinHandle<()>,
    socks_addr: SocketAddr,
}

/// Drives the tunnel session
pub struct TunnelController {
    config: TunnelConfig,
    driver: NetworkDriver,
    opener: Arc<dyn DeviceOpener>,
    connector: Arc<dyn BastionConnector>,
    state: TunnelState,
    relay: Option<RelayHandle>,
    bastion: Option<Arc<dyn Dialer>>,
}

impl TunnelController {
    /// Create a controller in the `Uninstalled` state
    pub fn new(
        config: TunnelConfig,
        driver: NetworkDriver,
        opener: Arc<dyn DeviceOpener>,
        connector: Arc<dyn BastionConnector>,
    ) -> Self {
        TunnelController {
            config,
            driver,
            opener,
            connector,
            state: TunnelState::Uninstalled,
            relay: None,
            bastion: None,
        }
    }

    /// Current state
    pub fn state(&self) -> TunnelState {
        self.state
    }

    /// Routes currently pointed at the device
    pub fn routes(&self) -> &[Ipv4Net] {
        self.driver.active_routes()
    }

    /// Address of the local SOCKS5 listener while started
    pub fn socks_addr(&self) -> Option<SocketAddr> {
        self.relay.as_ref().map(|r| r.socks_addr)
    }

    /// Pick up a device installed by an earlier run
    pub async fn discover(&mut self) -> Result<TunnelState, TunnelError> {
        if matches!(self.state, TunnelState::Uninstalled | TunnelState::Destroyed)
            && self.driver.is_installed().await?
        {
            debug!("Found existing device {}", self.driver.device_name());
            self.state = TunnelState::Installed;
        }
        Ok(self.state)
    }

    /// Create the device; a second call finds it and changes nothing
    pub async fn install(&mut self) -> Result<InstallOutcome, TunnelError> {
        let outcome = self.driver.install().await?;
        if matches!(self.state, TunnelState::Uninstalled | TunnelState::Destroyed) {
            self.state = TunnelState::Installed;
        }
        Ok(outcome)
    }

    /// Connect the bastion, apply `routes` and start relaying
    ///
    /// On failure everything acquired so far is released and the previous
    /// routes stay in place.
    pub async fn start(&mut self, routes: &[IpNet], bastion: &BastionConfig) -> Result<(), TunnelError> {
        match self.state {
            TunnelState::Installed | TunnelState::Stopped => {}
            TunnelState::Started => return Err(TunnelError::AlreadyRunning),
            other => {
                return Err(TunnelError::InvalidState {
                    operation: "start",
                    state: other.to_string(),
                })
            }
        }
        info!("Starting tunnel on {} via {}", self.driver.device_name(), bastion.endpoint());

        let dialer = self.connector.connect(bastion).await?;

        let (device, engine, socks, socks_addr) = match self.prepare().await {
            Ok(parts) => parts,
            Err(e) => {
                dialer.close().await;
                return Err(e);
            }
        };
        if let Err(e) = self.driver.start(routes).await {
            dialer.close().await;
            return Err(e);
        }

        let cancel = CancellationToken::new();
        let socks = tokio::spawn(socks.serve(Arc::clone(&dialer), cancel.child_token()));
        let relay = tokio::spawn(engine.run(device, cancel.child_token()));

        self.relay = Some(RelayHandle {
            cancel,
            relay,
            socks,
            socks_addr,
        });
        self.bastion = Some(dialer);
        self.state = TunnelState::Started;
        info!(
            "Tunnel started: {} network(s) routed through {}",
            self.driver.active_routes().len(),
            self.driver.device_name()
        );
        Ok(())
    }

    /// Open the device and build the relay and SOCKS listener
    async fn prepare(&self) -> Result<(PacketDevice, RelayEngine, SocksServer, SocketAddr), TunnelError> {
        let device = self.opener.open(self.driver.device()).await?;
        let socks = SocksServer::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)), self.config.dial_timeout())
            .await
            .map_err(|e| TunnelError::Device(format!("cannot bind SOCKS listener: {}", e)))?;
        let socks_addr = socks
            .local_addr()
            .map_err(|e| TunnelError::Device(format!("SOCKS listener address: {}", e)))?;
        let engine = RelayEngine::new(RelaySettings {
            stack_address: self.config.stack_address,
            mtu: device.mtu,
            idle_timeout: self.config.idle_timeout(),
            dial_timeout: self.config.dial_timeout(),
            socks_addr,
        })?;
        Ok((device, engine, socks, socks_addr))
    }

    /// Replace the routed networks of a started session
    pub async fn reroute(&mut self, routes: &[IpNet]) -> Result<(), TunnelError> {
        if self.state != TunnelState::Started {
            return Err(TunnelError::InvalidState {
                operation: "reroute",
                state: self.state.to_string(),
            });
        }
        self.driver.start(routes).await
    }

    /// Stop relaying and close the bastion session, keeping routes
    pub async fn stop(&mut self) -> Result<(), TunnelError> {
        if self.state != TunnelState::Started {
            return Err(TunnelError::InvalidState {
                operation: "stop",
                state: self.state.to_string(),
            });
        }
        self.stop_relay().await;
        self.close_bastion().await;
        self.state = TunnelState::Stopped;
        info!("Tunnel stopped, routes on {} kept", self.driver.device_name());
        Ok(())
    }

    /// Tear everything down and remove the device
    pub async fn destroy(&mut self) -> Result<(), TunnelError> {
        if self.state == TunnelState::Uninstalled && !self.driver.is_installed().await? {
            debug!("Nothing to destroy");
            return Ok(());
        }

        self.stop_relay().await;
        let removed = self.driver.destroy().await;
        self.close_bastion().await;

        match removed {
            Ok(()) => {
                self.state = TunnelState::Destroyed;
                info!("Tunnel destroyed");
                Ok(())
            }
            Err(e) => {
                if self.state == TunnelState::Started {
                    self.state = TunnelState::Stopped;
                }
                Err(e)
            }
        }
    }

    async fn stop_relay(&mut self) {
        let Some(handle) = self.relay.take() else {
            return;
        };
        handle.cancel.cancel();
        match handle.relay.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Relay ended with error: {}", e),
            Err(e) => error!("Relay task failed: {}", e),
        }
        if let Err(e) = handle.socks.await {
            error!("SOCKS task failed: {}", e);
        }
    }

    async fn close_bastion(&mut self) {
        if let Some(dialer) = self.bastion.take() {
            dialer.close().await;
        }
    }
}

impl fmt::Debug for TunnelController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelController")
            .field("device", &self.driver.device_name())
            .field("state", &self.state)
            .field("routes", &self.driver.active_routes())
            .finish()
    }
}
