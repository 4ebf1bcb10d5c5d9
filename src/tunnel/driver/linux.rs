//! Linux driver built on iproute2
//!
//! The device is a persistent `tuntap` interface owned by the invoking user,
//! so `tunnel start` can reopen it later. Routes are bound to the device and
//! replaced wholesale with `ip route flush dev`. The routes found on the
//! device before a replacement, including ones left by an earlier run, are
//! put back if the replacement fails.

use super::{DriverContext, InstallOutcome};
use crate::error::TunnelError;
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use tracing::{error, info, warn};

/// `ip` based driver
pub struct LinuxDriver {
    pub(super) ctx: DriverContext,
    pub(super) routes: Vec<Ipv4Net>,
}

impl LinuxDriver {
    pub(super) fn new(ctx: DriverContext) -> Self {
        LinuxDriver {
            ctx,
            routes: Vec::new(),
        }
    }

    pub(super) async fn is_installed(&self) -> Result<bool, TunnelError> {
        let name = &self.ctx.device().name;
        Ok(self.ctx.probe("ip", &["link", "show", "dev", name]).await?.success())
    }

    pub(super) async fn install(&self) -> Result<InstallOutcome, TunnelError> {
        self.ctx.require_root().await?;
        let device = self.ctx.device().clone();
        if self.is_installed().await? {
            info!("Device {} already present", device.name);
            return Ok(InstallOutcome::AlreadyPresent);
        }

        let mut args: Vec<&str> = vec!["tuntap", "add", "dev", device.name.as_str(), "mode", "tun"];
        if let Some(owner) = &device.owner {
            args.extend(["user", owner.as_str()]);
        }
        self.ctx.run("ip", &args).await?;

        let local = format!("{}/32", device.address);
        let peer = format!("{}/32", device.peer);
        let mtu = device.mtu.to_string();
        let configured = async {
            self.ctx
                .run("ip", &["addr", "add", &local, "peer", &peer, "dev", &device.name])
                .await?;
            self.ctx
                .run("ip", &["link", "set", "dev", &device.name, "mtu", &mtu])
                .await
        }
        .await;
        if let Err(e) = configured {
            warn!("Configuring {} failed, removing it", device.name);
            self.ctx
                .run_quiet("ip", &["tuntap", "del", "dev", &device.name, "mode", "tun"])
                .await;
            return Err(e);
        }

        info!("Created device {} ({} peer {})", device.name, device.address, device.peer);
        Ok(InstallOutcome::Created)
    }

    async fn apply(&self, routes: &[Ipv4Net]) -> Result<(), TunnelError> {
        let name = &self.ctx.device().name;
        self.ctx.run("ip", &["route", "flush", "dev", name]).await?;
        for route in routes {
            let cidr = route.to_string();
            self.ctx
                .run("ip", &["route", "add", &cidr, "dev", name])
                .await?;
        }
        Ok(())
    }

    /// Routes the kernel currently sends through the device
    async fn current_routes(&self) -> Result<Vec<Ipv4Net>, TunnelError> {
        let name = &self.ctx.device().name;
        let output = self.ctx.run("ip", &["-4", "route", "show", "dev", name]).await?;
        Ok(parse_routes(&output.stdout))
    }

    pub(super) async fn start(&mut self, routes: &[Ipv4Net]) -> Result<(), TunnelError> {
        let name = self.ctx.device().name.clone();
        self.ctx.run("ip", &["link", "set", "dev", &name, "up"]).await?;

        let previous = match self.current_routes().await {
            Ok(found) => found,
            Err(e) => {
                warn!("Cannot read routes on {}, keeping the recorded set: {}", name, e);
                self.routes.clone()
            }
        };

        if let Err(e) = self.apply(routes).await {
            warn!("Route update on {} failed, restoring previous routes: {}", name, e);
            match self.apply(&previous).await {
                Ok(()) => self.routes = previous,
                Err(restore) => error!("Failed to restore routes on {}: {}", name, restore),
            }
            return Err(e);
        }
        self.routes = routes.to_vec();
        info!("{} routes {} network(s)", name, routes.len());
        Ok(())
    }

    pub(super) async fn destroy(&mut self) -> Result<(), TunnelError> {
        self.ctx.require_root().await?;
        let name = self.ctx.device().name.clone();
        if !self.is_installed().await? {
            self.routes.clear();
            return Ok(());
        }

        self.ctx.run_quiet("ip", &["route", "flush", "dev", &name]).await;
        self.routes.clear();
        self.ctx.run("ip", &["link", "set", "dev", &name, "down"]).await?;
        self.ctx
            .run("ip", &["tuntap", "del", "dev", &name, "mode", "tun"])
            .await?;
        info!("Removed device {}", name);
        Ok(())
    }
}

/// Destinations from `ip -4 route show dev` output
///
/// Host routes are printed without a prefix length.
fn parse_routes(output: &str) -> Vec<Ipv4Net> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(|dest| {
            dest.parse::<Ipv4Net>()
                .ok()
                .or_else(|| dest.parse::<Ipv4Addr>().ok().map(Ipv4Net::from))
        })
        .collect()
}
