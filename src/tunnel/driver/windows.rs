//! Windows driver built on `netsh`
//!
//! The adapter is created by the TUN driver when the tunnel opens it, so
//! install only checks for an elevated shell.

use super::{DriverContext, InstallOutcome};
use crate::error::TunnelError;
use ipnet::Ipv4Net;
use tracing::{debug, error, info, warn};

/// `netsh` based driver
pub struct WindowsDriver {
    pub(super) ctx: DriverContext,
    pub(super) routes: Vec<Ipv4Net>,
}

impl WindowsDriver {
    pub(super) fn new(ctx: DriverContext) -> Self {
        WindowsDriver {
            ctx,
            routes: Vec::new(),
        }
    }

    async fn require_admin(&self) -> Result<(), TunnelError> {
        if self.ctx.probe("net", &["session"]).await?.success() {
            Ok(())
        } else {
            Err(TunnelError::PrivilegeDenied(
                "an elevated (Administrator) shell is required".to_string(),
            ))
        }
    }

    pub(super) async fn is_installed(&self) -> Result<bool, TunnelError> {
        let name = format!("name={}", self.ctx.device().name);
        Ok(self
            .ctx
            .probe("netsh", &["interface", "show", "interface", &name])
            .await?
            .success())
    }

    pub(super) async fn install(&self) -> Result<InstallOutcome, TunnelError> {
        self.require_admin().await?;
        if self.is_installed().await? {
            return Ok(InstallOutcome::AlreadyPresent);
        }
        info!(
            "Adapter {} will be created when the tunnel starts",
            self.ctx.device().name
        );
        Ok(InstallOutcome::Created)
    }

    async fn apply(&self, previous: &[Ipv4Net], routes: &[Ipv4Net]) -> Result<(), TunnelError> {
        let name = self.ctx.device().name.as_str();
        for route in previous {
            let cidr = route.to_string();
            self.ctx
                .run_quiet("netsh", &["interface", "ipv4", "delete", "route", &cidr, name])
                .await;
        }
        for route in routes {
            let cidr = route.to_string();
            self.ctx
                .run(
                    "netsh",
                    &["interface", "ipv4", "add", "route", &cidr, name, "store=active"],
                )
                .await?;
        }
        Ok(())
    }

    pub(super) async fn start(&mut self, routes: &[Ipv4Net]) -> Result<(), TunnelError> {
        let device = self.ctx.device().clone();
        let name = format!("name={}", device.name);
        let local = device.address.to_string();
        let mask = device.link_net().netmask().to_string();
        self.ctx
            .run(
                "netsh",
                &["interface", "ipv4", "set", "address", &name, "static", &local, &mask],
            )
            .await?;

        if let Err(e) = self.apply(&self.routes, routes).await {
            warn!("Route update on {} failed, restoring previous routes: {}", device.name, e);
            if let Err(restore) = self.apply(routes, &self.routes).await {
                error!("Failed to restore routes on {}: {}", device.name, restore);
            }
            return Err(e);
        }
        self.routes = routes.to_vec();
        info!("{} routes {} network(s)", device.name, routes.len());
        Ok(())
    }

    async fn device_routes(&self) -> Result<Vec<Ipv4Net>, TunnelError> {
        let output = self
            .ctx
            .probe("netsh", &["interface", "ipv4", "show", "route"])
            .await?;
        if !output.success() {
            return Ok(Vec::new());
        }
        Ok(parse_show_route(&output.stdout, &self.ctx.device().name))
    }

    pub(super) async fn destroy(&mut self) -> Result<(), TunnelError> {
        self.require_admin().await?;
        let name = self.ctx.device().name.clone();

        let mut stale = std::mem::take(&mut self.routes);
        for route in self.device_routes().await? {
            if !stale.contains(&route) {
                stale.push(route);
            }
        }
        for route in &stale {
            let cidr = route.to_string();
            self.ctx
                .run_quiet("netsh", &["interface", "ipv4", "delete", "route", &cidr, name.as_str()])
                .await;
        }
        debug!("Removed {} route(s) from {}", stale.len(), name);
        Ok(())
    }
}

/// Parse `netsh interface ipv4 show route` rows bound to `device`
fn parse_show_route(output: &str, device: &str) -> Vec<Ipv4Net> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 6 || fields[5..].join(" ") != device {
                return None;
            }
            fields[3].parse::<Ipv4Net>().ok()
        })
        .collect()
}
