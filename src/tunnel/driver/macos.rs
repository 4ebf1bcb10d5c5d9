//! macOS driver built on `ifconfig` and `route`
//!
//! `utun` interfaces cannot be created ahead of time; the device appears when
//! the tunnel opens it and disappears with the last descriptor. Install only
//! checks privileges.

use super::{DriverContext, InstallOutcome};
use crate::error::TunnelError;
use ipnet::Ipv4Net;
use tracing::{debug, error, info, warn};

/// `ifconfig`/`route` based driver
pub struct MacOsDriver {
    pub(super) ctx: DriverContext,
    pub(super) routes: Vec<Ipv4Net>,
}

impl MacOsDriver {
    pub(super) fn new(ctx: DriverContext) -> Self {
        MacOsDriver {
            ctx,
            routes: Vec::new(),
        }
    }

    pub(super) async fn is_installed(&self) -> Result<bool, TunnelError> {
        let name = self.ctx.device().name.as_str();
        Ok(self.ctx.probe("ifconfig", &[name]).await?.success())
    }

    pub(super) async fn install(&self) -> Result<InstallOutcome, TunnelError> {
        self.ctx.require_root().await?;
        if self.is_installed().await? {
            return Ok(InstallOutcome::AlreadyPresent);
        }
        info!(
            "{} will be created when the tunnel starts",
            self.ctx.device().name
        );
        Ok(InstallOutcome::Created)
    }

    async fn apply(&self, previous: &[Ipv4Net], routes: &[Ipv4Net]) -> Result<(), TunnelError> {
        let name = self.ctx.device().name.as_str();
        for route in previous {
            let cidr = route.to_string();
            self.ctx.run_quiet("route", &["-n", "delete", "-net", &cidr]).await;
        }
        for route in routes {
            let cidr = route.to_string();
            self.ctx
                .run("route", &["-n", "add", "-net", &cidr, "-interface", name])
                .await?;
        }
        Ok(())
    }

    pub(super) async fn start(&mut self, routes: &[Ipv4Net]) -> Result<(), TunnelError> {
        let device = self.ctx.device().clone();
        let local = device.address.to_string();
        let peer = device.peer.to_string();
        self.ctx
            .run("ifconfig", &[device.name.as_str(), "inet", &local, &peer, "up"])
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

    /// Network routes the kernel currently binds to the device
    async fn device_routes(&self) -> Result<Vec<Ipv4Net>, TunnelError> {
        let output = self.ctx.probe("netstat", &["-rn", "-f", "inet"]).await?;
        if !output.success() {
            return Ok(Vec::new());
        }
        Ok(parse_netstat(&output.stdout, &self.ctx.device().name))
    }

    pub(super) async fn destroy(&mut self) -> Result<(), TunnelError> {
        self.ctx.require_root().await?;
        let name = self.ctx.device().name.clone();

        let mut stale = std::mem::take(&mut self.routes);
        for route in self.device_routes().await? {
            if !stale.contains(&route) {
                stale.push(route);
            }
        }
        for route in &stale {
            let cidr = route.to_string();
            self.ctx.run_quiet("route", &["-n", "delete", "-net", &cidr]).await;
        }
        debug!("Removed {} route(s) from {}", stale.len(), name);

        if self.is_installed().await? {
            self.ctx.run("ifconfig", &[name.as_str(), "down"]).await?;
        }
        info!("Tunnel device {} released", name);
        Ok(())
    }
}

/// Parse `netstat -rn` network destinations on `device`
///
/// macOS abbreviates networks (`10.0/22`); missing octets are zero.
fn parse_netstat(output: &str, device: &str) -> Vec<Ipv4Net> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 || fields[3] != device {
                return None;
            }
            let (addr, prefix) = fields[0].split_once('/')?;
            let mut octets: Vec<&str> = addr.split('.').collect();
            while octets.len() < 4 {
                octets.push("0");
            }
            format!("{}/{}", octets.join("."), prefix).parse::<Ipv4Net>().ok()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::super::{CommandOutput, NetworkDriver, RecordingRunner};
    use super::*;
    use crate::config::TunnelConfig;
    use std::sync::Arc;

    const NETSTAT: &str = "Routing tables

Internet:
Destination        Gateway            Flags        Netif Expire
default            192.168.1.1        UGScg          en0
10.0/22            utun9              USc          utun9
100.100.0.2        100.100.0.1        UH           utun9
172.16/12          utun9              USc          utun9
192.168.1          link#6             UCS            en0
";

    fn driver() -> (NetworkDriver, Arc<RecordingRunner>) {
        let runner = Arc::new(RecordingRunner::new());
        runner.script("id -u", CommandOutput::ok("0\n"));
        let config = TunnelConfig {
            device: "utun9".to_string(),
            ..Default::default()
        };
        let driver = NetworkDriver::for_os("macos", &config, runner.clone()).unwrap();
        (driver, runner)
    }

    #[test]
    fn test_parse_netstat() {
        let routes = parse_netstat(NETSTAT, "utun9");
        let routes: Vec<String> = routes.iter().map(|r| r.to_string()).collect();
        assert_eq!(routes, vec!["10.0.0.0/22", "172.16.0.0/12"]);
    }

    #[tokio::test]
    async fn test_install_only_checks() {
        let (driver, runner) = driver();
        runner.script_once("ifconfig utun9", CommandOutput::failed(1, "interface utun9 does not exist"));
        assert_eq!(driver.install().await.unwrap(), InstallOutcome::Created);
        assert_eq!(driver.install().await.unwrap(), InstallOutcome::AlreadyPresent);
        assert_eq!(
            runner.calls(),
            vec!["id -u", "ifconfig utun9", "id -u", "ifconfig utun9"]
        );
    }

    #[tokio::test]
    async fn test_start_replaces_routes() {
        let (mut driver, runner) = driver();
        driver.start(&["10.0.0.0/22".parse().unwrap()]).await.unwrap();
        runner.clear();

        driver.start(&["172.16.0.0/12".parse().unwrap()]).await.unwrap();
        assert_eq!(
            runner.calls(),
            vec![
                "ifconfig utun9 inet 100.100.0.1 100.100.0.2 up",
                "route -n delete -net 10.0.0.0/22",
                "route -n add -net 172.16.0.0/12 -interface utun9",
            ]
        );
    }

    #[tokio::test]
    async fn test_destroy_removes_kernel_routes() {
        let (mut driver, runner) = driver();
        runner.script("netstat", CommandOutput::ok(NETSTAT));
        driver.destroy().await.unwrap();

        let calls = runner.calls();
        assert!(calls.contains(&"route -n delete -net 10.0.0.0/22".to_string()));
        assert!(calls.contains(&"route -n delete -net 172.16.0.0/12".to_string()));
        assert_eq!(calls.last().map(String::as_str), Some("ifconfig utun9 down"));
    }
}
