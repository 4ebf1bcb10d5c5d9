//! Configuration module for devtunnel
//!
//! This module provides configuration types and TOML parsing.

mod app;
mod bridge;
mod function;
mod transport;
mod tunnel;

pub use app::{Config, StageConfig};
pub use bridge::BridgeConfig;
pub use function::FunctionConfig;
pub use transport::{RetrySettings, TcpConfig, TransportConfig};
pub use tunnel::{expand_home, BastionConfig, TunnelConfig};

use anyhow::{anyhow, Context, Result};
use std::path::Path;

/// Load configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

    parse_config(&content)
}

/// Parse and validate configuration from a TOML string
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse configuration")?;
    config
        .validate()
        .map_err(|e| anyhow!("Invalid configuration: {}", e))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::Ipv4Addr;

    #[test]
    fn test_parse_minimal_config() {
        let config_str = r#"
app = "shop"
"#;

        let config = parse_config(config_str).unwrap();
        assert_eq!(config.app, "shop");
        assert_eq!(config.default_stage, "dev");
        assert!(config.transport.is_none());
        assert!(config.stages.is_empty());
        assert_eq!(config.bridge.chunk_size, 180_224);
    }

    // The sample names a Linux style device
    #[cfg(not(target_os = "macos"))]
    #[test]
    fn test_sample_config_is_valid() {
        let config = parse_config(include_str!("../../devtunnel.toml")).unwrap();
        let (name, stage) = config.stage(None).unwrap();
        assert_eq!(name, "dev");
        assert!(stage.bastion.is_some());
        assert_eq!(config.channel_base(name), "shop/dev");
    }

    #[test]
    fn test_parse_full_config() {
        let config_str = r#"
app = "shop"
default_stage = "qa"

[transport]
endpoint = "wss://abc.appsync-realtime-api.us-east-1.amazonaws.com/event/realtime"
api_key = "da2-secret"
namespace = "live"
keepalive_interval = 20

[transport.retry]
initial_delay_ms = 250
max_delay_ms = 8000

[bridge]
request_timeout = 60

[tunnel]
address = "100.64.10.1"
stack_address = "100.64.10.2"
idle_timeout = 120

[stages.qa]
routes = ["10.0.0.0/22", "172.16.0.0/16"]

[stages.qa.bastion]
host = "203.0.113.10"
user = "ec2-user"
key_path = "/keys/bastion"

[functions.api]
handler = "src/api.handler"
command = "node"
args = ["bridge.js"]
timeout_ms = 6000

[functions.api.environment]
TABLE = "orders"
"#;

        let config = parse_config(config_str).unwrap();
        let transport = config.transport.as_ref().unwrap();
        assert_eq!(transport.namespace, "live");
        assert_eq!(transport.api_key.as_deref(), Some("da2-secret"));
        assert_eq!(transport.keepalive_interval, 20);
        assert_eq!(transport.retry.initial_delay_ms, 250);
        assert_eq!(config.bridge.request_timeout, 60);
        assert_eq!(config.tunnel.address, Ipv4Addr::new(100, 64, 10, 1));

        let (name, stage) = config.stage(None).unwrap();
        assert_eq!(name, "qa");
        assert_eq!(stage.routes.len(), 2);
        let bastion = stage.bastion.as_ref().unwrap();
        assert_eq!(bastion.port, 22);

        let api = config.functions.get("api").unwrap();
        assert_eq!(api.timeout_ms, 6000);
        assert_eq!(api.environment.len(), 1);
    }

    #[test]
    fn test_parse_rejects_bad_route() {
        let config_str = r#"
app = "shop"

[stages.dev]
routes = ["10.0.0.0/33"]
"#;
        assert!(parse_config(config_str).is_err());
    }

    #[test]
    fn test_parse_rejects_invalid_values() {
        let config_str = r#"
app = "shop"

[transport]
endpoint = "https://example.com/event"
"#;
        let err = parse_config(config_str).unwrap_err();
        assert!(err.to_string().contains("Invalid configuration"));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "app = \"shop\"\n[stages.dev]\nroutes = [\"10.1.0.0/16\"]").unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.stages["dev"].routes[0].to_string(), "10.1.0.0/16");
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config("/nonexistent/devtunnel.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
