//! Root configuration
//!
//! Ties the transport, bridge, tunnel, stage and function sections together.

use super::{BastionConfig, BridgeConfig, FunctionConfig, TransportConfig, TunnelConfig};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default stage name
fn default_stage() -> String {
    "dev".to_string()
}

/// Root configuration structure
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Application name, used in channel names
    pub app: String,

    /// Stage used when the CLI does not name one
    #[serde(default = "default_stage")]
    pub default_stage: String,

    /// Pub/sub transport (required by `dev`)
    #[serde(default)]
    pub transport: Option<TransportConfig>,

    /// Invocation bridge settings
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Network tunnel settings
    #[serde(default)]
    pub tunnel: TunnelConfig,

    /// Stages by name
    #[serde(default)]
    pub stages: BTreeMap<String, StageConfig>,

    /// Functions by id
    #[serde(default)]
    pub functions: BTreeMap<String, FunctionConfig>,
}

/// Per-stage settings
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct StageConfig {
    /// CIDRs routed into the tunnel
    #[serde(default)]
    pub routes: Vec<IpNet>,

    /// Bastion used by the tunnel
    #[serde(default)]
    pub bastion: Option<BastionConfig>,

    /// Channel name override (`{app}/{stage}` by default)
    #[serde(default)]
    pub channel: Option<String>,
}

impl Config {
    /// Resolve a stage by name, falling back to `default_stage`
    pub fn stage<'a>(&'a self, name: Option<&'a str>) -> Result<(&'a str, &'a StageConfig), String> {
        let name = name.unwrap_or(&self.default_stage);
        self.stages
            .get(name)
            .map(|stage| (name, stage))
            .ok_or_else(|| format!("Stage '{}' is not configured", name))
    }

    /// Channel path for a stage, without namespace
    pub fn channel_base(&self, stage: &str) -> String {
        self.stages
            .get(stage)
            .and_then(|s| s.channel.clone())
            .unwrap_or_else(|| format!("{}/{}", self.app, stage))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.app.is_empty() || self.app.contains('/') {
            return Err(format!("Invalid app name: {:?}", self.app));
        }
        if let Some(transport) = &self.transport {
            transport.validate()?;
            self.bridge.validate(transport.max_frame_bytes)?;
        }
        self.tunnel.validate()?;
        for (name, stage) in &self.stages {
            if let Some(bastion) = &stage.bastion {
                bastion
                    .validate()
                    .map_err(|e| format!("stage '{}': {}", name, e))?;
            }
        }
        for (id, function) in &self.functions {
            function
                .validate()
                .map_err(|e| format!("function '{}': {}", id, e))?;
        }
        Ok(())
    }
}
