//! Transport configuration types
//!
//! Settings for the pub/sub WebSocket connection used by the invocation bridge.

use crate::helper::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Default channel namespace
fn default_namespace() -> String {
    "devtunnel".to_string()
}

/// Default maximum frame size (240 KiB)
fn default_max_frame_bytes() -> usize {
    240 * 1024
}

/// Default keepalive ping interval in seconds
fn default_keepalive_interval() -> u64 {
    30
}

/// Default pong grace window in seconds
fn default_pong_grace() -> u64 {
    10
}

/// Default connect timeout in seconds
fn default_connect_timeout() -> u64 {
    10
}

/// Pub/sub transport configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TransportConfig {
    /// Real-time WebSocket endpoint (`wss://...`)
    pub endpoint: Url,

    /// Host used when signing requests; defaults to the endpoint host
    #[serde(default)]
    pub api_host: Option<String>,

    /// API key for `x-api-key` signing
    #[serde(default)]
    pub api_key: Option<String>,

    /// Channel namespace
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Maximum frame size accepted by the channel, in bytes
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Keepalive ping interval in seconds
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,

    /// How long to wait for a pong after the interval, in seconds
    #[serde(default = "default_pong_grace")]
    pub pong_grace: u64,

    /// Connect and handshake timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Explicit proxy (`http://` or `socks5://`), overriding the environment
    #[serde(default)]
    pub proxy: Option<Url>,

    /// Extra PEM root certificates trusted for `wss://` endpoints
    #[serde(default)]
    pub trusted_root: Option<PathBuf>,

    /// Reconnect backoff
    #[serde(default)]
    pub retry: RetrySettings,

    /// TCP socket options
    #[serde(default)]
    pub tcp: TcpConfig,
}

impl TransportConfig {
    /// Create a configuration for `endpoint` with every other field defaulted
    pub fn new(endpoint: Url) -> Self {
        TransportConfig {
            endpoint,
            api_host: None,
            api_key: None,
            namespace: default_namespace(),
            max_frame_bytes: default_max_frame_bytes(),
            keepalive_interval: default_keepalive_interval(),
            pong_grace: default_pong_grace(),
            connect_timeout: default_connect_timeout(),
            proxy: None,
            trusted_root: None,
            retry: RetrySettings::default(),
            tcp: TcpConfig::default(),
        }
    }

    /// Host name used for request signing
    pub fn signing_host(&self) -> String {
        self.api_host
            .clone()
            .or_else(|| self.endpoint.host_str().map(str::to_string))
            .unwrap_or_default()
    }

    /// Keepalive interval as a duration
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval)
    }

    /// Pong grace window as a duration
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.pong_grace)
    }

    /// Connect timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        match self.endpoint.scheme() {
            "ws" | "wss" => {}
            other => return Err(format!("Unsupported transport scheme: {}", other)),
        }
        if self.max_frame_bytes == 0 {
            return Err("transport.max_frame_bytes must be greater than zero".to_string());
        }
        if self.keepalive_interval == 0 {
            return Err("transport.keepalive_interval must be greater than zero".to_string());
        }
        if self.namespace.is_empty() || self.namespace.contains('/') {
            return Err(format!("Invalid channel namespace: {:?}", self.namespace));
        }
        self.retry.validate()
    }
}

/// Default initial backoff in milliseconds
fn default_initial_delay_ms() -> u64 {
    500
}

/// Default backoff cap in milliseconds
fn default_max_delay_ms() -> u64 {
    30_000
}

/// Default backoff multiplier
fn default_multiplier() -> f64 {
    2.0
}

/// Reconnect backoff settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetrySettings {
    /// First delay in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Growth factor per attempt
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Attempts before giving up (0 = forever)
    #[serde(default)]
    pub max_retries: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            max_retries: 0,
        }
    }
}

impl RetrySettings {
    /// Build the runtime retry policy
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.multiplier < 1.0 {
            return Err("transport.retry.multiplier must be at least 1.0".to_string());
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err("transport.retry.initial_delay_ms exceeds max_delay_ms".to_string());
        }
        Ok(())
    }
}

/// Default keepalive seconds
fn default_keepalive_secs() -> u64 {
    20
}

/// Default keepalive probe interval
fn default_keepalive_probe_interval() -> u64 {
    8
}

/// Default TCP_NODELAY setting
fn default_nodelay() -> bool {
    true
}

/// TCP socket configuration for the transport connection
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TcpConfig {
    /// Enable TCP_NODELAY
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,

    /// TCP keepalive timeout in seconds
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// TCP keepalive interval in seconds
    #[serde(default = "default_keepalive_probe_interval")]
    pub keepalive_interval: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            nodelay: default_nodelay(),
            keepalive_secs: default_keepalive_secs(),
            keepalive_interval: default_keepalive_probe_interval(),
        }
    }
}
