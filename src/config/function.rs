//! Function configuration types
//!
//! Describes the handlers the local execution host can run.

use crate::protocol::FunctionMetadata;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Default declared memory in MB
fn default_memory_mb() -> u32 {
    1024
}

/// Default timeout in milliseconds
fn default_timeout_ms() -> u64 {
    30_000
}

/// A locally executed function
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct FunctionConfig {
    /// Deployed function name; defaults to the table key
    #[serde(default)]
    pub name: Option<String>,

    /// Handler entry point as declared remotely
    pub handler: String,

    /// Program that runs the handler
    pub command: String,

    /// Arguments passed to the program
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Declared memory size in MB
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,

    /// Declared timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Environment declared for the function
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl FunctionConfig {
    /// Metadata announced to the stub in the `Init` message
    pub fn metadata(&self, function_id: &str, app: &str, stage: &str) -> FunctionMetadata {
        let name = self
            .name
            .clone()
            .unwrap_or_else(|| format!("{}-{}-{}", app, stage, function_id));
        FunctionMetadata {
            function_id: function_id.to_string(),
            function_name: name,
            handler: self.handler.clone(),
            memory_mb: self.memory_mb,
            timeout_ms: self.timeout_ms,
            environment: self.environment.clone(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.command.is_empty() {
            return Err("function.command must be set".to_string());
        }
        if self.timeout_ms == 0 {
            return Err("function.timeout_ms must be greater than zero".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FunctionConfig {
        FunctionConfig {
            name: None,
            handler: "src/api.handler".to_string(),
            command: "node".to_string(),
            args: vec!["bridge.js".to_string()],
            cwd: None,
            memory_mb: default_memory_mb(),
            timeout_ms: default_timeout_ms(),
            environment: BTreeMap::from([("TABLE".to_string(), "orders".to_string())]),
        }
    }

    #[test]
    fn test_metadata_default_name() {
        let meta = sample().metadata("api", "shop", "dev");
        assert_eq!(meta.function_id, "api");
        assert_eq!(meta.function_name, "shop-dev-api");
        assert_eq!(meta.memory_mb, 1024);
        assert_eq!(meta.timeout_ms, 30_000);
        assert_eq!(meta.environment.get("TABLE").map(String::as_str), Some("orders"));
    }

    #[test]
    fn test_metadata_explicit_name() {
        let config = FunctionConfig {
            name: Some("orders-api".to_string()),
            ..sample()
        };
        assert_eq!(config.metadata("api", "shop", "dev").function_name, "orders-api");
    }

    #[test]
    fn test_function_validate() {
        assert!(sample().validate().is_ok());
        let bad = FunctionConfig {
            command: String::new(),
            ..sample()
        };
        assert!(bad.validate().is_err());
    }
}
