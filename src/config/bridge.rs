//! Bridge configuration types
//!
//! Chunking, payload limits and timeouts for the live invocation bridge.

use crate::protocol::{ChunkLimits, FRAME_OVERHEAD};
use crate::transport::event_len;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default chunk payload size (176 KiB, about 235 KiB once base64 encoded)
fn default_chunk_size() -> usize {
    176 * 1024
}

/// Default maximum number of chunks per message
fn default_max_chunks() -> usize {
    30
}

/// Default synchronous payload limit (6 MiB)
fn default_sync_limit() -> usize {
    6 * 1024 * 1024
}

/// Default asynchronous payload limit (1 MiB)
fn default_async_limit() -> usize {
    1024 * 1024
}

/// Default request timeout in seconds
fn default_request_timeout() -> u64 {
    900
}

/// Default sweep interval in milliseconds
fn default_sweep_interval_ms() -> u64 {
    1000
}

/// Default cap on partially received messages
fn default_max_partial() -> usize {
    256
}

/// Invocation bridge configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BridgeConfig {
    /// Payload bytes carried per chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Maximum chunks per logical message
    #[serde(default = "default_max_chunks")]
    pub max_chunks: usize,

    /// Limit for request/response invocations in bytes
    #[serde(default = "default_sync_limit")]
    pub sync_limit: usize,

    /// Limit for asynchronous (event) invocations in bytes
    #[serde(default = "default_async_limit")]
    pub async_limit: usize,

    /// Seconds a caller waits for a response
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// How often expired requests are swept, in milliseconds
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Maximum messages being reassembled at once
    #[serde(default = "default_max_partial")]
    pub max_partial: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            chunk_size: default_chunk_size(),
            max_chunks: default_max_chunks(),
            sync_limit: default_sync_limit(),
            async_limit: default_async_limit(),
            request_timeout: default_request_timeout(),
            sweep_interval_ms: default_sweep_interval_ms(),
            max_partial: default_max_partial(),
        }
    }
}

impl BridgeConfig {
    /// Chunking limits derived from this configuration
    pub fn limits(&self) -> ChunkLimits {
        ChunkLimits {
            chunk_size: self.chunk_size,
            max_chunks: self.max_chunks,
            sync_limit: self.sync_limit,
            async_limit: self.async_limit,
        }
    }

    /// Request timeout as a duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    /// Sweep interval as a duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(10))
    }

    /// Validate the configuration against the transport frame limit
    pub fn validate(&self, max_frame_bytes: usize) -> Result<(), String> {
        if self.chunk_size == 0 || self.max_chunks == 0 {
            return Err("bridge.chunk_size and bridge.max_chunks must be non-zero".to_string());
        }
        let event = event_len(self.chunk_size + *FRAME_OVERHEAD);
        if event > max_frame_bytes {
            return Err(format!(
                "bridge.chunk_size {} publishes {}-byte events, above transport frame limit {}",
                self.chunk_size, event, max_frame_bytes
            ));
        }
        if self.async_limit > self.sync_limit {
            return Err("bridge.async_limit exceeds bridge.sync_limit".to_string());
        }
        Ok(())
    }
}
