//! Helper utilities for devtunnel
//!
//! Backoff computation and identifier generation shared by the bridge and
//! the transport.

use std::time::Duration;
use uuid::Uuid;

/// Retry configuration for reconnecting operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 retries forever)
    pub max_retries: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration
    pub fn new(max_retries: u32) -> Self {
        RetryConfig {
            max_retries,
            ..Default::default()
        }
    }

    /// Calculate delay for a given attempt number
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        if !delay_ms.is_finite() || delay_ms >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }

        std::cmp::min(Duration::from_millis(delay_ms as u64), self.max_delay)
    }

    /// Whether `attempt` retries have used up the budget
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_retries != 0 && attempt >= self.max_retries
    }
}

/// Generate a random v4 UUID in its 32-digit lowercase hex form
pub fn random_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Lowercase hex encoding
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
