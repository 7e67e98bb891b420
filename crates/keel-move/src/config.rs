//! Tunables for a move run

use std::time::Duration;

use keel_common::retry::{duration_ms, RetryConfig};
use serde::Deserialize;

/// Retry, concurrency and deadline settings
///
/// Loaded from YAML (camelCase keys); anything omitted keeps its default.
///
/// ```yaml
/// retry:
///   maxAttempts: 5
///   initialDelayMs: 500
/// waveConcurrency: 8
/// requestTimeoutMs: 30000
/// ```
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MoveConfig {
    /// Backoff for every create, delete and patch
    pub retry: RetryConfig,
    /// Objects created, deleted, paused or unpaused in parallel
    pub wave_concurrency: usize,
    /// Listings in flight during discovery
    pub discovery_concurrency: usize,
    /// Deadline for each accessor call
    #[serde(rename = "requestTimeoutMs", with = "duration_ms")]
    pub request_timeout: Duration,
}

impl Default for MoveConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            wave_concurrency: 8,
            discovery_concurrency: 4,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl MoveConfig {
    /// Parse a YAML document and validate it
    pub fn from_yaml(yaml: &str) -> Result<Self, keel_common::Error> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| keel_common::Error::serialization(format!("invalid move config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would stall or never retry
    pub fn validate(&self) -> Result<(), keel_common::Error> {
        if self.retry.max_attempts == 0 {
            return Err(keel_common::Error::config(
                "retry.maxAttempts",
                "must be at least 1",
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(keel_common::Error::config(
                "retry.backoffMultiplier",
                "must be at least 1.0",
            ));
        }
        if self.wave_concurrency == 0 {
            return Err(keel_common::Error::config(
                "waveConcurrency",
                "must be at least 1",
            ));
        }
        if self.discovery_concurrency == 0 {
            return Err(keel_common::Error::config(
                "discoveryConcurrency",
                "must be at least 1",
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(keel_common::Error::config(
                "requestTimeoutMs",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}
