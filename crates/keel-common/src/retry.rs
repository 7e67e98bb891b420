//! Retry utilities with exponential backoff and jitter.
//!
//! Every accessor call the move engine makes can fail transiently (API server
//! restarts, webhooks not ready, request deadlines). Callers decide which
//! errors are worth another attempt; this module owns the schedule.
//!
//! # Example
//!
//! ```ignore
//! use keel_common::retry::{retry_with_backoff_if, RetryConfig};
//!
//! let created = retry_with_backoff_if(
//!     &RetryConfig::default(),
//!     "create Cluster/default/prod",
//!     |e: &AccessorError| e.is_retryable(),
//!     || async { target.create(&manifest).await },
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tracing::{error, warn};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,
    /// Initial delay between retries
    #[serde(rename = "initialDelayMs", with = "duration_ms")]
    pub initial_delay: Duration,
    /// Maximum delay between retries
    #[serde(rename = "maxDelayMs", with = "duration_ms")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Delay before retry number `retry` (1-based), without jitter
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = self
            .backoff_multiplier
            .powi(retry.saturating_sub(1).min(i32::MAX as u32) as i32);
        let secs = (self.initial_delay.as_secs_f64() * exp).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

/// Execute an async operation, retrying only errors accepted by `is_retryable`.
///
/// Returns the first non-retryable error as-is, or the last error once
/// `max_attempts` is exhausted. At least one attempt is always made.
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    is_retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !is_retryable(&e) {
                    return Err(e);
                }

                if attempt >= config.max_attempts.max(1) {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                // Jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let delay = config.delay_for(attempt);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;
            }
        }
    }
}

/// Serde adapter reading a [`Duration`] from a number of milliseconds
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    /// Deserialize milliseconds into a [`Duration`]
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
