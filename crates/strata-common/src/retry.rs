//! Retry utilities for store operations that may fail transiently.
//!
//! Store reads retry with a fixed backoff; general callers can opt into
//! exponential backoff with jitter. Only errors whose `is_retryable()` is
//! true are retried: non-retryable failures surface on the first attempt.
//!
//! # Example
//!
//! ```ignore
//! use strata_common::retry::{retry_transient, RetryConfig};
//!
//! let lease = retry_transient(&RetryConfig::store_read(), "read_lease", || async {
//!     api.get("deploy-lock").await.map_err(classify)
//! })
//! .await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::Error;

/// Attempts made by a store read: the first call plus four retries
pub const STORE_READ_ATTEMPTS: u32 = 5;

/// Fixed delay between store read retries
pub const STORE_READ_BACKOFF: Duration = Duration::from_secs(5);

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts including the first (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (1.0 = fixed delay)
    pub backoff_multiplier: f64,
    /// Randomize each delay between 0.5x and 1.5x
    pub jitter: bool,
}

impl RetryConfig {
    /// Create a config with a fixed delay and no jitter
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: attempts,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    /// Store read policy: up to 4 retries, 5 seconds apart
    pub fn store_read() -> Self {
        Self::fixed(STORE_READ_ATTEMPTS, STORE_READ_BACKOFF)
    }

    /// Single attempt, no retries
    pub fn none() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(delay.as_secs_f64() * jitter)
    }
}

/// Execute a store operation, retrying only retryable errors.
pub async fn retry_transient<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
{
    retry_if(config, operation_name, Error::is_retryable, operation).await
}

async fn retry_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !should_retry(&e) => return Err(e),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let wait = config.jittered(delay);
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = wait.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(wait).await;
                delay = config.next_delay(delay);
            }
        }
    }
}
