//! Retry logic with exponential backoff for transient errors.
//!
//! Used for downloads and for the single best-effort start of a stopped
//! distribution. Applying a plan is never retried here.

use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};

/// Retry configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Multiplier applied per attempt.
    pub backoff_factor: f64,
    /// Upper bound for any delay.
    pub max_delay: Duration,
}

impl RetryConfig {
    /// Single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// One retry after a short wait, for "distribution not yet running".
    pub fn start_once() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_secs(2),
            backoff_factor: 1.0,
            max_delay: Duration::from_secs(2),
        }
    }

    /// Delay before retrying after `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.powi(attempt as i32);
        let delay = self.base_delay.mul_f64(factor);
        delay.min(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Execute an operation, retrying while it returns a retryable error.
pub fn with_retry<T, F>(config: &RetryConfig, what: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() || attempt + 1 >= attempts => return Err(e),
            Err(e) => {
                let delay = config.delay_for_attempt(attempt);
                log::warn!(
                    "{} attempt {}/{} failed: {}. Retrying in {:?}",
                    what,
                    attempt + 1,
                    attempts,
                    e,
                    delay
                );
                thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

/// Attach the source URL to a download error.
pub(crate) fn with_url(err: Error, url: &str) -> Error {
    match err {
        Error::Download {
            message, status, ..
        } => Error::Download {
            url: url.to_string(),
            message,
            status,
        },
        other => other,
    }
}
