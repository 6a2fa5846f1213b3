//! Retry utilities for gateway calls
//!
//! Exponential backoff driven by [`RelayError::class`]: stale-state results
//! return immediately, retryable failures back off up to `max_retries`
//! times, everything else is returned to the caller as-is.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{ErrorClass, RelayError, RelayResult};

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, initial_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            ..Default::default()
        }
    }

    /// No waiting between attempts (tests, simulators)
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Calculate backoff duration for a given attempt (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Action to take after a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryAction {
    /// Retry after a backoff period
    RetryAfter(Duration),
    /// Give up and return the error
    GiveUp,
}

/// Decide what to do after attempt number `attempt` (1-based) failed.
/// `max_retries` counts retries, so an operation runs at most
/// `max_retries + 1` times.
pub fn next_action(config: &RetryConfig, error: &RelayError, attempt: u32) -> RetryAction {
    match error.class() {
        ErrorClass::Retryable if config.should_retry(attempt - 1) => {
            RetryAction::RetryAfter(config.backoff_for_attempt(attempt - 1))
        }
        _ => RetryAction::GiveUp,
    }
}

/// Execute `operation` with retry logic.
///
/// The closure receives the 0-indexed attempt number.
pub async fn with_retry<F, T, Fut>(
    config: &RetryConfig,
    what: &str,
    mut operation: F,
) -> RelayResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = RelayResult<T>>,
{
    let mut attempt = 0u32;

    loop {
        match operation(attempt).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                attempt += 1;
                match next_action(config, &e, attempt) {
                    RetryAction::RetryAfter(backoff) => {
                        warn!(
                            what,
                            attempt,
                            max = config.max_retries,
                            ?backoff,
                            error = %e,
                            "Retrying after backoff"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                    RetryAction::GiveUp => {
                        debug!(what, attempt, class = %e.class(), error = %e, "Not retrying");
                        return Err(e);
                    }
                }
            }
        }
    }
}
