// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilience utilities: bounded retry with optional backoff.
//!
//! - [`RetryConfig`]: attempt bound, per-attempt timeout, delay schedule
//! - [`retry`]: drive an async operation until it succeeds or the bound is hit
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() {
//! use vpn_control_plane::resilience::{retry, RetryConfig};
//!
//! let outcome = retry(&RetryConfig::replication(), "download", |attempt| async move {
//!     if attempt < 2 { Err(vpn_control_plane::ControlPlaneError::Internal("flaky".into())) } else { Ok(attempt) }
//! })
//! .await;
//! assert_eq!(outcome.attempts, 2);
//! # }
//! ```

use crate::error::{ControlPlaneError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Configuration for bounded retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first).
    pub max_attempts: usize,

    /// Delay before the second attempt. Zero means retry immediately.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,

    /// Timeout for each individual attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Archive sync: three immediate attempts per cycle.
    ///
    /// The sync interval itself is the backoff, so attempts within one
    /// cycle are not spaced out.
    pub fn replication() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_factor: 1.0,
            attempt_timeout: Duration::from_secs(30),
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_factor: 1.0,
            attempt_timeout: Duration::from_millis(500),
        }
    }

    /// Calculate the delay after a failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let multiplier = self.backoff_factor.powi((attempt - 1) as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let delay = Duration::from_secs_f64(delay_secs);

        std::cmp::min(delay, self.max_delay)
    }
}

/// Result of a [`retry`] run.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// Last result: the first success, or the final failure.
    pub result: Result<T>,
    /// Attempts actually made (1..=max_attempts).
    pub attempts: usize,
}

impl<T> RetryOutcome<T> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Run `op` until it succeeds or `config.max_attempts` is reached.
///
/// `op` receives the 1-indexed attempt number. Each attempt is bounded by
/// `config.attempt_timeout`; an elapsed attempt counts as a failure.
pub async fn retry<T, F, Fut>(config: &RetryConfig, operation: &str, mut op: F) -> RetryOutcome<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let result = match tokio::time::timeout(config.attempt_timeout, op(attempt)).await {
            Ok(result) => result,
            Err(_) => Err(ControlPlaneError::Timeout {
                operation: operation.to_string(),
                elapsed: config.attempt_timeout,
            }),
        };

        match result {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(e) if attempt >= max_attempts => {
                warn!(operation, attempt, error = %e, "Giving up after max attempts");
                return RetryOutcome {
                    result: Err(e),
                    attempts: attempt,
                };
            }
            Err(e) => {
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, retrying"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
