//! Retry policy with deterministic exponential backoff.

use crate::error::{ErrorKind, NormalizedError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Retry policy configuration.
///
/// `max_attempts` bounds the total number of calls, first call included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of calls per operation.
    pub max_attempts: u32,
    /// Delay before the second call, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// HTTP statuses worth another call.
    pub retryable_statuses: Vec<u16>,
    /// Whether connection resets, DNS failures and timeouts are retried.
    pub retry_on_network: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            retryable_statuses: vec![429, 500, 502, 503, 504],
            retry_on_network: true,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: base_delay.as_millis() as u64,
            ..Default::default()
        }
    }

    /// Delay to wait after `attempt` failed calls: `base * 2^(attempt-1)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
        let delay_ms = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }

    /// Whether the failure belongs to the retryable condition class.
    pub fn is_retryable(&self, err: &NormalizedError) -> bool {
        match err.kind {
            ErrorKind::Network => self.retry_on_network,
            ErrorKind::Tls => false,
            _ => self.retryable_statuses.contains(&err.status),
        }
    }

    /// Execute an operation, retrying while `retryable` accepts the error.
    pub async fn execute<F, Fut, T, E, R>(&self, mut operation: F, retryable: R) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if attempt >= max_attempts || !retryable(&e) {
                        if attempt > 1 {
                            tracing::warn!(
                                attempt = attempt,
                                max_attempts = max_attempts,
                                error = %e,
                                "Retry exhausted"
                            );
                        }
                        return Err(e);
                    }

                    let delay = self.delay_for_attempt(attempt);
                    tracing::debug!(
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after delay"
                    );

                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
