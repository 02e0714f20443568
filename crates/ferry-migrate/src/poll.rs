//! Bounded polling for long-running remote operations.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Fixed-interval, fixed-attempt polling bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    /// Time between two status checks, in milliseconds.
    pub interval_ms: u64,
    /// Number of status checks before giving up.
    pub max_attempts: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,
            max_attempts: 60,
        }
    }
}

impl PollSettings {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            max_attempts,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Outcome of a bounded poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// The check produced a value.
    Ready(T),
    /// The check never produced a value within the bound.
    TimedOut { attempts: u32, waited: Duration },
}

/// Call `check` until it yields `Some`, an error, or the bound is hit.
///
/// `check` receives the 1-based attempt number.
pub async fn poll_until<T, E, F, Fut>(settings: &PollSettings, mut check: F) -> Result<PollOutcome<T>, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let max_attempts = settings.max_attempts.max(1);
    let interval = settings.interval();
    let mut waited = Duration::ZERO;

    for attempt in 1..=max_attempts {
        if let Some(value) = check(attempt).await? {
            return Ok(PollOutcome::Ready(value));
        }
        if attempt < max_attempts {
            tokio::time::sleep(interval).await;
            waited += interval;
        }
    }

    Ok(PollOutcome::TimedOut {
        attempts: max_attempts,
        waited,
    })
}
