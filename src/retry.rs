//! Bounded exponential backoff for transient store failures.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::Result;

/// How a worker retries a store call that failed with `StoreUnavailable`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Coefficient to multiply the initial interval with for every past attempt.
    pub backoff_coefficient: u32,
    /// The backoff interval after the first failure, in milliseconds.
    pub initial_interval_ms: u64,
    /// Cap on a single backoff, in milliseconds.
    pub maximum_interval_ms: Option<u64>,
    /// Total calls, including the first one.
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0 for the first retry).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let initial = Duration::from_millis(self.initial_interval_ms);
        let candidate = initial.saturating_mul(self.backoff_coefficient.saturating_pow(attempt));
        match self.maximum_interval_ms {
            Some(max) => std::cmp::min(candidate, Duration::from_millis(max)),
            None => candidate,
        }
    }

    /// Run `op`, retrying transient errors with backoff. Non-transient errors
    /// and the last transient error are returned unchanged.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(e) if e.is_transient() && attempt + 1 < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(operation = what, attempt, ?delay, "store unavailable, retrying: {e}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval_ms: 100,
            maximum_interval_ms: Some(5_000),
            max_attempts: 3,
        }
    }
}
