//! Bounded polling shared by every guard that waits on the host.

use std::future::Future;
use std::time::Duration;

/// Poll at most `max_attempts` times, sleeping `delay` between polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

/// A poll that never succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollExhausted {
    pub attempts: u32,
    /// What the final attempt observed.
    pub last: String,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Waiting for a network interface to come up.
    pub const fn interface() -> Self {
        Self::new(10, Duration::from_secs(1))
    }

    /// Waiting for a service to report active after a start.
    pub const fn settle() -> Self {
        Self::new(5, Duration::from_secs(1))
    }

    /// Run `check` until it returns `Ok`, up to the attempt bound.
    ///
    /// `check` returns `Err(observation)` while the condition does not hold.
    /// Every failed attempt is logged; there is no sleep after the last one.
    /// Returns the attempt number that succeeded.
    pub async fn poll<F, Fut>(&self, label: &str, mut check: F) -> Result<u32, PollExhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), String>>,
    {
        let max = self.max_attempts.max(1);
        let mut last = String::new();

        for attempt in 1..=max {
            match check().await {
                Ok(()) => {
                    tracing::debug!(label, attempt, "Condition met");
                    return Ok(attempt);
                }
                Err(observed) => {
                    tracing::warn!(label, attempt, max, observed = %observed, "Not ready yet");
                    last = observed;
                }
            }
            if attempt < max {
                tokio::time::sleep(self.delay).await;
            }
        }

        tracing::warn!(label, attempts = max, last = %last, "Gave up waiting");
        Err(PollExhausted {
            attempts: max,
            last,
        })
    }
}
