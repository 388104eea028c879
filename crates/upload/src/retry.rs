//! Retry decisions and backoff.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::UploadError;

/// Decides whether a failed operation is attempted again, and after how long.
///
/// The attempt counter belongs to whatever is being retried (a chunk or a
/// single-shot upload), so concurrent operations back off independently.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Delay before retry `n` is `delays[n]`, clamped to the last entry.
    pub delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(5),
            ],
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delays: Vec<Duration>) -> Self {
        Self {
            max_retries,
            delays,
        }
    }

    /// The same schedule with a different retry budget.
    pub fn with_max_retries(&self, max_retries: u32) -> Self {
        Self {
            max_retries,
            delays: self.delays.clone(),
        }
    }

    /// `attempt` is the number of retries already spent (0 after the first
    /// failure).
    pub fn should_retry(&self, attempt: u32, error: &UploadError) -> bool {
        attempt < self.max_retries && error.is_retryable()
    }

    /// Backoff before the retry following `attempt`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let Some(last) = self.delays.len().checked_sub(1) else {
            return Duration::ZERO;
        };
        self.delays[(attempt as usize).min(last)]
    }

    /// Runs `op` until it succeeds, fails fatally, runs out of retries or is
    /// cancelled. `on_retry` sees each retryable failure before the backoff.
    pub async fn run<T, F, Fut>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        mut on_retry: impl FnMut(u32, &UploadError),
        mut op: F,
    ) -> Result<T, UploadError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, UploadError>>,
    {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(UploadError::Cancelled),
                r = op() => r,
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if self.should_retry(attempt, &e) => {
                    let delay = self.next_delay(attempt);
                    warn!(
                        op = what,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying"
                    );
                    on_retry(attempt, &e);
                    sleep_or_cancel(delay, cancel).await?;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Waits out a backoff delay, returning early with `Cancelled`.
pub async fn sleep_or_cancel(
    delay: Duration,
    cancel: &CancellationToken,
) -> Result<(), UploadError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!("backoff interrupted by cancellation");
            Err(UploadError::Cancelled)
        }
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
