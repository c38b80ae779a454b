use super::provider::ProviderError;
use crate::models::SyncConfig;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Outcome of running an operation under a [`RetryPolicy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
    /// The last error, after `attempts` tries. Transient errors here mean the budget ran out.
    Failed { error: ProviderError, attempts: u32 },
    /// The token fired during a call or a backoff sleep.
    Cancelled { attempts: u32 },
}

/// Exponential backoff for transient provider failures.
///
/// Backoff doubles after each failed attempt and is capped at `max_backoff`.
/// Every attempt is bounded by `call_timeout`; an elapsed call counts as
/// [`ProviderError::Timeout`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    call_timeout: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration, call_timeout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
            call_timeout,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.max_attempts, config.initial_backoff, config.max_backoff, config.call_timeout)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Backoff before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }

    /// Runs `operation` until it succeeds, fails permanently, exhausts the
    /// attempt budget, or `cancel` fires.
    pub async fn execute<F, Fut, T>(&self, cancel: &CancellationToken, mut operation: F) -> Result<(T, u32), RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled { attempts: attempt - 1 }),
                outcome = tokio::time::timeout(self.call_timeout, operation()) => outcome,
            };

            let error = match outcome {
                Ok(Ok(value)) => {
                    if attempt > 1 {
                        debug!(attempt, "Calendar call succeeded after retry");
                    }
                    return Ok((value, attempt));
                }
                Ok(Err(error)) => error,
                Err(_) => ProviderError::Timeout,
            };

            if !error.is_transient() || attempt >= self.max_attempts {
                return Err(RetryError::Failed { error, attempts: attempt });
            }

            let backoff = self.backoff_for(attempt);
            warn!(attempt, max_attempts = self.max_attempts, backoff_ms = backoff.as_millis() as u64, error = %error, "Transient calendar failure, retrying");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Cancelled { attempts: attempt }),
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }
}
