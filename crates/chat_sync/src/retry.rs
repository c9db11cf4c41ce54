use std::{future::Future, time::Duration};

use anyhow::Result;
use rand::Rng;
use tracing::{info, warn};

use crate::{config::SyncSettings, error::is_rate_limited, error::SyncError};

/// Retries operations that fail with a rate-limit error, backing off
/// exponentially with random jitter.
#[derive(Debug, Clone)]
pub struct RateLimitRetrier {
    max_attempts: u32,
    base_delay: Duration,
    max_jitter: Duration,
}

impl RateLimitRetrier {
    pub fn new(max_attempts: u32, base_delay: Duration, max_jitter: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            // jitter never exceeds the base so consecutive delays keep growing
            max_jitter: max_jitter.min(base_delay),
        }
    }

    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self::new(
            settings.max_retry_attempts,
            settings.retry_base_delay,
            settings.retry_max_jitter,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// `base_delay * 2^attempt` without jitter.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor)
    }

    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let jitter_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        };
        self.base_backoff(attempt).saturating_add(jitter)
    }

    pub async fn retry<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(attempt, "retry: operation succeeded after rate limiting");
                    }
                    return Ok(value);
                }
                Err(err) if is_rate_limited(&err) => {
                    if attempt >= self.max_attempts {
                        warn!(
                            attempt,
                            max_attempts = self.max_attempts,
                            "retry: giving up on rate-limited operation: {err}"
                        );
                        return Err(SyncError::RetriesExhausted {
                            attempts: attempt,
                            last_error: err.to_string(),
                        }
                        .into());
                    }
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "retry: rate limited, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RateLimitRetrier {
    fn default() -> Self {
        Self::from_settings(&SyncSettings::default())
    }
}

#[cfg(test)]
#[path = "tests/retry_tests.rs"]
mod tests;
