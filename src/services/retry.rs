use std::future::Future;
use std::time::Duration;

use crate::core::config::RetrySettings;
use crate::core::errors::SessionError;

/// Bounded exponential backoff shared by answer persistence and audio upload.
///
/// `max_attempts` counts the first try: a policy with 3 attempts sleeps at
/// most twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self { max_attempts: max_attempts.max(1), base_delay, max_delay: max_delay.max(base_delay) }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::new(
            settings.max_attempts,
            Duration::from_millis(settings.base_delay_ms),
            Duration::from_millis(settings.max_delay_ms),
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after the failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(2_u32.pow(exponent)).min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails terminally, or the ceiling is hit.
    ///
    /// `op` receives the 1-based attempt number. A retryable error on the
    /// last attempt comes back as `RetriesExhausted`.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, SessionError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, SessionError>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) if attempt >= self.max_attempts => {
                    tracing::error!(operation = label, attempts = attempt, error = %err, "Retry ceiling reached");
                    return Err(SessionError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(err),
                    });
                }
                Err(err) => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        operation = label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retryable failure; backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}
