//! Exponential backoff with jitter for retryable stage failures.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineSettings;
use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base: Duration::from_millis(settings.backoff_base_ms),
            cap: Duration::from_millis(settings.backoff_cap_ms),
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    /// `base * 2^(attempt-1)` plus up to one base of jitter, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let jitter_ms = self.base.as_millis().min(u64::MAX as u128) as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        exp.saturating_add(jitter).min(self.cap)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or runs
/// out of attempts. `on_retry` is called with the attempt number that
/// failed before each backoff sleep. Cancellation interrupts the sleep.
pub async fn retry_with_backoff<T, F, Fut, R, RFut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
    mut on_retry: R,
) -> Result<T, PipelineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PipelineError>>,
    R: FnMut(u32, &PipelineError) -> RFut,
    RFut: Future<Output = ()>,
{
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if !err.is_retryable() || attempt >= policy.max_attempts {
            return Err(err);
        }

        let delay = policy.delay_for(attempt);
        tracing::info!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "Retrying stage");
        on_retry(attempt, &err).await;
        tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
