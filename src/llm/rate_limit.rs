//! Per-provider token bucket.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::RateLimitSpec;
use crate::error::LlmError;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket limiting calls to one provider.
///
/// A failed [`try_acquire`](Self::try_acquire) reports how long until the
/// next token is available.
pub struct RateLimiter {
    provider: String,
    capacity: f64,
    refill_per_sec: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(provider: impl Into<String>, spec: &RateLimitSpec) -> Self {
        let capacity = f64::from(spec.capacity.max(1));
        Self {
            provider: provider.into(),
            capacity,
            refill_per_sec: spec.refill_per_sec.max(0.0),
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Take one token or fail with [`LlmError::RateLimited`].
    pub fn try_acquire(&self) -> Result<(), LlmError> {
        let mut bucket = match self.bucket.lock() {
            Ok(b) => b,
            Err(poisoned) => poisoned.into_inner(),
        };

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }

        let retry_after = if self.refill_per_sec > 0.0 {
            Some(Duration::from_secs_f64(
                (1.0 - bucket.tokens) / self.refill_per_sec,
            ))
        } else {
            None
        };

        tracing::debug!(provider = %self.provider, ?retry_after, "Rate limit hit");
        Err(LlmError::RateLimited {
            provider: self.provider.clone(),
            retry_after,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_drains_then_limits() {
        let limiter = RateLimiter::new(
            "openai",
            &RateLimitSpec {
                capacity: 2,
                refill_per_sec: 0.5,
            },
        );

        assert!(limiter.try_acquire().is_ok());
        assert!(limiter.try_acquire().is_ok());

        match limiter.try_acquire() {
            Err(LlmError::RateLimited {
                provider,
                retry_after,
            }) => {
                assert_eq!(provider, "openai");
                let wait = retry_after.unwrap();
                assert!(wait <= Duration::from_secs(2));
            }
            other => panic!("expected rate limit, got {:?}", other),
        }
    }

    #[test]
    fn test_rate_limit_is_retryable() {
        let limiter = RateLimiter::new(
            "p",
            &RateLimitSpec {
                capacity: 1,
                refill_per_sec: 0.0,
            },
        );
        limiter.try_acquire().unwrap();
        let err = limiter.try_acquire().unwrap_err();
        assert!(err.is_retryable());
    }
}
