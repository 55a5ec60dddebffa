//! LLM integration.
//!
//! Providers speak the OpenAI-compatible Chat Completions API. Every
//! provider handed out by the control plane is wrapped in a
//! [`GuardedProvider`] that applies the per-provider rate limit and the
//! per-call timeout.

mod mock;
mod openai;
mod provider;
mod rate_limit;

pub use mock::MockLlm;
pub use openai::{OpenAiConfig, OpenAiProvider};
pub use provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
    TokenUsage,
};
pub use rate_limit::RateLimiter;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::LlmError;

/// Rate limit and timeout around another provider.
pub struct GuardedProvider {
    inner: Arc<dyn LlmProvider>,
    limiter: Option<Arc<RateLimiter>>,
    timeout: Duration,
}

impl GuardedProvider {
    pub fn new(inner: Arc<dyn LlmProvider>, timeout: Duration) -> Self {
        Self {
            inner,
            limiter: None,
            timeout,
        }
    }

    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }
}

#[async_trait]
impl LlmProvider for GuardedProvider {
    fn provider_id(&self) -> &str {
        self.inner.provider_id()
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        if let Some(limiter) = &self.limiter {
            limiter.try_acquire()?;
        }

        match tokio::time::timeout(self.timeout, self.inner.complete(request)).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout {
                provider: self.inner.provider_id().to_string(),
                after: self.timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitSpec;

    struct SlowLlm;

    #[async_trait]
    impl LlmProvider for SlowLlm {
        fn provider_id(&self) -> &str {
            "slow"
        }

        fn model_name(&self) -> &str {
            "slow-1"
        }

        async fn complete(&self, _req: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(CompletionResponse {
                content: "late".into(),
                finish_reason: FinishReason::Stop,
                usage: TokenUsage::default(),
            })
        }
    }

    #[tokio::test]
    async fn test_timeout_is_llm_connection_error() {
        let guarded = GuardedProvider::new(Arc::new(SlowLlm), Duration::from_millis(20));
        let err = guarded
            .complete(CompletionRequest::new(vec![ChatMessage::user("x")]))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Timeout { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_limiter_applies_before_call() {
        let mock = Arc::new(MockLlm::new());
        let limiter = Arc::new(RateLimiter::new(
            "mock",
            &RateLimitSpec {
                capacity: 1,
                refill_per_sec: 0.0,
            },
        ));
        let guarded =
            GuardedProvider::new(mock.clone(), Duration::from_secs(1)).with_limiter(limiter);

        let req = CompletionRequest::new(vec![ChatMessage::user("x")]);
        assert!(guarded.complete(req.clone()).await.is_ok());
        assert!(matches!(
            guarded.complete(req).await,
            Err(LlmError::RateLimited { .. })
        ));
        assert_eq!(mock.call_count(), 1);
    }
}
