//! Scripted LLM for tests and offline runs.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::LlmError;
use crate::llm::provider::{
    CompletionRequest, CompletionResponse, FinishReason, LlmProvider, TokenUsage,
};

type Responder = Box<dyn Fn(&CompletionRequest) -> String + Send + Sync>;

/// Mock provider.
///
/// Replies come from the scripted queue first, then from the responder
/// closure, then from the fixed default reply.
pub struct MockLlm {
    model: String,
    script: Mutex<VecDeque<String>>,
    responder: Option<Responder>,
    default_reply: String,
    calls: Mutex<Vec<CompletionRequest>>,
}

impl Default for MockLlm {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLlm {
    pub fn new() -> Self {
        Self {
            model: "mock-model".to_string(),
            script: Mutex::new(VecDeque::new()),
            responder: None,
            default_reply: r#"{"thought": "nothing left to do", "final_answer": "Done."}"#
                .to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Replies returned in order, one per call.
    pub fn with_script<I, S>(self, replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Ok(mut script) = self.script.lock() {
            script.extend(replies.into_iter().map(Into::into));
        }
        self
    }

    pub fn with_responder<F>(mut self, f: F) -> Self
    where
        F: Fn(&CompletionRequest) -> String + Send + Sync + 'static,
    {
        self.responder = Some(Box::new(f));
        self
    }

    pub fn with_default_reply(mut self, reply: impl Into<String>) -> Self {
        self.default_reply = reply.into();
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Every request received so far.
    pub fn calls(&self) -> Vec<CompletionRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

fn rough_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

#[async_trait]
impl LlmProvider for MockLlm {
    fn provider_id(&self) -> &str {
        "mock"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let scripted = self
            .script
            .lock()
            .map_err(|_| LlmError::RequestFailed {
                provider: "mock".to_string(),
                reason: "script lock poisoned".to_string(),
            })?
            .pop_front();

        let content = match scripted {
            Some(reply) => reply,
            None => match &self.responder {
                Some(f) => f(&request),
                None => self.default_reply.clone(),
            },
        };

        let usage = TokenUsage {
            input_tokens: rough_tokens(&request.transcript()),
            output_tokens: rough_tokens(&content),
        };

        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request);
        }

        Ok(CompletionResponse {
            content,
            finish_reason: FinishReason::Stop,
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatMessage;

    #[tokio::test]
    async fn test_script_then_responder() {
        let llm = MockLlm::new()
            .with_script(["first"])
            .with_responder(|req| format!("echo: {}", req.messages.len()));

        let req = CompletionRequest::new(vec![ChatMessage::user("hi")]);
        assert_eq!(llm.complete(req.clone()).await.unwrap().content, "first");
        assert_eq!(llm.complete(req).await.unwrap().content, "echo: 1");
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn test_usage_is_counted() {
        let llm = MockLlm::new().with_default_reply("abcdefgh");
        let resp = llm
            .complete(CompletionRequest::new(vec![ChatMessage::user("1234")]))
            .await
            .unwrap();
        assert_eq!(resp.usage.input_tokens, 1);
        assert_eq!(resp.usage.output_tokens, 2);
    }
}
