//! OpenAI-compatible Chat Completions provider.
//!
//! Works against any endpoint speaking the `/chat/completions` wire format
//! with bearer-token auth (OpenAI, DeepSeek, Moonshot, local gateways).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, TokenUsage,
};

/// Connection settings for one resolved chat model.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub provider: String,
    pub model: String,
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub timeout: Duration,
    pub max_output_tokens: Option<u32>,
}

/// OpenAI-compatible chat provider.
pub struct OpenAiProvider {
    client: Client,
    config: OpenAiConfig,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiConfig) -> Result<Self, LlmError> {
        if config.api_key.is_none() {
            return Err(LlmError::AuthFailed {
                provider: config.provider.clone(),
            });
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: config.provider.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self { client, config })
    }

    fn api_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn api_key(&self) -> String {
        self.config
            .api_key
            .as_ref()
            .map(|k| k.expose_secret().to_string())
            .unwrap_or_default()
    }

    async fn send_request<T: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        body: &T,
    ) -> Result<R, LlmError> {
        let provider = &self.config.provider;
        let url = self.api_url("chat/completions");

        tracing::debug!(%provider, model = %self.config.model, "Sending chat completion to {}", url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.api_key())
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout {
                        provider: provider.clone(),
                        after: self.config.timeout,
                    }
                } else {
                    LlmError::RequestFailed {
                        provider: provider.clone(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let response_text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(match status.as_u16() {
                401 | 403 => LlmError::AuthFailed {
                    provider: provider.clone(),
                },
                429 => LlmError::RateLimited {
                    provider: provider.clone(),
                    retry_after,
                },
                400 if response_text.contains("context_length") => LlmError::ContextTooLong {
                    provider: provider.clone(),
                },
                _ => LlmError::RequestFailed {
                    provider: provider.clone(),
                    reason: format!("HTTP {}: {}", status, response_text),
                },
            });
        }

        serde_json::from_str(&response_text).map_err(|e| LlmError::InvalidResponse {
            provider: provider.clone(),
            reason: format!("JSON parse error: {}", e),
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn provider_id(&self) -> &str {
        &self.config.provider
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let request = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: req.messages.into_iter().map(Into::into).collect(),
            temperature: req.temperature,
            max_tokens: req.max_tokens.or(self.config.max_output_tokens),
            response_format: req.json_mode.then(|| ResponseFormat {
                format_type: "json_object".to_string(),
            }),
        };

        let response: ChatCompletionResponse = self.send_request(&request).await?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse {
                provider: self.config.provider.clone(),
                reason: "No choices in response".to_string(),
            })?;

        let fr = choice.finish_reason.as_deref().unwrap_or("");
        let finish_reason = if fr.contains("stop") {
            FinishReason::Stop
        } else if fr.contains("length") {
            FinishReason::Length
        } else if fr.contains("content_filter") {
            FinishReason::ContentFilter
        } else {
            FinishReason::Unknown
        };

        let usage = response
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        Ok(CompletionResponse {
            content: choice.message.and_then(|m| m.content).unwrap_or_default(),
            finish_reason,
            usage,
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatCompletionMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatCompletionMessage {
    role: String,
    content: String,
}

impl From<ChatMessage> for ChatCompletionMessage {
    fn from(msg: ChatMessage) -> Self {
        Self {
            role: msg.role.as_str().to_string(),
            content: msg.content,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
    #[serde(default)]
    usage: Option<ChatCompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: Option<ChatCompletionResponseMessage>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(key: Option<&str>) -> OpenAiConfig {
        OpenAiConfig {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1/".to_string(),
            api_key: key.map(|k| SecretString::from(k.to_string())),
            timeout: Duration::from_secs(5),
            max_output_tokens: None,
        }
    }

    #[test]
    fn test_message_conversion() {
        let msg: ChatCompletionMessage = ChatMessage::system("be brief").into();
        assert_eq!(msg.role, "system");
        assert_eq!(msg.content, "be brief");
    }

    #[test]
    fn test_missing_key_is_auth_error() {
        assert!(matches!(
            OpenAiProvider::new(config(None)),
            Err(LlmError::AuthFailed { .. })
        ));
    }

    #[test]
    fn test_api_url_joins_cleanly() {
        let provider = OpenAiProvider::new(config(Some("sk-test"))).unwrap();
        assert_eq!(
            provider.api_url("/chat/completions"),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn test_json_mode_serializes_response_format() {
        let req = ChatCompletionRequest {
            model: "m".into(),
            messages: vec![],
            temperature: None,
            max_tokens: None,
            response_format: Some(ResponseFormat {
                format_type: "json_object".into(),
            }),
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["response_format"]["type"], "json_object");
        assert!(v.get("temperature").is_none());
    }

    #[test]
    fn test_response_without_usage_parses() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":"hi"},"finish_reason":"stop"}]}"#;
        let resp: ChatCompletionResponse = serde_json::from_str(raw).unwrap();
        assert!(resp.usage.is_none());
        assert_eq!(resp.choices.len(), 1);
    }
}
