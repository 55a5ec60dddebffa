//! Embedding providers for semantic search.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Inputs sent per `/embeddings` request.
pub const MAX_BATCH: usize = 64;

/// Characters kept per input; longer chunks are cut, not rejected.
pub const MAX_INPUT_CHARS: usize = 24_000;

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Embedding request failed: {0}")]
    Request(String),

    #[error("Unexpected embedding response: {0}")]
    BadResponse(String),

    #[error("Embedding endpoint rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Embedding endpoint rejected the API key")]
    Unauthorized,
}

impl EmbeddingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Request(_) => ErrorKind::Network,
            Self::RateLimited { .. } => ErrorKind::RateLimit,
            Self::Unauthorized => ErrorKind::Config,
            Self::BadResponse(_) => ErrorKind::Retrieval,
        }
    }
}

impl From<reqwest::Error> for EmbeddingError {
    fn from(e: reqwest::Error) -> Self {
        EmbeddingError::Request(e.to_string())
    }
}

/// Turns text into fixed-size vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn dimension(&self) -> usize;

    fn model_name(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_batch(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| EmbeddingError::BadResponse("no vector returned".into()))
    }

    /// One vector per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAiEmbeddings {
    client: reqwest::Client,
    api_key: SecretString,
    url: String,
    model: String,
    dimension: usize,
}

impl OpenAiEmbeddings {
    pub fn new(
        api_key: SecretString,
        base_url: &str,
        model: impl Into<String>,
        dimension: usize,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            api_key,
            url: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model: model.into(),
            dimension,
        }
    }

    async fn request(&self, inputs: Vec<&str>) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let expected = inputs.len();
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&EmbeddingRequest {
                model: &self.model,
                input: inputs,
            })
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(EmbeddingError::Unauthorized);
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(EmbeddingError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Request(format!(
                "{} returned {}: {}",
                self.url,
                status,
                crate::agent::truncate_chars(&body, 200)
            )));
        }

        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::BadResponse(e.to_string()))?;
        if parsed.data.len() != expected {
            return Err(EmbeddingError::BadResponse(format!(
                "asked for {} vectors, got {}",
                expected,
                parsed.data.len()
            )));
        }
        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

/// `text` cut to at most [`MAX_INPUT_CHARS`] characters.
fn clip(text: &str) -> &str {
    match text.char_indices().nth(MAX_INPUT_CHARS) {
        Some((at, _)) => &text[..at],
        None => text,
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(MAX_BATCH) {
            let inputs = batch.iter().map(|t| clip(t)).collect();
            vectors.extend(self.request(inputs).await?);
        }
        tracing::debug!(model = %self.model, inputs = texts.len(), "Embedded batch");
        Ok(vectors)
    }
}

/// A mock embedding provider for testing.
///
/// Hashes each word into a bucket, so texts sharing words land close to
/// each other. Every component is non-negative, which keeps cosine
/// similarity in `[0, 1]`.
pub struct MockEmbeddings {
    dimension: usize,
}

impl MockEmbeddings {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }
}

fn tokens(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut word = String::new();
    for c in text.chars() {
        if c.is_alphanumeric() && c.is_ascii() {
            word.extend(c.to_lowercase());
        } else {
            if !word.is_empty() {
                out.push(std::mem::take(&mut word));
            }
            if c.is_alphanumeric() {
                out.push(c.to_string());
            }
        }
    }
    if !word.is_empty() {
        out.push(word);
    }
    out
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddings {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "mock-embedding"
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| self.vector(t)).collect())
    }
}

impl MockEmbeddings {
    fn vector(&self, text: &str) -> Vec<f32> {
        use std::hash::{Hash, Hasher};

        let mut embedding = vec![0.0f32; self.dimension];
        // Shared bias component so unrelated texts still score above zero.
        embedding[0] = 1.0;
        for token in tokens(text) {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            token.hash(&mut hasher);
            let bucket = (hasher.finish() % self.dimension as u64) as usize;
            embedding[bucket] += 1.0;
        }

        let magnitude: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        for x in &mut embedding {
            *x /= magnitude;
        }
        embedding
    }
}

/// Cosine similarity of two vectors. Zero when either is empty or zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_embeddings() {
        let provider = MockEmbeddings::new(64);
        let embedding = provider.embed("hello world").await.unwrap();
        assert_eq!(embedding.len(), 64);

        let magnitude: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((magnitude - 1.0).abs() < 0.001);
    }

    #[tokio::test]
    async fn test_mock_embeddings_deterministic() {
        let provider = MockEmbeddings::new(64);
        let a = provider.embed("test").await.unwrap();
        let b = provider.embed("test").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_shared_words_score_higher() {
        let provider = MockEmbeddings::new(256);
        let q = provider.embed("rust ownership rules").await.unwrap();
        let near = provider.embed("ownership rules in rust explained").await.unwrap();
        let far = provider.embed("cooking pasta at home").await.unwrap();
        assert!(cosine_similarity(&q, &near) > cosine_similarity(&q, &far));
        assert!(cosine_similarity(&q, &far) >= 0.0);
    }

    #[tokio::test]
    async fn test_mock_embeddings_batch() {
        let provider = MockEmbeddings::new(32);
        let out = provider
            .embed_batch(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_clip_keeps_char_boundaries() {
        let long = "é".repeat(MAX_INPUT_CHARS + 10);
        assert_eq!(clip(&long).chars().count(), MAX_INPUT_CHARS);
        assert_eq!(clip("short"), "short");
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(EmbeddingError::Unauthorized.kind(), ErrorKind::Config);
        assert_eq!(EmbeddingError::RateLimited { retry_after: None }.kind(), ErrorKind::RateLimit);
    }

    #[test]
    fn test_cosine_edge_cases() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 1.0], &[2.0, 2.0]) - 1.0).abs() < 1e-6);
    }
}
