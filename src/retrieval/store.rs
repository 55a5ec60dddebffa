//! Retrieval service: partitions, chunked upsert, search, ask and the
//! degraded title-match fallback.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::chunker::{DEFAULT_CHUNK_SIZE, chunk_text};
use super::embeddings::EmbeddingProvider;
use super::vector::{ChunkRecord, VectorIndex};
use crate::db::Database;
use crate::error::RetrievalError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};

/// Default number of chunks fed into `ask`.
pub const ASK_TOP_K: usize = 5;

/// Score assigned to degraded title matches.
pub const FALLBACK_SCORE: f32 = 0.5;

const DEFAULT_ASK_PROMPT: &str = "Answer the question using only the excerpts below. \
If they do not contain the answer, say so.\n\n{context}";

/// Stable partition name for a tenant.
pub fn partition_name(tenant_id: i64) -> String {
    format!("tenant_{}_content", tenant_id)
}

/// Tenant id encoded in a partition name.
pub fn partition_tenant(partition: &str) -> Result<i64, RetrievalError> {
    partition
        .strip_prefix("tenant_")
        .and_then(|rest| rest.strip_suffix("_content"))
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| RetrievalError::InvalidPartition(partition.to_string()))
}

/// Chunk id for a content item.
pub fn chunk_id(content_id: i64, index: usize) -> String {
    format!("content_{}_chunk_{}", content_id, index)
}

/// Cosine distance to a `(0, 1]` score.
pub fn distance_to_score(distance: f32) -> f32 {
    1.0 / (1.0 + distance.max(0.0))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub content: String,
    pub score: f32,
    pub metadata: serde_json::Value,
    pub content_id: i64,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskSource {
    pub content_id: i64,
    pub title: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskResult {
    pub answer: String,
    pub sources: Vec<AskSource>,
}

/// One content item reassembled from its chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedContent {
    pub content_id: i64,
    pub title: String,
    pub text: String,
    pub chunk_count: usize,
}

/// The index abstraction used by the pipeline, context and tools.
#[async_trait]
pub trait RetrievalService: Send + Sync {
    async fn get_or_create_partition(&self, tenant_id: i64) -> Result<String, RetrievalError>;

    /// Chunk, embed and write `text` for `content_id`, replacing prior chunks.
    ///
    /// Returns the document id.
    async fn upsert(
        &self,
        partition: &str,
        content_id: i64,
        title: &str,
        text: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<String, RetrievalError>;

    async fn delete(&self, partition: &str, content_id: i64) -> Result<(), RetrievalError>;

    /// Search, optionally restricted to one content item.
    async fn search_filtered(
        &self,
        partition: &str,
        query: &str,
        top_k: usize,
        content_id: Option<i64>,
    ) -> Result<Vec<SearchHit>, RetrievalError>;

    async fn search(
        &self,
        partition: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<SearchHit>, RetrievalError> {
        self.search_filtered(partition, query, top_k, None).await
    }

    /// Answer `question` from the top chunks, optionally within one content item.
    async fn ask_filtered(
        &self,
        partition: &str,
        question: &str,
        content_id: Option<i64>,
    ) -> Result<AskResult, RetrievalError>;

    async fn ask(&self, partition: &str, question: &str) -> Result<AskResult, RetrievalError> {
        self.ask_filtered(partition, question, None).await
    }

    async fn is_available(&self) -> bool;

    async fn export_all(&self, partition: &str) -> Result<Vec<ExportedContent>, RetrievalError>;
}

fn dedup_sources(hits: &[SearchHit]) -> Vec<AskSource> {
    let mut sources: Vec<AskSource> = Vec::new();
    for hit in hits {
        if !sources.iter().any(|s| s.content_id == hit.content_id) {
            sources.push(AskSource {
                content_id: hit.content_id,
                title: hit.title.clone(),
                score: hit.score,
            });
        }
    }
    sources
}

/// Embedding-backed retrieval over a [`VectorIndex`].
pub struct VectorRetrieval {
    index: Arc<dyn VectorIndex>,
    embeddings: Arc<dyn EmbeddingProvider>,
    llm: Option<Arc<dyn LlmProvider>>,
    chunk_size: usize,
    ask_prompt: String,
}

impl VectorRetrieval {
    pub fn new(index: Arc<dyn VectorIndex>, embeddings: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            index,
            embeddings,
            llm: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            ask_prompt: DEFAULT_ASK_PROMPT.to_string(),
        }
    }

    /// Chat model used by `ask`.
    pub fn with_llm(mut self, llm: Arc<dyn LlmProvider>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// System prompt for `ask`; `{context}` receives the excerpts.
    pub fn with_ask_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.ask_prompt = prompt.into();
        self
    }
}

#[async_trait]
impl RetrievalService for VectorRetrieval {
    async fn get_or_create_partition(&self, tenant_id: i64) -> Result<String, RetrievalError> {
        let name = partition_name(tenant_id);
        self.index.ensure_partition(&name).await?;
        Ok(name)
    }

    async fn upsert(
        &self,
        partition: &str,
        content_id: i64,
        title: &str,
        text: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<String, RetrievalError> {
        partition_tenant(partition)?;
        let pieces = chunk_text(text, self.chunk_size);
        let total = pieces.len();
        let embeddings = self.embeddings.embed_batch(&pieces).await?;

        let extra = match metadata {
            Some(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };

        let chunks: Vec<ChunkRecord> = pieces
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .map(|(i, (piece, embedding))| {
                let mut meta = extra.clone();
                meta.insert("content_id".into(), content_id.into());
                meta.insert("title".into(), title.into());
                meta.insert("chunk_index".into(), i.into());
                meta.insert("total_chunks".into(), total.into());
                ChunkRecord {
                    id: chunk_id(content_id, i),
                    content_id,
                    chunk_index: i,
                    title: title.to_string(),
                    text: piece,
                    metadata: serde_json::Value::Object(meta),
                    embedding,
                }
            })
            .collect();

        self.index.replace_content(partition, content_id, chunks).await?;
        tracing::debug!(partition, content_id, chunks = total, "Indexed content");
        Ok(format!("content_{}", content_id))
    }

    async fn delete(&self, partition: &str, content_id: i64) -> Result<(), RetrievalError> {
        let removed = self.index.delete_content(partition, content_id).await?;
        tracing::debug!(partition, content_id, removed, "Deleted content chunks");
        Ok(())
    }

    async fn search_filtered(
        &self,
        partition: &str,
        query: &str,
        top_k: usize,
        content_id: Option<i64>,
    ) -> Result<Vec<SearchHit>, RetrievalError> {
        partition_tenant(partition)?;
        if query.trim().is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        let embedding = self.embeddings.embed(query).await?;
        let nearest = self
            .index
            .nearest(partition, &embedding, top_k, content_id)
            .await?;

        Ok(nearest
            .into_iter()
            .map(|(chunk, distance)| SearchHit {
                chunk_id: chunk.id,
                content: chunk.text,
                score: distance_to_score(distance),
                metadata: chunk.metadata,
                content_id: chunk.content_id,
                title: chunk.title,
            })
            .collect())
    }

    async fn ask_filtered(
        &self,
        partition: &str,
        question: &str,
        content_id: Option<i64>,
    ) -> Result<AskResult, RetrievalError> {
        let llm = self
            .llm
            .as_ref()
            .ok_or_else(|| RetrievalError::Unavailable("no chat model for ask".to_string()))?;

        let hits = self
            .search_filtered(partition, question, ASK_TOP_K, content_id)
            .await?;
        let context = hits
            .iter()
            .enumerate()
            .map(|(i, h)| format!("[{}] {}:\n{}", i + 1, h.title, h.content))
            .collect::<Vec<_>>()
            .join("\n\n");

        let system = self.ask_prompt.replace("{context}", &context);
        let response = llm
            .complete(CompletionRequest::new(vec![
                ChatMessage::system(system),
                ChatMessage::user(question),
            ]))
            .await?;

        Ok(AskResult {
            answer: response.content,
            sources: dedup_sources(&hits),
        })
    }

    async fn is_available(&self) -> bool {
        self.index.health().await
    }

    async fn export_all(&self, partition: &str) -> Result<Vec<ExportedContent>, RetrievalError> {
        let chunks = self.index.list_chunks(partition).await?;
        let mut grouped: BTreeMap<i64, ExportedContent> = BTreeMap::new();
        for chunk in chunks {
            let entry = grouped
                .entry(chunk.content_id)
                .or_insert_with(|| ExportedContent {
                    content_id: chunk.content_id,
                    title: chunk.title.clone(),
                    text: String::new(),
                    chunk_count: 0,
                });
            if !entry.text.is_empty() {
                entry.text.push(' ');
            }
            entry.text.push_str(&chunk.text);
            entry.chunk_count += 1;
        }
        Ok(grouped.into_values().collect())
    }
}

/// Degraded mode: substring match on titles through the relational store.
pub struct FallbackRetrieval {
    db: Arc<dyn Database>,
}

impl FallbackRetrieval {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RetrievalService for FallbackRetrieval {
    async fn get_or_create_partition(&self, tenant_id: i64) -> Result<String, RetrievalError> {
        Ok(partition_name(tenant_id))
    }

    async fn upsert(
        &self,
        _partition: &str,
        _content_id: i64,
        _title: &str,
        _text: &str,
        _metadata: Option<serde_json::Value>,
    ) -> Result<String, RetrievalError> {
        Err(RetrievalError::Unavailable(
            "fallback retrieval cannot index".to_string(),
        ))
    }

    async fn delete(&self, _partition: &str, _content_id: i64) -> Result<(), RetrievalError> {
        Ok(())
    }

    async fn search_filtered(
        &self,
        partition: &str,
        query: &str,
        top_k: usize,
        content_id: Option<i64>,
    ) -> Result<Vec<SearchHit>, RetrievalError> {
        let tenant_id = partition_tenant(partition)?;
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let mut items = self.db.search_content_titles(tenant_id, query, top_k).await?;
        if items.is_empty() {
            for term in query.split_whitespace().filter(|t| t.chars().count() >= 2) {
                for item in self.db.search_content_titles(tenant_id, term, top_k).await? {
                    if !items.iter().any(|i| i.id == item.id) {
                        items.push(item);
                    }
                }
            }
        }

        Ok(items
            .into_iter()
            .filter(|item| content_id.is_none_or(|id| item.id == id))
            .take(top_k)
            .map(|item| {
                let content = item
                    .analysis
                    .as_ref()
                    .map(|a| a.summary.clone())
                    .unwrap_or_default();
                SearchHit {
                    chunk_id: chunk_id(item.id, 0),
                    content,
                    score: FALLBACK_SCORE,
                    metadata: serde_json::json!({
                        "content_id": item.id,
                        "title": item.title,
                        "degraded": true,
                    }),
                    content_id: item.id,
                    title: item.title,
                }
            })
            .collect())
    }

    async fn ask_filtered(
        &self,
        partition: &str,
        question: &str,
        content_id: Option<i64>,
    ) -> Result<AskResult, RetrievalError> {
        let hits = self
            .search_filtered(partition, question, ASK_TOP_K, content_id)
            .await?;
        let answer = if hits.is_empty() {
            "Semantic search is unavailable and no titles matched the question.".to_string()
        } else {
            let titles: Vec<&str> = hits.iter().map(|h| h.title.as_str()).collect();
            format!(
                "Semantic search is unavailable. Possibly related items: {}",
                titles.join(", ")
            )
        };
        Ok(AskResult {
            answer,
            sources: dedup_sources(&hits),
        })
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn export_all(&self, partition: &str) -> Result<Vec<ExportedContent>, RetrievalError> {
        partition_tenant(partition)?;
        Ok(Vec::new())
    }
}

/// Routes to the primary backend, or to the fallback when the primary is down.
pub struct ResilientRetrieval {
    primary: Arc<dyn RetrievalService>,
    fallback: Arc<dyn RetrievalService>,
}

impl ResilientRetrieval {
    pub fn new(primary: Arc<dyn RetrievalService>, fallback: Arc<dyn RetrievalService>) -> Self {
        Self { primary, fallback }
    }

    async fn active(&self) -> &Arc<dyn RetrievalService> {
        if self.primary.is_available().await {
            &self.primary
        } else {
            tracing::warn!(component = "retrieval", "Vector index unavailable, using title fallback");
            &self.fallback
        }
    }
}

#[async_trait]
impl RetrievalService for ResilientRetrieval {
    async fn get_or_create_partition(&self, tenant_id: i64) -> Result<String, RetrievalError> {
        self.active().await.get_or_create_partition(tenant_id).await
    }

    async fn upsert(
        &self,
        partition: &str,
        content_id: i64,
        title: &str,
        text: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<String, RetrievalError> {
        self.primary
            .upsert(partition, content_id, title, text, metadata)
            .await
    }

    async fn delete(&self, partition: &str, content_id: i64) -> Result<(), RetrievalError> {
        self.primary.delete(partition, content_id).await
    }

    async fn search_filtered(
        &self,
        partition: &str,
        query: &str,
        top_k: usize,
        content_id: Option<i64>,
    ) -> Result<Vec<SearchHit>, RetrievalError> {
        let active = self.active().await;
        match active
            .search_filtered(partition, query, top_k, content_id)
            .await
        {
            Err(RetrievalError::Unavailable(reason)) if Arc::ptr_eq(active, &self.primary) => {
                tracing::warn!(component = "retrieval", %reason, "Primary search failed, using fallback");
                self.fallback
                    .search_filtered(partition, query, top_k, content_id)
                    .await
            }
            other => other,
        }
    }

    async fn ask_filtered(
        &self,
        partition: &str,
        question: &str,
        content_id: Option<i64>,
    ) -> Result<AskResult, RetrievalError> {
        self.active()
            .await
            .ask_filtered(partition, question, content_id)
            .await
    }

    async fn is_available(&self) -> bool {
        self.primary.is_available().await || self.fallback.is_available().await
    }

    async fn export_all(&self, partition: &str) -> Result<Vec<ExportedContent>, RetrievalError> {
        self.primary.export_all(partition).await
    }
}
