//! Tools over the tenant's processed content: retrieval, summaries and
//! the concept index.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::agent::{MAX_SNIPPET_CHARS, truncate_chars};
use crate::db::Database;
use crate::error::RetrievalError;
use crate::retrieval::{ConceptIndex, RetrievalService};
use crate::tools::tool::{Tool, ToolContext, ToolError, ToolOutput, require_str};

fn retrieval_err(e: RetrievalError) -> ToolError {
    match e {
        RetrievalError::InvalidPartition(p) => ToolError::InvalidParameters(p),
        other => ToolError::ExternalService(other.to_string()),
    }
}

fn optional_id(params: &serde_json::Value, name: &str) -> Result<Option<i64>, ToolError> {
    match params.get(name) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
            .map(Some)
            .ok_or_else(|| ToolError::InvalidParameters(format!("'{}' must be an integer", name))),
    }
}

fn limit_param(params: &serde_json::Value, default: usize, max: usize) -> usize {
    params
        .get("limit")
        .or_else(|| params.get("top_k"))
        .and_then(|v| v.as_u64())
        .map(|n| usize::try_from(n).unwrap_or(max).clamp(1, max))
        .unwrap_or(default)
}

/// Ask a question answered from indexed transcripts.
pub struct AskVideoTool {
    retrieval: Arc<dyn RetrievalService>,
}

impl AskVideoTool {
    pub fn new(retrieval: Arc<dyn RetrievalService>) -> Self {
        Self { retrieval }
    }
}

#[async_trait]
impl Tool for AskVideoTool {
    fn name(&self) -> &str {
        "ask_video"
    }

    fn description(&self) -> &str {
        "Answer a question from the transcripts of the user's processed videos. \
         Pass video_id to restrict the answer to one video."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "question": {"type": "string", "description": "The question to answer"},
                "video_id": {"type": "integer", "description": "Optional content item id"}
            },
            "required": ["question"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let question = require_str(&params, "question")?;
        let video_id = optional_id(&params, "video_id")?;

        let partition = self
            .retrieval
            .get_or_create_partition(ctx.tenant_id)
            .await
            .map_err(retrieval_err)?;
        let result = self
            .retrieval
            .ask_filtered(&partition, question, video_id)
            .await
            .map_err(retrieval_err)?;

        Ok(ToolOutput::success(
            serde_json::json!({
                "answer": result.answer,
                "sources": result.sources,
            }),
            start.elapsed(),
        ))
    }
}

/// Semantic search over transcript chunks.
pub struct SearchVideosTool {
    retrieval: Arc<dyn RetrievalService>,
}

impl SearchVideosTool {
    pub fn new(retrieval: Arc<dyn RetrievalService>) -> Self {
        Self { retrieval }
    }
}

#[async_trait]
impl Tool for SearchVideosTool {
    fn name(&self) -> &str {
        "search_videos"
    }

    fn description(&self) -> &str {
        "Search the user's processed videos for passages related to a query."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "What to look for"},
                "limit": {"type": "integer", "description": "Maximum results (default 5, max 20)"}
            },
            "required": ["query"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let query = require_str(&params, "query")?;
        let limit = limit_param(&params, 5, 20);

        let partition = self
            .retrieval
            .get_or_create_partition(ctx.tenant_id)
            .await
            .map_err(retrieval_err)?;
        let hits = self
            .retrieval
            .search(&partition, query, limit)
            .await
            .map_err(retrieval_err)?;

        let results: Vec<serde_json::Value> = hits
            .iter()
            .map(|hit| {
                serde_json::json!({
                    "content_id": hit.content_id,
                    "title": hit.title,
                    "chunk_id": hit.chunk_id,
                    "snippet": truncate_chars(&hit.content, MAX_SNIPPET_CHARS),
                    "score": hit.score,
                })
            })
            .collect();

        Ok(ToolOutput::success(
            serde_json::json!({"query": query, "results": results}),
            start.elapsed(),
        ))
    }
}

/// Stored analysis of one content item.
pub struct VideoSummaryTool {
    db: Arc<dyn Database>,
}

impl VideoSummaryTool {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Tool for VideoSummaryTool {
    fn name(&self) -> &str {
        "get_video_summary"
    }

    fn description(&self) -> &str {
        "Get the summary, key points and concepts of a processed video."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "video_id": {"type": "integer", "description": "Content item id"}
            },
            "required": ["video_id"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let id = optional_id(&params, "video_id")?
            .ok_or_else(|| ToolError::InvalidParameters("missing 'video_id' parameter".into()))?;

        let item = self
            .db
            .get_content_item(id)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?
            .filter(|item| item.tenant_id == ctx.tenant_id)
            .ok_or_else(|| ToolError::InvalidParameters(format!("video {} not found", id)))?;

        let analysis = item.analysis.clone().unwrap_or_default();
        Ok(ToolOutput::success(
            serde_json::json!({
                "content_id": item.id,
                "title": item.title,
                "status": item.status,
                "url": item.source_url(),
                "summary": analysis.summary,
                "key_points": analysis.key_points,
                "concepts": analysis.concepts,
                "tags": analysis.tags,
                "analyzed": item.analysis.is_some(),
            }),
            start.elapsed(),
        ))
    }
}

/// Lookup in the concept graph built from analysed content.
pub struct SearchGraphTool {
    concepts: Arc<ConceptIndex>,
}

impl SearchGraphTool {
    pub fn new(concepts: Arc<ConceptIndex>) -> Self {
        Self { concepts }
    }
}

#[async_trait]
impl Tool for SearchGraphTool {
    fn name(&self) -> &str {
        "search_graph"
    }

    fn description(&self) -> &str {
        "Find concepts in the knowledge graph and the videos that mention them."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Concept or topic"},
                "limit": {"type": "integer", "description": "Maximum concepts (default 10)"}
            },
            "required": ["query"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let query = require_str(&params, "query")?;
        let limit = limit_param(&params, 10, 50);

        let hits = self
            .concepts
            .search(ctx.tenant_id, query, limit)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        Ok(ToolOutput::success(
            serde_json::json!({"query": query, "concepts": hits}),
            start.elapsed(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryDatabase;
    use crate::llm::MockLlm;
    use crate::models::{ContentAnalysis, NewContentItem, Scene, SourceType};
    use crate::retrieval::{InMemoryVectorIndex, MockEmbeddings, VectorRetrieval};

    #[test]
    fn test_limit_param_bounds() {
        assert_eq!(limit_param(&serde_json::json!({}), 5, 20), 5);
        assert_eq!(limit_param(&serde_json::json!({"top_k": 0}), 5, 20), 1);
        assert_eq!(limit_param(&serde_json::json!({"limit": u64::MAX}), 5, 20), 20);
    }

    async fn fixture() -> (Arc<InMemoryDatabase>, Arc<dyn RetrievalService>, i64) {
        let db = Arc::new(InMemoryDatabase::new());
        let (item, _) = db
            .insert_content_item(&NewContentItem::new(
                1,
                SourceType::Bilibili,
                "BV1xx411c7mD",
                "Ownership in Rust",
            ))
            .await
            .unwrap();
        db.save_content_analysis(
            item.id,
            &ContentAnalysis {
                summary: "Explains ownership and borrowing.".into(),
                concepts: vec!["Ownership".into()],
                ..Default::default()
            },
        )
        .await
        .unwrap();
        db.mark_content_done(item.id).await.unwrap();

        let retrieval: Arc<dyn RetrievalService> = Arc::new(
            VectorRetrieval::new(
                Arc::new(InMemoryVectorIndex::new()),
                Arc::new(MockEmbeddings::new(64)),
            )
            .with_llm(Arc::new(MockLlm::new().with_default_reply("Ownership moves values."))),
        );
        let partition = retrieval.get_or_create_partition(1).await.unwrap();
        retrieval
            .upsert(
                &partition,
                item.id,
                &item.title,
                "Ownership moves values. Borrowing lends them.",
                None,
            )
            .await
            .unwrap();
        (db, retrieval, item.id)
    }

    #[tokio::test]
    async fn test_search_videos_returns_content_ids() {
        let (_db, retrieval, id) = fixture().await;
        let tool = SearchVideosTool::new(retrieval);
        let ctx = ToolContext::new(1, Scene::Library);
        let out = tool
            .execute(serde_json::json!({"query": "ownership"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out.result["results"][0]["content_id"], id);
    }

    #[tokio::test]
    async fn test_ask_video_sources() {
        let (_db, retrieval, id) = fixture().await;
        let tool = AskVideoTool::new(retrieval);
        let ctx = ToolContext::new(1, Scene::Video);
        let out = tool
            .execute(
                serde_json::json!({"question": "what is ownership", "video_id": id}),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(out.result["answer"], "Ownership moves values.");
        assert_eq!(out.result["sources"][0]["content_id"], id);
    }

    #[tokio::test]
    async fn test_summary_is_tenant_scoped() {
        let (db, _retrieval, id) = fixture().await;
        let tool = VideoSummaryTool::new(db);

        let own = ToolContext::new(1, Scene::Video);
        let out = tool
            .execute(serde_json::json!({"video_id": id}), &own)
            .await
            .unwrap();
        assert_eq!(out.result["summary"], "Explains ownership and borrowing.");

        let other = ToolContext::new(2, Scene::Video);
        assert!(tool
            .execute(serde_json::json!({"video_id": id}), &other)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_search_graph() {
        let (db, _retrieval, id) = fixture().await;
        let tool = SearchGraphTool::new(Arc::new(ConceptIndex::new(db)));
        let ctx = ToolContext::new(1, Scene::Graph);
        let out = tool
            .execute(serde_json::json!({"query": "ownership"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out.result["concepts"][0]["content_ids"][0], id);
    }
}
