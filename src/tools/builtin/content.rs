//! Submitting new content to the processing pipeline.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::db::Database;
use crate::models::{NewContentItem, SourceType};
use crate::pipeline::{ContentRef, ProcessingQueue, parse_parts, parse_reference};
use crate::tools::tool::{Tool, ToolContext, ToolError, ToolOutput};

/// Registers a URL (or `source_type` + `source_id`) as a content item and
/// queues it for processing. Known items are re-queued, not duplicated.
pub struct SubmitContentTool {
    db: Arc<dyn Database>,
    queue: Option<Arc<ProcessingQueue>>,
}

impl SubmitContentTool {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db, queue: None }
    }

    /// Without a queue, items stay `pending` until the worker drains them.
    pub fn with_queue(mut self, queue: Arc<ProcessingQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    fn reference(params: &serde_json::Value) -> Result<ContentRef, ToolError> {
        let invalid = |e: crate::error::PipelineError| ToolError::InvalidParameters(e.to_string());
        if let Some(url) = params.get("url").and_then(|v| v.as_str()) {
            return parse_reference(url).map_err(invalid);
        }
        let source_type = params.get("source_type").and_then(|v| v.as_str());
        let source_id = params.get("source_id").and_then(|v| v.as_str());
        match (source_type, source_id) {
            (Some(t), Some(id)) => {
                let t = SourceType::from_str(t).map_err(ToolError::InvalidParameters)?;
                parse_parts(t, id).map_err(invalid)
            }
            _ => Err(ToolError::InvalidParameters(
                "provide 'url' or both 'source_type' and 'source_id'".into(),
            )),
        }
    }
}

#[async_trait]
impl Tool for SubmitContentTool {
    fn name(&self) -> &str {
        "submit_content"
    }

    fn description(&self) -> &str {
        "Add a Bilibili, YouTube or podcast link to the library and start processing it \
         (download, transcription, analysis and indexing)."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "Video or podcast URL, or type:id"},
                "source_type": {"type": "string", "enum": ["bilibili", "youtube", "podcast"]},
                "source_id": {"type": "string"},
                "title": {"type": "string", "description": "Optional title until metadata is known"}
            }
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let reference = Self::reference(&params)?;
        let title = params
            .get("title")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}:{}", reference.source_type, reference.source_id));

        let mut new_item = NewContentItem::new(
            ctx.tenant_id,
            reference.source_type,
            reference.source_id.clone(),
            title,
        );
        new_item.media_url = reference.url.clone();

        let (item, created) = self
            .db
            .insert_content_item(&new_item)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        let queued = match &self.queue {
            Some(queue) => queue.submit(item.id, ctx.user_id),
            None => false,
        };
        tracing::info!(
            tenant_id = ctx.tenant_id,
            item_id = item.id,
            created,
            queued,
            "Content submitted"
        );

        Ok(ToolOutput::success(
            serde_json::json!({
                "content_id": item.id,
                "source_type": item.source_type,
                "source_id": item.source_id,
                "status": item.status,
                "created": created,
                "queued": queued,
            }),
            start.elapsed(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryDatabase;
    use crate::models::{ContentStatus, Scene};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_submit_url_creates_pending_item() {
        let db = Arc::new(InMemoryDatabase::new());
        let tool = SubmitContentTool::new(db.clone());
        let ctx = ToolContext::new(1, Scene::Chat);

        let out = tool
            .execute(
                serde_json::json!({"url": "https://www.bilibili.com/video/BV1xx411c7mD"}),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(out.result["created"], true);
        assert_eq!(out.result["queued"], false);

        let item = db
            .find_content_item(1, "bilibili", "BV1xx411c7mD")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.status, ContentStatus::Pending);
    }

    #[tokio::test]
    async fn test_resubmit_is_idempotent() {
        let db = Arc::new(InMemoryDatabase::new());
        let tool = SubmitContentTool::new(db.clone());
        let ctx = ToolContext::new(1, Scene::Chat);
        let params = serde_json::json!({"source_type": "youtube", "source_id": "dQw4w9WgXcQ"});

        let first = tool.execute(params.clone(), &ctx).await.unwrap();
        let second = tool.execute(params, &ctx).await.unwrap();
        assert_eq!(first.result["content_id"], second.result["content_id"]);
        assert_eq!(second.result["created"], false);
    }

    #[tokio::test]
    async fn test_rejects_unknown_input() {
        let tool = SubmitContentTool::new(Arc::new(InMemoryDatabase::new()));
        let ctx = ToolContext::new(1, Scene::Chat);
        let err = tool
            .execute(serde_json::json!({"url": "https://example.com/page"}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));

        let err = tool.execute(serde_json::json!({}), &ctx).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));
    }
}
