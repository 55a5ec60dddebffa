//! Web research and report writing.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::search::ResearchService;
use crate::tools::tool::{Tool, ToolCategory, ToolContext, ToolError, ToolOutput, require_str};

const DEFAULT_REPORT_PROMPT: &str = "Write a well-structured {format} report on the topic \
below. Use the notes when given and do not invent facts.\n\nTopic: {topic}\n\nNotes:\n{notes}";

/// Multi-step web search with a synthesised answer.
pub struct DeepWebResearchTool {
    research: Arc<ResearchService>,
}

impl DeepWebResearchTool {
    pub fn new(research: Arc<ResearchService>) -> Self {
        Self { research }
    }
}

#[async_trait]
impl Tool for DeepWebResearchTool {
    fn name(&self) -> &str {
        "deep_web_research"
    }

    fn description(&self) -> &str {
        "Search the web in several passes and combine the sources into one answer. \
         Use for recent events, comparisons, or anything needing several sources."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Question to research"},
                "max_steps": {
                    "type": "integer",
                    "description": "Maximum search passes",
                    "minimum": 1,
                    "maximum": 8,
                    "default": 4
                }
            },
            "required": ["query"]
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Search
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let query = require_str(&params, "query")?;
        let max_steps = params
            .get("max_steps")
            .and_then(|v| v.as_u64())
            .map(|n| n.clamp(1, 8) as usize)
            .unwrap_or(4);

        let result = self.research.run(query, max_steps).await?;
        let value =
            serde_json::to_value(&result).map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(ToolOutput::success(value, start.elapsed()))
    }
}

/// Long-form report written by the chat model.
pub struct GenerateReportTool {
    llm: Arc<dyn LlmProvider>,
    prompt: String,
}

impl GenerateReportTool {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self {
            llm,
            prompt: DEFAULT_REPORT_PROMPT.to_string(),
        }
    }

    /// Template with `{topic}`, `{notes}` and `{format}`.
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }
}

#[async_trait]
impl Tool for GenerateReportTool {
    fn name(&self) -> &str {
        "generate_report"
    }

    fn description(&self) -> &str {
        "Write a structured report on a topic from the notes gathered so far."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "topic": {"type": "string"},
                "notes": {"type": "string", "description": "Findings to build the report from"},
                "format": {"type": "string", "enum": ["markdown", "plain"], "default": "markdown"}
            },
            "required": ["topic"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let topic = require_str(&params, "topic")?;
        let notes = params.get("notes").and_then(|v| v.as_str()).unwrap_or("(none)");
        let format = params
            .get("format")
            .and_then(|v| v.as_str())
            .unwrap_or("markdown");

        let prompt = self
            .prompt
            .replace("{topic}", topic)
            .replace("{notes}", notes)
            .replace("{format}", format);
        let response = self
            .llm
            .complete(CompletionRequest::new(vec![ChatMessage::user(prompt)]))
            .await
            .map_err(|e| match e.kind() {
                crate::error::ErrorKind::RateLimit => ToolError::RateLimited(None),
                _ => ToolError::ExternalService(e.to_string()),
            })?;

        Ok(ToolOutput::success(
            serde_json::json!({"topic": topic, "format": format, "report": response.content}),
            start.elapsed(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;
    use crate::models::Scene;
    use crate::search::MockSearch;

    #[tokio::test]
    async fn test_research_output_carries_urls() {
        let tool = DeepWebResearchTool::new(Arc::new(ResearchService::new(Arc::new(MockSearch))));
        let ctx = ToolContext::new(1, Scene::Research);
        let out = tool
            .execute(serde_json::json!({"query": "latest rust news"}), &ctx)
            .await
            .unwrap();
        assert!(out.result["sources"][0]["url"].as_str().unwrap().starts_with("https://"));
        assert_eq!(tool.category(), ToolCategory::Search);
    }

    #[tokio::test]
    async fn test_report_uses_llm() {
        let llm = Arc::new(MockLlm::new().with_default_reply("# Report"));
        let tool = GenerateReportTool::new(llm.clone());
        let ctx = ToolContext::new(1, Scene::Research);
        let out = tool
            .execute(serde_json::json!({"topic": "async rust", "notes": "tokio"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out.result["report"], "# Report");
        assert!(llm.calls()[0].transcript().contains("tokio"));
    }
}
