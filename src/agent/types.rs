//! Agent task, step, trace and run records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::llm::TokenUsage;
use crate::models::Scene;

/// Maximum citation snippet length in characters.
pub const MAX_SNIPPET_CHARS: usize = 200;

/// Input to [`AgentCore::run_task`](crate::agent::AgentCore::run_task).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub tenant_id: i64,
    #[serde(default = "default_scene")]
    pub scene: Scene,
    pub query: String,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default, alias = "video_id")]
    pub content_id: Option<i64>,
    #[serde(default)]
    pub conversation_id: Option<i64>,
    #[serde(default)]
    pub selection: Option<String>,
    #[serde(default)]
    pub extra_context: serde_json::Map<String, serde_json::Value>,
}

fn default_scene() -> Scene {
    Scene::Chat
}

impl AgentTask {
    pub fn new(tenant_id: i64, scene: Scene, query: impl Into<String>) -> Self {
        Self {
            tenant_id,
            scene,
            query: query.into(),
            user_id: None,
            content_id: None,
            conversation_id: None,
            selection: None,
            extra_context: serde_json::Map::new(),
        }
    }

    pub fn with_user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_content(mut self, content_id: i64) -> Self {
        self.content_id = Some(content_id);
        self
    }

    pub fn with_conversation(mut self, conversation_id: i64) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra_context.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Finished,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Thought,
    Tool,
    FinalAnswer,
}

/// One step of an agent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStep {
    pub index: usize,
    pub kind: StepKind,
    pub thought: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_args: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Record of one tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolTrace {
    pub tool_name: String,
    pub arguments: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Bounded summary of the result.
    pub summary: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CitationType {
    Video,
    Concept,
    Timeline,
    Web,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    #[serde(rename = "type")]
    pub kind: CitationType,
    pub source_id: String,
    pub title: String,
    pub snippet: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Citation {
    pub fn new(
        kind: CitationType,
        source_id: impl Into<String>,
        title: impl Into<String>,
        snippet: &str,
    ) -> Self {
        Self {
            kind,
            source_id: source_id.into(),
            title: title.into(),
            snippet: truncate_chars(snippet, MAX_SNIPPET_CHARS),
            url: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn key(&self) -> (CitationType, &str) {
        (self.kind, self.source_id.as_str())
    }

    /// Content item id for video citations.
    pub fn content_id(&self) -> Option<i64> {
        match self.kind {
            CitationType::Video => self.source_id.parse().ok(),
            _ => None,
        }
    }
}

/// Append citations from `incoming` that are not already present by `(type, id)`.
pub fn merge_citations(into: &mut Vec<Citation>, incoming: impl IntoIterator<Item = Citation>) {
    for c in incoming {
        if !into.iter().any(|existing| existing.key() == c.key()) {
            into.push(c);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyLevel {
    #[default]
    Normal,
    Elevated,
}

/// Persisted record of one end-to-end execution of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: Uuid,
    pub tenant_id: i64,
    pub user_id: Option<i64>,
    pub scene: Scene,
    pub task: AgentTask,
    pub strategy: String,
    pub plan_json: Option<serde_json::Value>,
    pub steps: Vec<AgentStep>,
    pub tool_traces: Vec<ToolTrace>,
    pub answer: String,
    pub citations: Vec<Citation>,
    pub safety_level: SafetyLevel,
    pub error_code: Option<ErrorKind>,
    pub total_duration_ms: u64,
    pub token_usage: TokenUsage,
    pub created_at: DateTime<Utc>,
}

/// What the caller receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub run_id: Uuid,
    pub answer: String,
    pub citations: Vec<Citation>,
    pub steps: Vec<AgentStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_json: Option<serde_json::Value>,
    pub safety_level: SafetyLevel,
    pub error_code: Option<ErrorKind>,
    pub token_usage: TokenUsage,
    pub total_duration_ms: u64,
    pub strategy: String,
    #[serde(skip)]
    pub tool_traces: Vec<ToolTrace>,
}

impl From<&AgentRun> for AgentResult {
    fn from(run: &AgentRun) -> Self {
        Self {
            run_id: run.id,
            answer: run.answer.clone(),
            citations: run.citations.clone(),
            steps: run.steps.clone(),
            plan_json: run.plan_json.clone(),
            safety_level: run.safety_level,
            error_code: run.error_code,
            token_usage: run.token_usage,
            total_duration_ms: run.total_duration_ms,
            strategy: run.strategy.clone(),
            tool_traces: run.tool_traces.clone(),
        }
    }
}

/// Truncate to at most `max` characters, ending with `...` when cut.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let keep = max.saturating_sub(3);
    let mut out: String = s.chars().take(keep).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_payload_accepts_video_id_alias() {
        let task: AgentTask = serde_json::from_value(serde_json::json!({
            "tenant_id": 1,
            "query": "what was said about rust",
            "video_id": 42
        }))
        .unwrap();
        assert_eq!(task.scene, Scene::Chat);
        assert_eq!(task.content_id, Some(42));
        assert!(task.extra_context.is_empty());
    }

    #[test]
    fn test_truncate_chars_is_char_safe() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("abcdefghij", 6), "abc...");
        let cjk = "你好世界你好世界";
        let cut = truncate_chars(cjk, 5);
        assert_eq!(cut.chars().count(), 5);
        assert!(cut.ends_with("..."));
    }

    #[test]
    fn test_citations_dedup_by_type_and_id() {
        let mut list = vec![Citation::new(CitationType::Video, "1", "A", "x")];
        merge_citations(
            &mut list,
            vec![
                Citation::new(CitationType::Video, "1", "A again", "y"),
                Citation::new(CitationType::Concept, "1", "concept", "z"),
            ],
        );
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].title, "A");
        assert_eq!(list[0].content_id(), Some(1));
        assert_eq!(list[1].content_id(), None);
    }

    #[test]
    fn test_citation_snippet_bounded() {
        let long = "x".repeat(1000);
        let c = Citation::new(CitationType::Web, "u", "t", &long);
        assert!(c.snippet.chars().count() <= MAX_SNIPPET_CHARS);
    }
}
