//! The ReAct loop: think, act, observe until the model answers or the step
//! bound is hit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;

use super::parser::{ParsedReply, ToolCall, parse_reply};
use super::planner::Plan;
use super::types::{
    AgentStep, Citation, CitationType, RunState, StepKind, ToolTrace, merge_citations,
    truncate_chars,
};
use crate::config::AgentSettings;
use crate::context::AssembledContext;
use crate::control_plane::{AGENT_FINAL_ANSWER, AGENT_NEXT_STEP, AGENT_REACT, PromptStore, interpolate, vars};
use crate::error::ErrorKind;
use crate::llm::{ChatMessage, CompletionRequest, CompletionResponse, LlmProvider, TokenUsage};
use crate::tools::{ToolContext, ToolRouter, ToolSchema};

/// Tool names that end the loop when called.
pub const TERMINAL_TOOLS: [&str; 3] = ["terminate", "finish", "final_answer"];

/// Answer returned when a run fails.
pub const APOLOGY: &str = "Sorry, I ran into a problem while working on that. Please try again in a moment.";

const NO_OBSERVATIONS: &str = "(no observations yet)";

#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    pub max_steps: usize,
    pub max_observation: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_steps: 10,
            max_observation: 2000,
        }
    }
}

impl ExecutorConfig {
    pub fn from_settings(settings: &AgentSettings) -> Self {
        Self {
            max_steps: settings.max_steps.max(1),
            max_observation: settings.max_observation.max(16),
        }
    }
}

/// Everything one execution needs.
pub struct ExecutionRequest<'a> {
    pub plan: &'a Plan,
    /// Persona and strategy suffix.
    pub system_prompt: &'a str,
    pub context: &'a AssembledContext,
    pub tools: &'a [ToolSchema],
    pub tool_ctx: &'a ToolContext,
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub state: RunState,
    pub steps: Vec<AgentStep>,
    pub traces: Vec<ToolTrace>,
    pub answer: String,
    pub citations: Vec<Citation>,
    pub usage: TokenUsage,
    pub error: Option<ErrorKind>,
    /// The answer was synthesised after the step bound was reached.
    pub forced_final: bool,
}

impl ExecutionOutcome {
    fn new() -> Self {
        Self {
            state: RunState::Running,
            steps: Vec::new(),
            traces: Vec::new(),
            answer: String::new(),
            citations: Vec::new(),
            usage: TokenUsage::default(),
            error: None,
            forced_final: false,
        }
    }

    fn fail(&mut self, kind: ErrorKind, message: &str) {
        tracing::warn!(kind = %kind, "Agent run failed: {}", message);
        self.state = RunState::Error;
        self.error = Some(kind);
        if self.answer.is_empty() {
            self.answer = APOLOGY.to_string();
        }
    }

    fn finish(&mut self, answer: String) {
        self.state = RunState::Finished;
        self.answer = answer;
    }
}

pub fn is_terminal_tool(name: &str) -> bool {
    TERMINAL_TOOLS.iter().any(|t| t.eq_ignore_ascii_case(name))
}

fn snippet_of(entry: &serde_json::Map<String, Value>) -> String {
    ["snippet", "content", "summary", "answer"]
        .iter()
        .find_map(|k| entry.get(*k).and_then(Value::as_str))
        .unwrap_or_default()
        .to_string()
}

fn source_citation(entry: &serde_json::Map<String, Value>) -> Option<Citation> {
    let title = entry
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if let Some(id) = entry.get("content_id").and_then(Value::as_i64) {
        return Some(Citation::new(CitationType::Video, id.to_string(), title, &snippet_of(entry)));
    }
    let url = entry.get("url").and_then(Value::as_str)?;
    let title = if title.is_empty() { url.to_string() } else { title };
    Some(Citation::new(CitationType::Web, url, title, &snippet_of(entry)).with_url(url))
}

/// Citations carried by a structured tool output.
pub fn citations_from_output(output: &Value) -> Vec<Citation> {
    let mut citations = Vec::new();
    let Some(obj) = output.as_object() else {
        return citations;
    };

    if let Some(Value::Array(items)) = obj.get("citations") {
        merge_citations(
            &mut citations,
            items
                .iter()
                .filter_map(|v| serde_json::from_value::<Citation>(v.clone()).ok()),
        );
    }

    if let Some(id) = obj.get("content_id").and_then(Value::as_i64)
        && let Some(title) = obj.get("title").and_then(Value::as_str)
    {
        merge_citations(
            &mut citations,
            [Citation::new(CitationType::Video, id.to_string(), title, &snippet_of(obj))],
        );
    }

    for key in ["sources", "results"] {
        if let Some(Value::Array(items)) = obj.get(key) {
            merge_citations(
                &mut citations,
                items.iter().filter_map(Value::as_object).filter_map(source_citation),
            );
        }
    }

    if let Some(Value::Array(items)) = obj.get("concepts") {
        merge_citations(
            &mut citations,
            items.iter().filter_map(Value::as_object).filter_map(|c| {
                let concept = c.get("concept").and_then(Value::as_str)?;
                let titles: Vec<&str> = c
                    .get("titles")
                    .and_then(Value::as_array)
                    .map(|t| t.iter().filter_map(Value::as_str).collect())
                    .unwrap_or_default();
                Some(Citation::new(CitationType::Concept, concept, concept, &titles.join(", ")))
            }),
        );
    }

    if let Some(Value::Array(items)) = obj.get("events") {
        merge_citations(
            &mut citations,
            items.iter().filter_map(Value::as_object).filter_map(|e| {
                let id = e.get("id").and_then(Value::as_i64)?;
                let title = e
                    .get("title")
                    .and_then(Value::as_str)
                    .or_else(|| e.get("event_type").and_then(Value::as_str))
                    .unwrap_or("event");
                Some(Citation::new(CitationType::Timeline, id.to_string(), title, title))
            }),
        );
    }

    citations
}

fn format_tools(tools: &[ToolSchema]) -> String {
    if tools.is_empty() {
        return "No tools are available. Answer directly.".to_string();
    }
    tools
        .iter()
        .map(|t| {
            let params: Vec<&str> = t
                .parameters
                .get("properties")
                .and_then(Value::as_object)
                .map(|p| p.keys().map(String::as_str).collect())
                .unwrap_or_default();
            let params = if params.is_empty() {
                "no parameters".to_string()
            } else {
                params.join(", ")
            };
            format!("- {}: {} (parameters: {})", t.name, t.description, params)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn terminal_answer(call: &ToolCall, thought: &str) -> String {
    ["answer", "final_answer", "message", "text", "output"]
        .iter()
        .find_map(|k| call.arguments.get(*k).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| thought.to_string())
}

pub struct ToolExecutor {
    router: Arc<ToolRouter>,
    llm: Arc<dyn LlmProvider>,
    prompts: Arc<PromptStore>,
    config: ExecutorConfig,
}

impl ToolExecutor {
    pub fn new(router: Arc<ToolRouter>, llm: Arc<dyn LlmProvider>, prompts: Arc<PromptStore>) -> Self {
        Self {
            router,
            llm,
            prompts,
            config: ExecutorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn execute(&self, req: &ExecutionRequest<'_>) -> ExecutionOutcome {
        let mut out = ExecutionOutcome::new();
        if req.plan.is_direct() {
            self.direct(req, &mut out).await;
        } else {
            self.react(req, &mut out).await;
        }
        out
    }

    fn base_system(&self, req: &ExecutionRequest<'_>) -> String {
        if req.context.retrieval_block.is_empty() {
            req.system_prompt.to_string()
        } else {
            format!("{}\n\n{}", req.system_prompt, req.context.retrieval_block)
        }
    }

    async fn call_llm(
        &self,
        messages: Vec<ChatMessage>,
        req: &ExecutionRequest<'_>,
        out: &mut ExecutionOutcome,
    ) -> Result<CompletionResponse, (ErrorKind, String)> {
        let cancel = &req.tool_ctx.cancel;
        if cancel.is_cancelled() {
            return Err((ErrorKind::Cancelled, "run cancelled".to_string()));
        }
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err((ErrorKind::Cancelled, "run cancelled".to_string())),
            r = self.llm.complete(CompletionRequest::new(messages)) => r,
        };
        match response {
            Ok(response) => {
                out.usage.add(response.usage);
                Ok(response)
            }
            Err(e) => Err((e.kind(), e.to_string())),
        }
    }

    async fn direct(&self, req: &ExecutionRequest<'_>, out: &mut ExecutionOutcome) {
        let start = Instant::now();
        let mut messages = vec![ChatMessage::system(self.base_system(req))];
        messages.extend(req.context.history.iter().cloned());
        messages.push(ChatMessage::user(req.context.query.clone()));

        let result = self.call_llm(messages, req, out).await;
        let mut step = AgentStep {
            index: 0,
            kind: StepKind::Thought,
            thought: "Answering directly".to_string(),
            tool_name: None,
            tool_args: None,
            observation: None,
            error: None,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        match result {
            Ok(response) => {
                out.steps.push(step);
                out.finish(response.content.trim().to_string());
            }
            Err((kind, message)) => {
                step.error = Some(message.clone());
                out.steps.push(step);
                out.fail(kind, &message);
            }
        }
    }

    async fn react(&self, req: &ExecutionRequest<'_>, out: &mut ExecutionOutcome) {
        let (tenant_id, user_id) = (Some(req.tool_ctx.tenant_id), req.tool_ctx.user_id);
        let react = match self
            .prompts
            .get(
                AGENT_REACT,
                tenant_id,
                user_id,
                &vars([("plan", req.plan.render().as_str()), ("tools", format_tools(req.tools).as_str())]),
            )
            .await
        {
            Ok(p) => p,
            Err(e) => return out.fail(e.kind(), &e.to_string()),
        };
        let next_step = match self.prompts.get(AGENT_NEXT_STEP, tenant_id, user_id, &HashMap::new()).await {
            Ok(p) => p,
            Err(e) => return out.fail(e.kind(), &e.to_string()),
        };
        let system = format!("{}\n\n{}", self.base_system(req), react);
        let mut observations: Vec<String> = Vec::new();

        for iteration in 0..self.config.max_steps {
            if req.tool_ctx.cancel.is_cancelled() {
                return out.fail(ErrorKind::Cancelled, "run cancelled");
            }
            let start = Instant::now();
            let mut messages = vec![ChatMessage::system(system.clone())];
            messages.extend(req.context.history.iter().cloned());
            let observed = if observations.is_empty() {
                NO_OBSERVATIONS.to_string()
            } else {
                observations.join("\n")
            };
            messages.push(ChatMessage::user(interpolate(
                &next_step,
                &vars([("query", req.context.query.as_str()), ("observations", observed.as_str())]),
            )));

            let response = match self.call_llm(messages, req, out).await {
                Ok(r) => r,
                Err((kind, message)) => {
                    out.steps.push(AgentStep {
                        index: out.steps.len(),
                        kind: StepKind::Thought,
                        thought: String::new(),
                        tool_name: None,
                        tool_args: None,
                        observation: None,
                        error: Some(message.clone()),
                        duration_ms: start.elapsed().as_millis() as u64,
                    });
                    return out.fail(kind, &message);
                }
            };

            match parse_reply(&response.content) {
                ParsedReply::FinalAnswer { thought, answer } => {
                    out.steps.push(AgentStep {
                        index: out.steps.len(),
                        kind: StepKind::FinalAnswer,
                        thought,
                        tool_name: None,
                        tool_args: None,
                        observation: None,
                        error: None,
                        duration_ms: start.elapsed().as_millis() as u64,
                    });
                    tracing::debug!(iteration, "Final answer received");
                    return out.finish(answer);
                }
                ParsedReply::ToolCalls { thought, calls } => {
                    if let Some(call) = calls.iter().find(|c| is_terminal_tool(&c.name)) {
                        let answer = terminal_answer(call, &thought);
                        out.steps.push(AgentStep {
                            index: out.steps.len(),
                            kind: StepKind::FinalAnswer,
                            thought,
                            tool_name: Some(call.name.clone()),
                            tool_args: Some(call.arguments.clone()),
                            observation: Some(answer.clone()),
                            error: None,
                            duration_ms: start.elapsed().as_millis() as u64,
                        });
                        tracing::debug!(tool = %call.name, "Terminal tool called");
                        return out.finish(answer);
                    }
                    self.run_calls(&thought, &calls, req, out, &mut observations).await;
                }
                ParsedReply::Invalid { reason } => {
                    let index = out.steps.len();
                    tracing::debug!(iteration, "Unparseable model reply: {}", reason);
                    out.steps.push(AgentStep {
                        index,
                        kind: StepKind::Thought,
                        thought: truncate_chars(response.content.trim(), 200),
                        tool_name: None,
                        tool_args: None,
                        observation: None,
                        error: Some(reason),
                        duration_ms: start.elapsed().as_millis() as u64,
                    });
                    observations.push(format!(
                        "[Step {}] The reply could not be parsed. Reply with a single JSON object.",
                        index + 1
                    ));
                }
            }
        }

        if req.tool_ctx.cancel.is_cancelled() {
            return out.fail(ErrorKind::Cancelled, "run cancelled");
        }
        tracing::info!(max_steps = self.config.max_steps, "Step bound reached, forcing a final answer");
        self.force_final(req, out, &observations).await;
    }

    async fn run_calls(
        &self,
        thought: &str,
        calls: &[ToolCall],
        req: &ExecutionRequest<'_>,
        out: &mut ExecutionOutcome,
        observations: &mut Vec<String>,
    ) {
        let results = join_all(calls.iter().map(|call| async move {
            let started_at = Utc::now();
            let result = self
                .router
                .execute_safe(&call.name, call.arguments.clone(), req.tool_ctx)
                .await;
            (started_at, Utc::now(), result)
        }))
        .await;

        for (call, (started_at, ended_at, result)) in calls.iter().zip(results) {
            let index = out.steps.len();
            let observation = truncate_chars(&result.observation(), self.config.max_observation);
            tracing::info!(
                tool = %call.name,
                success = result.success,
                duration_ms = result.duration_ms,
                "Tool call finished"
            );
            if let Some(output) = &result.output {
                merge_citations(&mut out.citations, citations_from_output(output));
            }
            out.traces.push(ToolTrace {
                tool_name: call.name.clone(),
                arguments: call.arguments.clone(),
                output: result.output.clone(),
                error: result.error.clone(),
                summary: result.summary.clone(),
                started_at,
                ended_at,
            });
            out.steps.push(AgentStep {
                index,
                kind: StepKind::Tool,
                thought: thought.to_string(),
                tool_name: Some(call.name.clone()),
                tool_args: Some(call.arguments.clone()),
                observation: Some(observation.clone()),
                error: result.error.clone(),
                duration_ms: result.duration_ms,
            });
            observations.push(format!("[Step {}] {}", index + 1, observation));
        }
    }

    async fn force_final(
        &self,
        req: &ExecutionRequest<'_>,
        out: &mut ExecutionOutcome,
        observations: &[String],
    ) {
        let observed = if observations.is_empty() {
            NO_OBSERVATIONS.to_string()
        } else {
            observations.join("\n")
        };
        let prompt = match self
            .prompts
            .get(
                AGENT_FINAL_ANSWER,
                Some(req.tool_ctx.tenant_id),
                req.tool_ctx.user_id,
                &vars([("query", req.context.query.as_str()), ("observations", observed.as_str())]),
            )
            .await
        {
            Ok(p) => p,
            Err(e) => return out.fail(e.kind(), &e.to_string()),
        };
        let messages = vec![ChatMessage::system(self.base_system(req)), ChatMessage::user(prompt)];
        match self.call_llm(messages, req, out).await {
            Ok(response) => {
                let answer = match parse_reply(&response.content) {
                    ParsedReply::FinalAnswer { answer, .. } => answer,
                    _ => response.content.trim().to_string(),
                };
                out.forced_final = true;
                out.finish(answer);
            }
            Err((kind, message)) => out.fail(kind, &message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::planner::TaskPlanner;
    use crate::llm::MockLlm;
    use crate::models::Scene;
    use crate::tools::builtin::{EchoTool, SleepTool};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::{BTreeMap, BTreeSet};

    fn router() -> Arc<ToolRouter> {
        let router = ToolRouter::new();
        router.register(Arc::new(EchoTool));
        router.register(Arc::new(SleepTool));
        Arc::new(router)
    }

    async fn plan(steps: usize) -> Plan {
        let reply = json!({"title": "t", "steps": (0..steps).map(|i| format!("s{}", i)).collect::<Vec<_>>()});
        let llm = MockLlm::new().with_script([reply.to_string()]);
        let (plan, _) = TaskPlanner::new()
            .plan("a long enough question", &[], &llm, &PromptStore::new(BTreeMap::new()), None, None)
            .await;
        plan
    }

    fn ctx() -> ToolContext {
        ToolContext::new(1, Scene::Console).with_allowed(BTreeSet::from(["echo".to_string(), "sleep".to_string()]))
    }

    fn executor(llm: MockLlm, max_steps: usize) -> ToolExecutor {
        ToolExecutor::new(router(), Arc::new(llm), Arc::new(PromptStore::new(BTreeMap::new()))).with_config(
            ExecutorConfig {
                max_steps,
                max_observation: 50,
            },
        )
    }

    fn context(query: &str) -> AssembledContext {
        AssembledContext {
            query: query.to_string(),
            ..AssembledContext::default()
        }
    }

    #[tokio::test]
    async fn test_tool_then_answer() {
        let llm = MockLlm::new().with_script([
            r#"{"thought": "echo it", "action": "echo", "action_input": {"message": "hi"}}"#,
            r#"{"thought": "done", "final_answer": "It said hi."}"#,
        ]);
        let plan = plan(2).await;
        let ctx = ctx();
        let context = context("repeat hi back to me");
        let out = executor(llm, 10)
            .execute(&ExecutionRequest {
                plan: &plan,
                system_prompt: "You are Alice.",
                context: &context,
                tools: &[],
                tool_ctx: &ctx,
            })
            .await;

        assert_eq!(out.state, RunState::Finished);
        assert_eq!(out.answer, "It said hi.");
        assert_eq!(out.steps.len(), 2);
        assert_eq!(out.steps[0].kind, StepKind::Tool);
        assert_eq!(out.steps[1].index, 1);
        assert_eq!(out.traces.len(), 1);
        assert!(out.usage.total() > 0);
    }

    #[tokio::test]
    async fn test_step_bound_forces_answer_and_truncates() {
        let long = "x".repeat(500);
        let call = json!({"thought": "again", "action": "echo", "action_input": {"message": long}}).to_string();
        let llm = MockLlm::new()
            .with_script([call.clone(), call.clone(), call])
            .with_default_reply("Here is what I found.");
        let plan = plan(4).await;
        let ctx = ctx();
        let context = context("keep echoing forever");
        let out = executor(llm, 3)
            .execute(&ExecutionRequest {
                plan: &plan,
                system_prompt: "",
                context: &context,
                tools: &[],
                tool_ctx: &ctx,
            })
            .await;

        assert_eq!(out.steps.len(), 3);
        assert!(out.forced_final);
        assert_eq!(out.answer, "Here is what I found.");
        let observation = out.steps[0].observation.as_deref().unwrap();
        assert_eq!(observation.chars().count(), 50);
        assert!(observation.ends_with("..."));
    }

    #[tokio::test]
    async fn test_parallel_calls_and_terminal_tool() {
        let llm = MockLlm::new().with_script([
            r#"{"thought": "both", "actions": [{"action": "echo", "action_input": {"message": "a"}}, {"action": "echo", "action_input": {"message": "b"}}]}"#,
            r#"{"thought": "wrap up", "action": "finish", "action_input": {"answer": "a and b"}}"#,
        ]);
        let plan = plan(2).await;
        let ctx = ctx();
        let context = context("echo two things at once");
        let out = executor(llm, 10)
            .execute(&ExecutionRequest {
                plan: &plan,
                system_prompt: "",
                context: &context,
                tools: &[],
                tool_ctx: &ctx,
            })
            .await;

        let indices: Vec<usize> = out.steps.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(out.traces.len(), 2);
        assert_eq!(out.answer, "a and b");
        assert_eq!(out.steps[2].kind, StepKind::FinalAnswer);
        assert_eq!(out.steps[2].tool_name.as_deref(), Some("finish"));
        for step in out.steps.iter().filter(|s| s.tool_name.is_some()) {
            assert!(
                step.observation.is_some() || step.error.is_some(),
                "step {} names a tool but has neither observation nor error",
                step.index
            );
        }
    }

    #[tokio::test]
    async fn test_hidden_tool_becomes_error_observation() {
        let llm = MockLlm::new().with_script([
            r#"{"thought": "try", "action": "shell", "action_input": {"command": "ls"}}"#,
            r#"{"thought": "ok", "final_answer": "Cannot do that."}"#,
        ]);
        let plan = plan(2).await;
        let ctx = ctx();
        let context = context("list the files please");
        let out = executor(llm, 10)
            .execute(&ExecutionRequest {
                plan: &plan,
                system_prompt: "",
                context: &context,
                tools: &[],
                tool_ctx: &ctx,
            })
            .await;
        assert!(out.steps[0].error.is_some());
        assert_eq!(out.state, RunState::Finished);
    }

    #[test]
    fn test_citations_from_outputs() {
        let search = json!({"results": [{"content_id": 7, "title": "Talk", "snippet": "s"}]});
        assert_eq!(citations_from_output(&search)[0].kind, CitationType::Video);

        let web = json!({"sources": [{"url": "https://example.com/a", "title": "A", "snippet": "x"}]});
        let cites = citations_from_output(&web);
        assert_eq!(cites[0].kind, CitationType::Web);
        assert_eq!(cites[0].url.as_deref(), Some("https://example.com/a"));

        let summary = json!({"content_id": 3, "title": "Lecture", "summary": "About tokio", "concepts": ["tokio"]});
        let cites = citations_from_output(&summary);
        assert_eq!(cites.len(), 1);
        assert_eq!(cites[0].content_id(), Some(3));

        assert!(citations_from_output(&json!("plain text")).is_empty());
    }
}
