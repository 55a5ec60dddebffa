//! Task planning: a short list of free-form steps guiding the ReAct loop.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{LazyLock, Mutex, PoisonError};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::control_plane::{AGENT_PLANNER_SYSTEM, AGENT_PLANNER_USER, PromptStore};
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, TokenUsage};
use crate::tools::ToolSchema;

/// Step label of the single-step plan that skips the ReAct loop.
pub const DIRECT_ANSWER: &str = "direct_answer";

/// Plans never exceed this many steps.
pub const MAX_PLAN_STEPS: usize = 10;

/// Queries shorter than this (in characters) take the fast path.
pub const FAST_PATH_CHARS: usize = 10;

const DEFAULT_STEPS: [&str; 3] = ["analyze", "execute", "verify"];

static GREETING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(hi|hello|hey|thanks|thank you|ok|okay|good (morning|afternoon|evening)|你好|谢谢|好的|嗯)\b[\s!.,?！。]*$")
        .expect("valid regex")
});

static JSON_OBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("valid regex"));

static JSON_ARRAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\[.*\]").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStepState {
    NotStarted,
    InProgress,
    Done,
    Skipped,
}

impl PlanStepState {
    fn mark(&self) -> &'static str {
        match self {
            Self::NotStarted => "[ ]",
            Self::InProgress => "[→]",
            Self::Done => "[✓]",
            Self::Skipped => "[-]",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: u64,
    pub title: String,
    pub steps: Vec<String>,
    pub states: Vec<PlanStepState>,
}

impl Plan {
    fn new(id: u64, title: impl Into<String>, steps: Vec<String>) -> Self {
        let states = vec![PlanStepState::NotStarted; steps.len()];
        Self {
            id,
            title: title.into(),
            steps,
            states,
        }
    }

    pub fn is_direct(&self) -> bool {
        self.steps.len() == 1 && self.steps[0] == DIRECT_ANSWER
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "title": self.title, "steps": self.steps })
    }

    /// Checklist rendering used in the ReAct framing prompt.
    pub fn render(&self) -> String {
        let mut lines = vec![format!("# {}", self.title)];
        for (i, step) in self.steps.iter().enumerate() {
            let state = self.states.get(i).copied().unwrap_or(PlanStepState::NotStarted);
            lines.push(format!("{} {}. {}", state.mark(), i + 1, step));
        }
        lines.join("\n")
    }
}

#[derive(Deserialize)]
struct PlanReply {
    #[serde(default)]
    title: Option<String>,
    steps: Vec<String>,
}

/// Whether `query` is short or a greeting and needs no planning.
pub fn is_simple_query(query: &str) -> bool {
    query.trim().chars().count() < FAST_PATH_CHARS || GREETING.is_match(query)
}

/// Parse a planner reply: a `{title, steps}` object, else a bare array of
/// steps. `None` when neither shape is present.
pub fn parse_plan_reply(reply: &str) -> Option<(Option<String>, Vec<String>)> {
    if let Some(m) = JSON_OBJECT.find(reply)
        && let Ok(parsed) = serde_json::from_str::<PlanReply>(m.as_str())
    {
        return Some((parsed.title, parsed.steps));
    }
    if let Some(m) = JSON_ARRAY.find(reply)
        && let Ok(steps) = serde_json::from_str::<Vec<String>>(m.as_str())
    {
        return Some((None, steps));
    }
    None
}

fn format_tools(tools: &[ToolSchema]) -> String {
    if tools.is_empty() {
        return "No tools are available; answer directly.".to_string();
    }
    tools
        .iter()
        .map(|t| format!("- {}: {}", t.name, t.description))
        .collect::<Vec<_>>()
        .join("\n")
}

fn short_title(query: &str) -> String {
    format!("Plan for: {}", crate::agent::truncate_chars(query.trim(), 50))
}

/// Produces plans and keeps every plan it produced, keyed by id.
#[derive(Default)]
pub struct TaskPlanner {
    next_id: AtomicU64,
    plans: Mutex<BTreeMap<u64, Plan>>,
}

impl TaskPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self, title: impl Into<String>, steps: Vec<String>) -> Plan {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let plan = Plan::new(id, title, steps);
        self.plans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, plan.clone());
        plan
    }

    /// Plan a query. Token usage of the planning call is returned alongside.
    pub async fn plan(
        &self,
        query: &str,
        tools: &[ToolSchema],
        llm: &dyn LlmProvider,
        prompts: &PromptStore,
        tenant_id: Option<i64>,
        user_id: Option<i64>,
    ) -> (Plan, TokenUsage) {
        if is_simple_query(query) {
            tracing::debug!("Simple query, using direct answer plan");
            return (self.store("Direct answer", vec![DIRECT_ANSWER.to_string()]), TokenUsage::default());
        }

        let mut usage = TokenUsage::default();
        let outcome = async {
            let system = prompts
                .get(AGENT_PLANNER_SYSTEM, tenant_id, user_id, &Default::default())
                .await
                .map_err(|e| e.to_string())?;
            let vars = crate::control_plane::vars([
                ("tools_description", format_tools(tools).as_str()),
                ("query", query),
            ]);
            let user = prompts
                .get(AGENT_PLANNER_USER, tenant_id, user_id, &vars)
                .await
                .map_err(|e| e.to_string())?;
            let response = llm
                .complete(
                    CompletionRequest::new(vec![ChatMessage::system(system), ChatMessage::user(user)])
                        .with_temperature(0.2),
                )
                .await
                .map_err(|e| e.to_string())?;
            usage.add(response.usage);
            parse_plan_reply(&response.content).ok_or_else(|| "planner reply has no plan".to_string())
        }
        .await;

        let plan = match outcome {
            Ok((title, steps)) => {
                let mut steps: Vec<String> = steps
                    .into_iter()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                steps.truncate(MAX_PLAN_STEPS);
                if steps.is_empty() {
                    self.store("Direct answer", vec![DIRECT_ANSWER.to_string()])
                } else {
                    self.store(title.unwrap_or_else(|| short_title(query)), steps)
                }
            }
            Err(reason) => {
                tracing::warn!("Planning failed, using default plan: {}", reason);
                self.store(
                    short_title(query),
                    DEFAULT_STEPS.iter().map(|s| s.to_string()).collect(),
                )
            }
        };
        tracing::info!(plan_id = plan.id, steps = plan.steps.len(), title = %plan.title, "Plan created");
        (plan, usage)
    }

    pub fn get(&self, id: u64) -> Option<Plan> {
        self.plans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Record progress on a step. Unknown plans or steps are ignored.
    pub fn mark_step(&self, id: u64, step: usize, state: PlanStepState) {
        if let Some(plan) = self
            .plans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&id)
            && let Some(slot) = plan.states.get_mut(step)
        {
            *slot = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;
    use pretty_assertions::assert_eq;

    fn prompts() -> PromptStore {
        PromptStore::new(BTreeMap::new())
    }

    #[test]
    fn test_fast_path_detection() {
        assert!(is_simple_query("hello"));
        assert!(is_simple_query("Thanks!"));
        assert!(is_simple_query("good morning"));
        assert!(!is_simple_query("what is the latest on rust async"));
    }

    #[test]
    fn test_parse_plan_reply_shapes() {
        let (title, steps) =
            parse_plan_reply("Sure:\n{\"title\": \"T\", \"steps\": [\"a\", \"b\"]}").unwrap();
        assert_eq!(title.as_deref(), Some("T"));
        assert_eq!(steps, vec!["a", "b"]);

        let (title, steps) = parse_plan_reply("[\"x\", \"y\"]").unwrap();
        assert_eq!(title, None);
        assert_eq!(steps, vec!["x", "y"]);

        assert!(parse_plan_reply("no plan here").is_none());
    }

    #[tokio::test]
    async fn test_greeting_skips_llm() {
        let planner = TaskPlanner::new();
        let llm = MockLlm::new();
        let (plan, _) = planner.plan("hello", &[], &llm, &prompts(), None, None).await;
        assert!(plan.is_direct());
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_llm_plan_bounded_and_cached() {
        let steps: Vec<String> = (0..15).map(|i| format!("step {}", i)).collect();
        let reply = serde_json::json!({"title": "Long", "steps": steps}).to_string();
        let llm = MockLlm::new().with_script([reply]);
        let planner = TaskPlanner::new();
        let (plan, usage) = planner
            .plan("research the latest async runtimes", &[], &llm, &prompts(), None, None)
            .await;
        assert_eq!(plan.steps.len(), MAX_PLAN_STEPS);
        assert!(usage.total() > 0);

        planner.mark_step(plan.id, 0, PlanStepState::Done);
        planner.mark_step(plan.id, 1, PlanStepState::Skipped);
        let stored = planner.get(plan.id).unwrap();
        assert_eq!(stored.states[0], PlanStepState::Done);
        assert!(stored.render().contains("[✓] 1. step 0"));
        assert!(stored.render().contains("[-] 2. step 1"));
    }

    #[test]
    fn test_step_state_names() {
        let states = [
            PlanStepState::NotStarted,
            PlanStepState::InProgress,
            PlanStepState::Done,
            PlanStepState::Skipped,
        ];
        let json = serde_json::to_value(states).unwrap();
        assert_eq!(json, serde_json::json!(["not_started", "in_progress", "done", "skipped"]));
        let back: Vec<PlanStepState> = serde_json::from_value(json).unwrap();
        assert_eq!(back, states);
    }

    #[tokio::test]
    async fn test_unparseable_reply_uses_default_plan() {
        let llm = MockLlm::new().with_script(["I would rather chat."]);
        let planner = TaskPlanner::new();
        let (plan, _) = planner
            .plan("compare these two lectures please", &[], &llm, &prompts(), None, None)
            .await;
        assert_eq!(plan.steps, vec!["analyze", "execute", "verify"]);
        assert!(plan.title.starts_with("Plan for:"));
    }
}
