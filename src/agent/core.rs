//! Agent entry point: strategy, identity, context, tools, plan, execute,
//! record.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::executor::{APOLOGY, ExecutionOutcome, ExecutionRequest, ExecutorConfig, ToolExecutor};
use super::planner::{Plan, TaskPlanner};
use super::strategy::{self, Strategy};
use super::types::{
    AgentResult, AgentRun, AgentStep, AgentTask, RunState, SafetyLevel, StepKind, merge_citations,
    truncate_chars,
};
use crate::config::AgentSettings;
use crate::context::{AssembledContext, ContextAssembler, IdentityService, TimelineService};
use crate::control_plane::ControlPlane;
use crate::db::Database;
use crate::error::{AgentError, ErrorKind};
use crate::llm::TokenUsage;
use crate::models::{EventType, NewTimelineEvent, UserRole};
use crate::tools::{ToolCategory, ToolContext, ToolPolicy};

/// Longest query accepted, in characters.
const MAX_QUERY_CHARS: usize = 8_000;

/// Caller-side settings for one run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub role: UserRole,
    pub policy: ToolPolicy,
    pub cancel: Option<CancellationToken>,
}

impl RunOptions {
    pub fn with_role(mut self, role: UserRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_policy(mut self, policy: ToolPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

pub struct AgentCore {
    plane: Arc<ControlPlane>,
    db: Arc<dyn Database>,
    assembler: Arc<ContextAssembler>,
    identity: Arc<IdentityService>,
    timeline: Arc<TimelineService>,
    planner: TaskPlanner,
    settings: AgentSettings,
}

impl AgentCore {
    pub fn new(
        plane: Arc<ControlPlane>,
        db: Arc<dyn Database>,
        assembler: Arc<ContextAssembler>,
        timeline: Arc<TimelineService>,
    ) -> Self {
        let identity = Arc::new(IdentityService::new(Arc::clone(&db), Arc::clone(plane.prompts())));
        Self {
            plane,
            db,
            assembler,
            identity,
            timeline,
            planner: TaskPlanner::new(),
            settings: AgentSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: AgentSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn planner(&self) -> &TaskPlanner {
        &self.planner
    }

    /// Tools a run may use: scene defaults ∩ strategy ∩ tenant identity,
    /// then the caller's scene/role policy.
    pub fn visible_tools(
        &self,
        strategy: &Strategy,
        identity_tools: &BTreeSet<String>,
        task: &AgentTask,
        options: &RunOptions,
    ) -> BTreeSet<String> {
        let catalog = self.plane.tools();
        let router = catalog.router();
        catalog
            .scene_tools(task.scene)
            .into_iter()
            .filter(|name| strategy.allows(name) && identity_tools.contains(name))
            .filter(|name| router.is_visible_with(&options.policy, name, task.scene, options.role))
            .collect()
    }

    /// Run with default options.
    pub async fn run(&self, task: AgentTask) -> Result<AgentResult, AgentError> {
        self.run_task(task, RunOptions::default()).await
    }

    /// Execute a task end to end.
    ///
    /// Invalid input is an error; everything after validation is reported
    /// in the result's `error_code`.
    pub async fn run_task(
        &self,
        task: AgentTask,
        options: RunOptions,
    ) -> Result<AgentResult, AgentError> {
        if task.query.trim().is_empty() {
            return Err(AgentError::Validation("query must not be empty".into()));
        }
        if task.query.chars().count() > MAX_QUERY_CHARS {
            return Err(AgentError::Validation(format!(
                "query longer than {} characters",
                MAX_QUERY_CHARS
            )));
        }
        if task.tenant_id <= 0 {
            return Err(AgentError::Validation(format!(
                "tenant id must be positive, got {}",
                task.tenant_id
            )));
        }

        let run_id = Uuid::new_v4();
        let strategy = strategy::select(task.scene);
        let span = tracing::info_span!(
            "agent_run",
            %run_id,
            tenant_id = task.tenant_id,
            scene = %task.scene.as_str(),
            strategy = strategy.name
        );
        Ok(self
            .execute_run(task, options, strategy, run_id)
            .instrument(span)
            .await)
    }

    async fn execute_run(
        &self,
        task: AgentTask,
        options: RunOptions,
        strategy: Strategy,
        run_id: Uuid,
    ) -> AgentResult {
        let start = Instant::now();

        let cancel = options.cancel.clone().unwrap_or_default().child_token();
        let timed_out = Arc::new(AtomicBool::new(false));
        let timer = {
            let cancel = cancel.clone();
            let timed_out = Arc::clone(&timed_out);
            let limit = Duration::from_secs(self.settings.task_timeout_secs.max(1));
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                timed_out.store(true, Ordering::SeqCst);
                cancel.cancel();
            })
        };

        let mut run = AgentRun {
            id: run_id,
            tenant_id: task.tenant_id,
            user_id: task.user_id,
            scene: task.scene,
            task: task.clone(),
            strategy: strategy.name.to_string(),
            plan_json: None,
            steps: Vec::new(),
            tool_traces: Vec::new(),
            answer: String::new(),
            citations: Vec::new(),
            safety_level: SafetyLevel::Normal,
            error_code: None,
            total_duration_ms: 0,
            token_usage: TokenUsage::default(),
            created_at: Utc::now(),
        };

        self.drive(&task, &options, &strategy, cancel, run_id, &mut run).await;
        timer.abort();

        if timed_out.load(Ordering::SeqCst) && run.error_code == Some(ErrorKind::Cancelled) {
            tracing::warn!(timeout_secs = self.settings.task_timeout_secs, "Agent run timed out");
        }
        run.total_duration_ms = start.elapsed().as_millis() as u64;
        self.record(&task, &run).await;

        tracing::info!(
            steps = run.steps.len(),
            duration_ms = run.total_duration_ms,
            error_code = run.error_code.map(|k| k.as_str()).unwrap_or("none"),
            "Agent run finished"
        );
        AgentResult::from(&run)
    }

    async fn drive(
        &self,
        task: &AgentTask,
        options: &RunOptions,
        strategy: &Strategy,
        cancel: CancellationToken,
        run_id: Uuid,
        run: &mut AgentRun,
    ) {
        let tenant = Some(task.tenant_id);

        let identity = match self
            .identity
            .get_identity(task.tenant_id, task.user_id, task.scene)
            .await
        {
            Ok(identity) => identity,
            Err(e) => return fail(run, e.kind(), &e.to_string()),
        };

        let context: AssembledContext = self.assembler.assemble(task).await;
        merge_citations(&mut run.citations, context.citations.iter().cloned());

        let visible = self.visible_tools(strategy, &identity.allowed_tools, task, options);
        let router = self.plane.tools().router();
        if visible
            .iter()
            .any(|name| router.category_of(name) == Some(ToolCategory::Unsafe))
        {
            run.safety_level = SafetyLevel::Elevated;
        }
        let schemas = router.tool_schemas(Some(&visible));
        tracing::debug!(tools = ?visible, "Visible tools resolved");

        let planner_llm = match self.plane.llm_for_task("planner", tenant, task.user_id).await {
            Ok(llm) => llm,
            Err(e) => return fail(run, e.kind(), &e.to_string()),
        };
        let (plan, plan_usage): (Plan, TokenUsage) = self
            .planner
            .plan(
                &task.query,
                &schemas,
                planner_llm.as_ref(),
                self.plane.prompts(),
                tenant,
                task.user_id,
            )
            .await;
        run.token_usage.add(plan_usage);
        run.plan_json = Some(plan.to_json());

        let chat_llm = match self.plane.llm_for_task("chat", tenant, task.user_id).await {
            Ok(llm) => llm,
            Err(e) => return fail(run, e.kind(), &e.to_string()),
        };
        let executor = ToolExecutor::new(Arc::clone(router), chat_llm, Arc::clone(self.plane.prompts()))
            .with_config(ExecutorConfig::from_settings(&self.settings));

        let mut tool_ctx = ToolContext::new(task.tenant_id, task.scene)
            .with_role(options.role)
            .with_run(run_id)
            .with_cancel(cancel)
            .with_allowed(visible);
        tool_ctx.user_id = task.user_id;

        let system_prompt = format!("{}\n\n{}", identity.system_prompt, strategy.system_prompt_suffix);
        let outcome: ExecutionOutcome = executor
            .execute(&ExecutionRequest {
                plan: &plan,
                system_prompt: &system_prompt,
                context: &context,
                tools: &schemas,
                tool_ctx: &tool_ctx,
            })
            .await;

        run.steps = outcome.steps;
        run.tool_traces = outcome.traces;
        run.answer = outcome.answer;
        run.token_usage.add(outcome.usage);
        merge_citations(&mut run.citations, outcome.citations);
        if outcome.state == RunState::Error {
            run.error_code = Some(outcome.error.unwrap_or(ErrorKind::Internal));
        }
    }

    /// Persist the run, its timeline event and the conversation turn.
    /// Failures are logged and swallowed.
    async fn record(&self, task: &AgentTask, run: &AgentRun) {
        if let Err(e) = self.db.save_agent_run(run).await {
            tracing::warn!(run_id = %run.id, kind = %e.kind(), component = "agent", "Failed to save agent run: {}", e);
        }

        let event = NewTimelineEvent {
            tenant_id: run.tenant_id,
            user_id: run.user_id,
            event_type: EventType::AgentRun,
            scene: run.scene,
            content_id: task.content_id,
            conversation_id: task.conversation_id,
            title: Some(truncate_chars(task.query.trim(), 50)),
            context: serde_json::json!({
                "run_id": run.id.to_string(),
                "duration_ms": run.total_duration_ms,
                "strategy": run.strategy,
                "error_code": run.error_code,
            }),
        };
        if let Err(e) = self.timeline.append_event(&event).await {
            tracing::warn!(run_id = %run.id, kind = %e.kind(), component = "agent", "Failed to append timeline event: {}", e);
        }

        if let Some(conversation_id) = task.conversation_id {
            for (role, content) in [("user", task.query.as_str()), ("assistant", run.answer.as_str())] {
                if let Err(e) = self
                    .db
                    .append_conversation_message(conversation_id, role, content)
                    .await
                {
                    tracing::warn!(conversation_id, kind = %e.kind(), "Failed to store conversation turn: {}", e);
                    break;
                }
            }
        }
    }
}

fn fail(run: &mut AgentRun, kind: ErrorKind, message: &str) {
    tracing::warn!(kind = %kind, component = "agent", "Agent run aborted: {}", message);
    run.steps.push(AgentStep {
        index: run.steps.len(),
        kind: StepKind::Thought,
        thought: String::new(),
        tool_name: None,
        tool_args: None,
        observation: None,
        error: Some(message.to_string()),
        duration_ms: 0,
    });
    run.error_code = Some(kind);
    run.answer = APOLOGY.to_string();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::CitationType;
    use crate::config::{ModelsConfig, ServicesConfig, ToolsConfig};
    use crate::control_plane::{Credentials, ModelResolver, PromptStore, ServiceRegistry, StaticLlmFactory, ToolCatalog};
    use crate::db::InMemoryDatabase;
    use crate::llm::MockLlm;
    use crate::models::Scene;
    use crate::retrieval::{InMemoryVectorIndex, MockEmbeddings, VectorRetrieval};
    use crate::tools::builtin::{BuiltinDeps, builtin_catalog};
    use crate::tools::ToolRouter;
    use crate::search::{MockSearch, ResearchService};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn core(llm: MockLlm) -> (AgentCore, Arc<InMemoryDatabase>) {
        let db = Arc::new(InMemoryDatabase::new());
        let llm: Arc<MockLlm> = Arc::new(llm);
        let retrieval = Arc::new(VectorRetrieval::new(
            Arc::new(InMemoryVectorIndex::new()),
            Arc::new(MockEmbeddings::new(32)),
        ));
        let timeline = Arc::new(TimelineService::new(db.clone()));
        let deps = BuiltinDeps {
            db: db.clone(),
            retrieval: retrieval.clone(),
            timeline: timeline.clone(),
            llm: llm.clone(),
            research: Some(Arc::new(ResearchService::new(Arc::new(MockSearch)))),
            queue: None,
            report_prompt: None,
        };
        let models: ModelsConfig = serde_yaml::from_str(
            "profiles:\n  alice.chat.main: {kind: chat, provider: openai, model: gpt-4o-mini}\n",
        )
        .unwrap();
        let plane = Arc::new(ControlPlane::new(
            ModelResolver::new(models, Credentials::default()),
            PromptStore::new(BTreeMap::new()),
            ToolCatalog::new(Arc::new(ToolRouter::new()), ToolsConfig::default(), builtin_catalog(&deps)),
            ServiceRegistry::new(ServicesConfig::default()),
            Arc::new(StaticLlmFactory::new(llm)),
        ));
        let assembler = Arc::new(ContextAssembler::new(db.clone(), retrieval, timeline.clone()));
        (AgentCore::new(plane, db.clone(), assembler, timeline), db)
    }

    #[tokio::test]
    async fn test_empty_and_blank_queries_rejected() {
        let (core, _) = core(MockLlm::new());
        for query in ["", "            "] {
            let err = core.run(AgentTask::new(1, Scene::Chat, query)).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);
        }
    }

    #[tokio::test]
    async fn test_greeting_is_recorded() {
        let (core, db) = core(MockLlm::new().with_default_reply("Hi there!"));
        let result = core.run(AgentTask::new(1, Scene::Chat, "hello")).await.unwrap();
        assert_eq!(result.answer, "Hi there!");
        assert_eq!(result.error_code, None);

        let saved = db.get_agent_run(result.run_id).await.unwrap().unwrap();
        assert_eq!(saved.steps.len(), 1);
        let events = db
            .list_timeline_events(&crate::models::TimelineFilter::for_tenant(1))
            .await
            .unwrap();
        assert_eq!(events[0].event_type, EventType::AgentRun);
        assert_eq!(events[0].context["run_id"], result.run_id.to_string());
    }

    #[tokio::test]
    async fn test_visible_set_intersects_strategy_identity_policy() {
        let (core, _) = core(MockLlm::new());
        let task = AgentTask::new(1, Scene::Research, "anything at all");
        let identity: BTreeSet<String> = ["deep_web_research", "ask_video", "echo"]
            .into_iter()
            .map(String::from)
            .collect();
        let visible = core.visible_tools(&strategy::RESEARCH, &identity, &task, &RunOptions::default());
        assert_eq!(
            visible.into_iter().collect::<Vec<_>>(),
            vec!["ask_video", "deep_web_research", "echo"]
        );

        let guest = RunOptions::default().with_role(UserRole::Guest);
        let visible = core.visible_tools(&strategy::RESEARCH, &identity, &task, &guest);
        assert!(!visible.contains("deep_web_research"));
    }

    #[tokio::test]
    async fn test_research_cites_web_sources() {
        let llm = MockLlm::new().with_script([
            r#"{"title": "Research", "steps": ["search the web", "summarise"]}"#,
            r#"{"thought": "need fresh info", "action": "deep_web_research", "action_input": {"query": "latest on rust"}}"#,
            r#"{"thought": "enough", "final_answer": "Rust keeps improving."}"#,
        ]);
        let (core, _) = core(llm);
        let result = core
            .run(AgentTask::new(1, Scene::Research, "what is the latest on rust"))
            .await
            .unwrap();
        assert!(result.plan_json.unwrap()["steps"].as_array().unwrap().len() >= 2);
        assert!(result.steps.iter().any(|s| s.tool_name.as_deref() == Some("deep_web_research")));
        assert!(result.citations.iter().any(|c| c.kind == CitationType::Web));
        assert_eq!(result.error_code, None);
    }
}
