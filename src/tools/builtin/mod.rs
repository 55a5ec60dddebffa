//! Built-in tools that come with the agent.
//!
//! Tools are keyed by `builtin.<name>`, the symbolic `impl` key used in
//! `tools.yaml`.

mod basic;
mod content;
mod http;
mod knowledge;
mod research;
mod shell;
mod timeline;

pub use basic::{CurrentTimeTool, EchoTool, SleepTool};
pub use content::SubmitContentTool;
pub use http::HttpRequestTool;
pub use knowledge::{AskVideoTool, SearchGraphTool, SearchVideosTool, VideoSummaryTool};
pub use research::{DeepWebResearchTool, GenerateReportTool};
pub use shell::ShellTool;
pub use timeline::{TimelineQueryTool, TimelineSummaryTool};

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::context::TimelineService;
use crate::db::Database;
use crate::llm::LlmProvider;
use crate::pipeline::ProcessingQueue;
use crate::retrieval::{ConceptIndex, RetrievalService};
use crate::search::ResearchService;
use crate::tools::registry::ToolRouter;
use crate::tools::tool::Tool;

pub const IMPL_PREFIX: &str = "builtin.";

/// Services the built-in tools are constructed from.
#[derive(Clone)]
pub struct BuiltinDeps {
    pub db: Arc<dyn Database>,
    pub retrieval: Arc<dyn RetrievalService>,
    pub timeline: Arc<TimelineService>,
    pub llm: Arc<dyn LlmProvider>,
    /// Without a research service `deep_web_research` is not offered.
    pub research: Option<Arc<ResearchService>>,
    pub queue: Option<Arc<ProcessingQueue>>,
    pub report_prompt: Option<String>,
}

/// Every built-in tool, keyed by its `impl` key.
pub fn builtin_catalog(deps: &BuiltinDeps) -> BTreeMap<String, Arc<dyn Tool>> {
    let concepts = Arc::new(ConceptIndex::new(Arc::clone(&deps.db)));

    let mut report = GenerateReportTool::new(Arc::clone(&deps.llm));
    if let Some(prompt) = &deps.report_prompt {
        report = report.with_prompt(prompt.clone());
    }
    let mut submit = SubmitContentTool::new(Arc::clone(&deps.db));
    if let Some(queue) = &deps.queue {
        submit = submit.with_queue(Arc::clone(queue));
    }

    let mut tools: Vec<Arc<dyn Tool>> = vec![
        Arc::new(CurrentTimeTool),
        Arc::new(EchoTool),
        Arc::new(SleepTool),
        Arc::new(AskVideoTool::new(Arc::clone(&deps.retrieval))),
        Arc::new(SearchVideosTool::new(Arc::clone(&deps.retrieval))),
        Arc::new(VideoSummaryTool::new(Arc::clone(&deps.db))),
        Arc::new(SearchGraphTool::new(concepts)),
        Arc::new(TimelineQueryTool::new(Arc::clone(&deps.timeline))),
        Arc::new(TimelineSummaryTool::new(Arc::clone(&deps.timeline))),
        Arc::new(report),
        Arc::new(HttpRequestTool::new()),
        Arc::new(submit),
        Arc::new(ShellTool::new()),
    ];
    if let Some(research) = &deps.research {
        tools.push(Arc::new(DeepWebResearchTool::new(Arc::clone(research))));
    }

    tools
        .into_iter()
        .map(|tool| (format!("{}{}", IMPL_PREFIX, tool.name()), tool))
        .collect()
}

/// Register every built-in tool. Returns the registered names.
pub fn register_builtin_tools(router: &ToolRouter, deps: &BuiltinDeps) -> Vec<String> {
    let mut names = Vec::new();
    for tool in builtin_catalog(deps).into_values() {
        names.push(tool.name().to_string());
        router.register(tool);
    }
    tracing::debug!(count = names.len(), "Registered built-in tools");
    names
}
