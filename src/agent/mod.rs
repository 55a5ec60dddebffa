//! The agent.
//!
//! A task runs through:
//! - Strategy selection by scene
//! - Identity and persona resolution for the tenant
//! - Context assembly from history, retrieval, concepts and the timeline
//! - Planning, then a bounded ReAct loop over the visible tools
//! - Persistence of the run and a timeline event

mod core;
pub mod executor;
pub mod parser;
pub mod planner;
pub mod strategy;
mod types;

pub use core::{AgentCore, RunOptions};
pub use executor::{ExecutionOutcome, ExecutionRequest, ExecutorConfig, ToolExecutor};
pub use parser::{ParsedReply, ToolCall, parse_reply};
pub use planner::{Plan, PlanStepState, TaskPlanner};
pub use strategy::Strategy;
pub use types::{
    AgentResult, AgentRun, AgentStep, AgentTask, Citation, CitationType, MAX_SNIPPET_CHARS,
    RunState, SafetyLevel, StepKind, ToolTrace, merge_citations, truncate_chars,
};
