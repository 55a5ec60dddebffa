//! End-to-end agent runs over the in-memory stack.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use alice::ErrorKind;
use alice::agent::{AgentTask, CitationType, RunOptions, StepKind};
use alice::config::AgentSettings;
use alice::db::Database;
use alice::llm::MockLlm;
use alice::models::{EventType, Scene, TimelineFilter};
use alice::tools::ToolContext;
use common::Harness;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_util::sync::CancellationToken;

const PLAN: &str = r#"{"title": "Look it up", "steps": ["gather information", "answer"]}"#;

#[tokio::test]
async fn greeting_skips_planning() {
    let h = Harness::new(MockLlm::new().with_default_reply("Hello! How can I help?"));

    let result = h.agent.run(AgentTask::new(1, Scene::Chat, "hi")).await.unwrap();

    assert_eq!(result.answer, "Hello! How can I help?");
    assert_eq!(result.error_code, None);
    assert_eq!(result.strategy, "chat");
    // Only the answering call; the planner took the fast path.
    assert_eq!(h.llm.call_count(), 1);
    assert_eq!(result.plan_json.unwrap()["steps"][0], "direct_answer");
}

#[tokio::test]
async fn research_question_cites_the_web_and_lands_on_the_timeline() {
    let llm = MockLlm::new().with_script([
        PLAN,
        r#"{"thought": "need fresh sources", "action": "deep_web_research", "action_input": {"query": "async runtimes in rust"}}"#,
        r#"{"thought": "enough", "final_answer": "Tokio is the most widely used runtime."}"#,
    ]);
    let h = Harness::new(llm);

    let result = h
        .agent
        .run(AgentTask::new(1, Scene::Research, "Which async runtimes are popular in Rust today?"))
        .await
        .unwrap();

    assert_eq!(result.error_code, None);
    assert_eq!(result.strategy, "research");
    assert_eq!(result.answer, "Tokio is the most widely used runtime.");
    assert_eq!(result.steps.len(), 2);
    assert_eq!(result.steps[0].kind, StepKind::Tool);
    assert_eq!(result.steps[0].tool_name.as_deref(), Some("deep_web_research"));
    assert!(result.citations.iter().any(|c| c.kind == CitationType::Web && c.url.is_some()));

    let events = h
        .db
        .list_timeline_events(&TimelineFilter::for_tenant(1))
        .await
        .unwrap();
    let run_event = events
        .iter()
        .find(|e| e.event_type == EventType::AgentRun)
        .unwrap();
    assert_eq!(run_event.context["run_id"], result.run_id.to_string());
    assert_eq!(run_event.context["strategy"], "research");
}

#[tokio::test]
async fn step_bound_forces_a_final_answer() {
    let echo = r#"{"thought": "again", "action": "echo", "action_input": {"message": "ping"}}"#;
    let llm = MockLlm::new()
        .with_script([PLAN, echo, echo])
        .with_default_reply("Echoed twice.");
    let settings = AgentSettings {
        max_steps: 2,
        ..AgentSettings::default()
    };
    let h = Harness::builder().llm(llm).settings(settings).build();

    let result = h
        .agent
        .run(AgentTask::new(1, Scene::Console, "Keep echoing ping until told to stop"))
        .await
        .unwrap();

    assert_eq!(result.error_code, None);
    assert_eq!(result.answer, "Echoed twice.");
    assert_eq!(result.steps.len(), 2);
    assert!(result.steps.iter().all(|s| s.tool_name.as_deref() == Some("echo")));
    // plan + two steps + forced answer
    assert_eq!(h.llm.call_count(), 4);
}

#[tokio::test]
async fn cancelling_stops_the_run() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let llm = MockLlm::new().with_responder(move |_| {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        if n == 1 {
            return PLAN.to_string();
        }
        if n == 4 {
            trigger.cancel();
        }
        r#"{"thought": "keep going", "action": "echo", "action_input": {"message": "tick"}}"#.to_string()
    });
    let h = Harness::new(llm);

    let result = h
        .agent
        .run_task(
            AgentTask::new(1, Scene::Console, "Echo tick for as long as you can"),
            RunOptions::default().with_cancel(cancel),
        )
        .await
        .unwrap();

    assert_eq!(result.error_code, Some(ErrorKind::Cancelled));
    assert!(result.steps.len() <= 4);
    assert_eq!(h.llm.call_count(), 4);
    let saved = h.db.get_agent_run(result.run_id).await.unwrap().unwrap();
    assert_eq!(saved.error_code, Some(ErrorKind::Cancelled));
}

#[tokio::test]
async fn unsafe_tool_is_hidden_from_chat() {
    let llm = MockLlm::new().with_script([
        PLAN,
        r#"{"thought": "try the shell", "action": "shell", "action_input": {"command": "ls"}}"#,
        r#"{"final_answer": "I cannot run commands here."}"#,
    ]);
    let h = Harness::new(llm);

    let result = h
        .agent
        .run(AgentTask::new(1, Scene::Chat, "List the files in my home directory please"))
        .await
        .unwrap();

    assert_eq!(result.error_code, None);
    assert_eq!(result.tool_traces.len(), 1);
    assert_eq!(result.tool_traces[0].tool_name, "shell");
    assert!(result.tool_traces[0].output.is_none());
    assert!(result.tool_traces[0].error.is_some());

    let ctx = ToolContext::new(1, Scene::Chat);
    let err = h
        .router
        .execute_scoped("shell", json!({"command": "ls"}), &ctx)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn unknown_content_id_still_answers() {
    let llm = MockLlm::new().with_script([PLAN, r#"{"final_answer": "I could not find that video."}"#]);
    let h = Harness::new(llm);

    let result = h
        .agent
        .run(AgentTask::new(1, Scene::Video, "What does this video say about lifetimes?").with_content(9999))
        .await
        .unwrap();

    assert_eq!(result.error_code, None);
    assert_eq!(result.answer, "I could not find that video.");
}

#[tokio::test]
async fn oversized_query_is_rejected() {
    let h = Harness::new(MockLlm::new());
    let err = h
        .agent
        .run(AgentTask::new(1, Scene::Chat, "a".repeat(8001)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(h.llm.call_count(), 0);
}
