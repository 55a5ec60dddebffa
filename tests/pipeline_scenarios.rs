//! Content ingestion through the queue and the agent tools.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use alice::agent::AgentTask;
use alice::db::Database;
use alice::llm::MockLlm;
use alice::models::{ContentStatus, NewContentItem, Scene, SourceType};
use alice::pipeline::{QueueStatus, StubTranscriber};
use alice::tools::ToolContext;
use common::{Harness, TRANSCRIPT};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(30);

async fn new_item(h: &Harness, source_id: &str) -> i64 {
    let (item, created) = h
        .db
        .insert_content_item(&NewContentItem::new(1, SourceType::Youtube, source_id, "Ownership in Rust"))
        .await
        .unwrap();
    assert!(created);
    item.id
}

#[tokio::test]
async fn submitted_video_is_processed_and_cited() {
    let video = Arc::new(AtomicI64::new(0));
    let calls = Arc::new(AtomicUsize::new(0));
    let (seen, counter) = (video.clone(), calls.clone());
    let llm = MockLlm::new().with_responder(move |_| match counter.fetch_add(1, Ordering::SeqCst) {
        0 => r#"{"title": "Summarise", "steps": ["read the summary", "answer"]}"#.to_string(),
        1 => json!({
            "thought": "read it",
            "action": "get_video_summary",
            "action_input": {"video_id": seen.load(Ordering::SeqCst)},
        })
        .to_string(),
        _ => r#"{"final_answer": "It explains ownership and borrowing."}"#.to_string(),
    });
    let h = Harness::new(llm);

    let ctx = ToolContext::new(1, Scene::Library);
    let submitted = h
        .router
        .execute_scoped(
            "submit_content",
            json!({"url": "https://www.bilibili.com/video/BV1xx411c7mD"}),
            &ctx,
        )
        .await
        .unwrap();
    let id = submitted.result["content_id"].as_i64().unwrap();
    assert_eq!(submitted.result["queued"], true);
    video.store(id, Ordering::SeqCst);

    assert_eq!(h.queue.wait_for(id, WAIT).await, Some(QueueStatus::Completed));
    let item = h.db.get_content_item(id).await.unwrap().unwrap();
    assert_eq!(item.status, ContentStatus::Done);
    assert!(item.analysis.is_some());

    let result = h
        .agent
        .run(AgentTask::new(1, Scene::Library, "Summarise this video for me").with_content(id))
        .await
        .unwrap();
    assert_eq!(result.error_code, None);
    assert_eq!(result.answer, "It explains ownership and borrowing.");
    assert_eq!(result.tool_traces[0].tool_name, "get_video_summary");
    assert!(result.tool_traces[0].error.is_none());
    assert!(result.citations.iter().any(|c| c.content_id() == Some(id)));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn transient_transcription_failures_are_retried() {
    let h = Harness::builder()
        .transcriber(StubTranscriber::new(TRANSCRIPT).failing_first(2))
        .build();
    let id = new_item(&h, "dQw4w9WgXcQ").await;

    assert!(h.queue.submit(id, None));
    assert_eq!(h.queue.wait_for(id, WAIT).await, Some(QueueStatus::Completed));

    let item = h.db.get_content_item(id).await.unwrap().unwrap();
    assert_eq!(item.status, ContentStatus::Done);
    assert_eq!(item.retry_count, 2);
    assert_eq!(item.error_message, None);
}

#[tokio::test]
async fn reprocessing_does_not_duplicate_chunks() {
    let h = Harness::new(MockLlm::new());
    let id = new_item(&h, "abc123def45").await;
    let partition = h.retrieval.get_or_create_partition(1).await.unwrap();

    let first = h.engine.process(id, &CancellationToken::new()).await.unwrap();
    assert!(first.indexed);
    let before = h.retrieval.export_all(&partition).await.unwrap();

    h.engine.process(id, &CancellationToken::new()).await.unwrap();
    let after = h.retrieval.export_all(&partition).await.unwrap();

    assert_eq!(before.len(), 1);
    assert_eq!(after.len(), 1);
    assert_eq!(before[0].content_id, id);
    assert_eq!(before[0].chunk_count, after[0].chunk_count);
}

#[tokio::test]
async fn queue_respects_parallelism() {
    let h = Harness::builder()
        .transcriber(StubTranscriber::new(TRANSCRIPT).with_delay(Duration::from_millis(50)))
        .max_parallel(1)
        .build();
    let mut ids = Vec::new();
    for source in ["aaaaaaaaaa1", "aaaaaaaaaa2", "aaaaaaaaaa3"] {
        let id = new_item(&h, source).await;
        assert!(h.queue.submit(id, None));
        ids.push(id);
    }

    let info = h.queue.info();
    assert_eq!(info.max_parallel, 1);
    assert!(info.running <= 1);

    for id in ids {
        assert_eq!(h.queue.wait_for(id, WAIT).await, Some(QueueStatus::Completed));
        assert!(h.queue.info().running <= 1);
    }
}
