//! Stage orchestration for a single content item.
//!
//! Stages run in order: download, extract_audio, transcribe, analyze,
//! index. Transcription is skipped when the platform published subtitles.
//! Analyze and index failures are recorded but do not fail the item.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::context::TimelineService;
use crate::db::Database;
use crate::error::{PipelineError, RetrievalError};
use crate::models::{ContentItem, ContentStatus, EventType, NewTimelineEvent, Scene};
use crate::pipeline::artifacts::{ArtifactStore, Transcript, TranscriptSource};
use crate::pipeline::retry::{RetryPolicy, retry_with_backoff};
use crate::pipeline::stages::{
    Analyzer, AudioExtractor, Downloader, FfmpegExtractor, MediaKind, Transcriber, stage_error,
};
use crate::retrieval::RetrievalService;

const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Download,
    ExtractAudio,
    Transcribe,
    Analyze,
    Index,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::ExtractAudio => "extract_audio",
            Self::Transcribe => "transcribe",
            Self::Analyze => "analyze",
            Self::Index => "index",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened during one `process` call.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub content_id: i64,
    /// Stages entered, in order.
    pub stages: Vec<Stage>,
    pub used_subtitles: bool,
    pub retries: u32,
    pub indexed: bool,
    /// Non-fatal stage failures.
    pub warnings: Vec<String>,
    pub duration_ms: u64,
}

impl PipelineReport {
    fn new(content_id: i64) -> Self {
        Self {
            content_id,
            stages: Vec::new(),
            used_subtitles: false,
            retries: 0,
            indexed: false,
            warnings: Vec::new(),
            duration_ms: 0,
        }
    }
}

pub struct PipelineEngine {
    db: Arc<dyn Database>,
    retrieval: Arc<dyn RetrievalService>,
    artifacts: ArtifactStore,
    downloader: Arc<dyn Downloader>,
    extractor: Arc<dyn AudioExtractor>,
    transcriber: Arc<dyn Transcriber>,
    analyzer: Option<Arc<dyn Analyzer>>,
    timeline: Option<Arc<TimelineService>>,
    retry: RetryPolicy,
    stage_timeout: Duration,
    language: Option<String>,
    item_locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl PipelineEngine {
    pub fn new(
        db: Arc<dyn Database>,
        retrieval: Arc<dyn RetrievalService>,
        artifacts: ArtifactStore,
        downloader: Arc<dyn Downloader>,
        transcriber: Arc<dyn Transcriber>,
    ) -> Self {
        Self {
            db,
            retrieval,
            artifacts,
            downloader,
            extractor: Arc::new(FfmpegExtractor::new()),
            transcriber,
            analyzer: None,
            timeline: None,
            retry: RetryPolicy::default(),
            stage_timeout: DEFAULT_STAGE_TIMEOUT,
            language: None,
            item_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn AudioExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn with_timeline(mut self, timeline: Arc<TimelineService>) -> Self {
        self.timeline = Some(timeline);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    pub fn with_language(mut self, language: Option<String>) -> Self {
        self.language = language;
        self
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    fn item_lock(&self, id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.item_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(id).or_default().clone()
    }

    fn release_lock(&self, id: i64) {
        let mut locks = self.item_locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(&id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&id);
        }
    }

    /// Run every stage for `item_id`. Safe to call again on an item that
    /// already finished: existing artifacts are reused and chunks replaced.
    pub async fn process(
        &self,
        item_id: i64,
        cancel: &CancellationToken,
    ) -> Result<PipelineReport, PipelineError> {
        let lock = self.item_lock(item_id);
        let guard = lock.lock().await;

        let result = self.process_locked(item_id, cancel).await;

        drop(guard);
        drop(lock);
        self.release_lock(item_id);
        result
    }

    async fn process_locked(
        &self,
        item_id: i64,
        cancel: &CancellationToken,
    ) -> Result<PipelineReport, PipelineError> {
        let item = self
            .db
            .get_content_item(item_id)
            .await?
            .ok_or(PipelineError::ItemNotFound(item_id))?;

        let started = Instant::now();
        let mut report = PipelineReport::new(item_id);
        tracing::info!(
            item_id,
            tenant_id = item.tenant_id,
            source_type = %item.source_type,
            source_id = %item.source_id,
            "Processing content item"
        );

        let result = self.run_stages(&item, cancel, &mut report).await;
        report.duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(()) => {
                tracing::info!(
                    item_id,
                    stages = report.stages.len(),
                    retries = report.retries,
                    used_subtitles = report.used_subtitles,
                    duration_ms = report.duration_ms,
                    "Content item done"
                );
                Ok(report)
            }
            Err(PipelineError::Cancelled) => {
                self.finish_cancelled(&item, &report).await;
                Err(PipelineError::Cancelled)
            }
            Err(e) => {
                self.finish_failed(&item, &report, &e).await;
                Err(e)
            }
        }
    }

    async fn set_status(&self, id: i64, status: ContentStatus) -> Result<(), PipelineError> {
        self.db.update_content_status(id, status, None).await?;
        Ok(())
    }

    fn checkpoint(cancel: &CancellationToken) -> Result<(), PipelineError> {
        if cancel.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// One stage attempt loop: timeout per attempt, backoff between
    /// retryable failures, and cancellation at any point.
    async fn run_stage<T, F, Fut>(
        &self,
        stage: Stage,
        item_id: i64,
        cancel: &CancellationToken,
        retries: &AtomicU32,
        mut op: F,
    ) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let timeout = self.stage_timeout;
        let db = &self.db;
        let work = retry_with_backoff(
            &self.retry,
            cancel,
            || {
                let attempt = op();
                async move {
                    match tokio::time::timeout(timeout, attempt).await {
                        Ok(result) => result,
                        Err(_) => Err(PipelineError::Timeout {
                            stage: stage.as_str().to_string(),
                            after: timeout,
                        }),
                    }
                }
            },
            |attempt, err| {
                retries.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(item_id, stage = %stage, attempt, error = %err, "Stage attempt failed");
                let db = db.clone();
                async move {
                    if let Err(e) = db.increment_retry_count(item_id).await {
                        tracing::warn!(item_id, error = %e, "Failed to record retry");
                    }
                }
            },
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
            result = work => result,
        }
    }

    async fn run_stages(
        &self,
        item: &ContentItem,
        cancel: &CancellationToken,
        report: &mut PipelineReport,
    ) -> Result<(), PipelineError> {
        let retries = AtomicU32::new(0);
        let result = self.run_stages_inner(item, cancel, report, &retries).await;
        report.retries = retries.load(Ordering::SeqCst);
        result
    }

    async fn run_stages_inner(
        &self,
        item: &ContentItem,
        cancel: &CancellationToken,
        report: &mut PipelineReport,
        retries: &AtomicU32,
    ) -> Result<(), PipelineError> {
        Self::checkpoint(cancel)?;
        self.artifacts.ensure_dirs().await?;

        // download
        report.stages.push(Stage::Download);
        self.set_status(item.id, ContentStatus::Downloading).await?;
        let existing_transcript = self.artifacts.read_transcript(item.id).await;
        let mut audio: Option<PathBuf> = self.artifacts.existing_audio(item.id).await;
        let mut video: Option<PathBuf> = None;
        let mut subtitles: Option<Transcript> = None;

        if audio.is_none() && existing_transcript.is_none() {
            let output = self
                .run_stage(Stage::Download, item.id, cancel, retries, || {
                    self.downloader.download(item, &self.artifacts)
                })
                .await?;
            subtitles = output
                .subtitles
                .as_deref()
                .map(Transcript::from_subtitles)
                .filter(|t| !t.is_empty());
            match output.kind {
                MediaKind::Audio => audio = Some(output.path),
                MediaKind::Video => video = Some(output.path),
            }
        } else {
            tracing::debug!(item_id = item.id, "Reusing artifacts from an earlier run");
        }

        // extract_audio
        Self::checkpoint(cancel)?;
        report.stages.push(Stage::ExtractAudio);
        if let Some(video) = video {
            let target = self.artifacts.audio_path(item.id, "mp3");
            self.run_stage(Stage::ExtractAudio, item.id, cancel, retries, || {
                self.extractor.extract(&video, &target)
            })
            .await?;
            ArtifactStore::remove_file(&video).await;
            audio = Some(target);
        }

        // transcribe
        Self::checkpoint(cancel)?;
        let transcript = match subtitles.or(existing_transcript) {
            Some(t) if t.source == TranscriptSource::Subtitles => {
                report.used_subtitles = true;
                t
            }
            known => {
                report.stages.push(Stage::Transcribe);
                self.set_status(item.id, ContentStatus::Transcribing).await?;
                match known {
                    Some(t) => t,
                    None => {
                        let audio_path = audio
                            .as_deref()
                            .ok_or_else(|| stage_error("transcribe", "no audio to transcribe", false))?;
                        let language = self.language.as_deref();
                        self.run_stage(Stage::Transcribe, item.id, cancel, retries, || {
                            self.transcriber.transcribe(audio_path, language)
                        })
                        .await?
                    }
                }
            }
        };
        if transcript.is_empty() {
            return Err(stage_error("transcribe", "transcript is empty", false));
        }
        let transcript_path = self.artifacts.write_transcript(item.id, &transcript).await?;
        let audio_str = audio.as_ref().map(|p| p.display().to_string());
        let transcript_str = transcript_path.display().to_string();
        self.db
            .set_content_artifacts(item.id, audio_str.as_deref(), Some(&transcript_str))
            .await?;

        // analyze
        Self::checkpoint(cancel)?;
        report.stages.push(Stage::Analyze);
        self.set_status(item.id, ContentStatus::Analyzing).await?;
        match &self.analyzer {
            Some(analyzer) => {
                let analyzed = self
                    .run_stage(Stage::Analyze, item.id, cancel, retries, || {
                        analyzer.analyze(item, &transcript)
                    })
                    .await;
                match analyzed {
                    Ok(analysis) => {
                        if let Err(e) = self.db.save_content_analysis(item.id, &analysis).await {
                            tracing::warn!(item_id = item.id, kind = %e.kind(), "Analysis not saved: {}", e);
                            report.warnings.push(format!("analyze: {}", e));
                        }
                    }
                    Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                    Err(e) => {
                        tracing::warn!(item_id = item.id, error = %e, "Analysis skipped");
                        report.warnings.push(format!("analyze: {}", e));
                    }
                }
            }
            None => report.warnings.push("analyze: no analyzer configured".to_string()),
        }

        // index
        Self::checkpoint(cancel)?;
        report.stages.push(Stage::Index);
        self.set_status(item.id, ContentStatus::Indexing).await?;
        let indexed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            result = self.index_item(item, &transcript.text) => result,
        };
        match indexed {
            Ok(_) => report.indexed = true,
            Err(e) => {
                tracing::warn!(item_id = item.id, error = %e, "Indexing skipped");
                report.warnings.push(format!("index: {}", e));
            }
        }

        Self::checkpoint(cancel)?;
        self.db.mark_content_done(item.id).await?;
        self.record_processed(item, report).await;
        Ok(())
    }

    async fn index_item(&self, item: &ContentItem, text: &str) -> Result<String, RetrievalError> {
        let partition = self.retrieval.get_or_create_partition(item.tenant_id).await?;
        let metadata = serde_json::json!({
            "source_type": item.source_type,
            "source_id": item.source_id,
            "author": item.author,
        });
        self.retrieval
            .upsert(&partition, item.id, &item.title, text, Some(metadata))
            .await
    }

    async fn unindex_item(&self, item: &ContentItem) -> Result<(), RetrievalError> {
        let partition = self.retrieval.get_or_create_partition(item.tenant_id).await?;
        self.retrieval.delete(&partition, item.id).await
    }

    async fn record_processed(&self, item: &ContentItem, report: &PipelineReport) {
        let Some(timeline) = &self.timeline else {
            return;
        };
        let event = NewTimelineEvent {
            tenant_id: item.tenant_id,
            user_id: None,
            event_type: EventType::VideoProcessed,
            scene: Scene::Library,
            content_id: Some(item.id),
            conversation_id: None,
            title: Some(item.title.clone()),
            context: serde_json::json!({
                "source_type": item.source_type,
                "used_subtitles": report.used_subtitles,
                "indexed": report.indexed,
            }),
        };
        if let Err(e) = timeline.append_event(&event).await {
            tracing::warn!(item_id = item.id, error = %e, "Failed to record timeline event");
        }
    }

    async fn finish_cancelled(&self, item: &ContentItem, report: &PipelineReport) {
        if report.stages.contains(&Stage::Index) {
            if let Err(e) = self.unindex_item(item).await {
                tracing::warn!(item_id = item.id, error = %e, "Failed to roll back chunks");
            }
        }
        if let Err(e) = self
            .db
            .update_content_status(item.id, ContentStatus::Cancelled, Some("cancelled"))
            .await
        {
            tracing::warn!(item_id = item.id, error = %e, "Failed to mark item cancelled");
        }
        tracing::info!(item_id = item.id, stage = ?report.stages.last(), "Processing cancelled");
    }

    async fn finish_failed(&self, item: &ContentItem, report: &PipelineReport, err: &PipelineError) {
        tracing::error!(
            item_id = item.id,
            stage = ?report.stages.last(),
            kind = %err.kind(),
            error = %err,
            "Processing failed"
        );
        let message = err.to_string();
        if let Err(e) = self
            .db
            .update_content_status(item.id, ContentStatus::Failed, Some(&message))
            .await
        {
            tracing::warn!(item_id = item.id, error = %e, "Failed to mark item failed");
        }
        if let Err(e) = self.db.increment_retry_count(item.id).await {
            tracing::warn!(item_id = item.id, error = %e, "Failed to record retry");
        }
    }

    /// Delete audio for items finished before `now - retention`.
    /// Transcripts stay.
    pub async fn cleanup_audio(&self, retention: chrono::Duration) -> Result<usize, PipelineError> {
        let cutoff = chrono::Utc::now() - retention;
        let items = self.db.list_audio_for_cleanup(cutoff).await?;
        let mut removed = 0;
        for item in items {
            let Some(path) = item.audio_path.as_deref() else {
                continue;
            };
            ArtifactStore::remove_file(std::path::Path::new(path)).await;
            self.db
                .set_content_artifacts(item.id, None, item.transcript_path.as_deref())
                .await?;
            removed += 1;
        }
        if removed > 0 {
            tracing::info!(removed, "Cleaned up audio artifacts");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryDatabase;
    use crate::models::{ContentAnalysis, NewContentItem, SourceType};
    use crate::pipeline::stages::{StubAnalyzer, StubDownloader, StubTranscriber};
    use crate::retrieval::{InMemoryVectorIndex, MockEmbeddings, VectorRetrieval};
    use pretty_assertions::assert_eq;

    struct Fixture {
        db: Arc<InMemoryDatabase>,
        retrieval: Arc<dyn RetrievalService>,
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                db: Arc::new(InMemoryDatabase::new()),
                retrieval: Arc::new(VectorRetrieval::new(
                    Arc::new(InMemoryVectorIndex::new()),
                    Arc::new(MockEmbeddings::new(32)),
                )),
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn engine(&self, downloader: Arc<dyn Downloader>, transcriber: Arc<dyn Transcriber>) -> PipelineEngine {
            PipelineEngine::new(
                self.db.clone(),
                self.retrieval.clone(),
                ArtifactStore::new(self.dir.path()),
                downloader,
                transcriber,
            )
            .with_retry(RetryPolicy {
                max_attempts: 3,
                base: Duration::from_millis(1),
                cap: Duration::from_millis(5),
            })
        }

        async fn item(&self) -> i64 {
            let (item, _) = self
                .db
                .insert_content_item(&NewContentItem::new(1, SourceType::Bilibili, "BV1xx411c7mD", "Borrowing"))
                .await
                .unwrap();
            item.id
        }

        async fn status(&self, id: i64) -> ContentItem {
            self.db.get_content_item(id).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn test_full_run() {
        let fx = Fixture::new();
        let id = fx.item().await;
        let engine = fx
            .engine(
                Arc::new(StubDownloader::new()),
                Arc::new(StubTranscriber::new("Borrowing lets you use a value without owning it.")),
            )
            .with_analyzer(Arc::new(StubAnalyzer::new(ContentAnalysis {
                summary: "About borrowing".into(),
                ..Default::default()
            })));

        let report = engine.process(id, &CancellationToken::new()).await.unwrap();
        assert_eq!(
            report.stages,
            vec![Stage::Download, Stage::ExtractAudio, Stage::Transcribe, Stage::Analyze, Stage::Index]
        );
        assert!(report.indexed);

        let item = fx.status(id).await;
        assert_eq!(item.status, ContentStatus::Done);
        assert!(item.transcript_path.is_some());
        assert_eq!(item.analysis.unwrap().summary, "About borrowing");

        let partition = fx.retrieval.get_or_create_partition(1).await.unwrap();
        let hits = fx.retrieval.search(&partition, "borrowing", 5).await.unwrap();
        assert_eq!(hits[0].content_id, id);
    }

    #[tokio::test]
    async fn test_subtitles_skip_transcription() {
        let fx = Fixture::new();
        let id = fx.item().await;
        let transcriber = Arc::new(StubTranscriber::new("unused"));
        let engine = fx.engine(
            Arc::new(StubDownloader::new().with_subtitles("1\n00:00:01,000 --> 00:00:02,000\nHello subtitles\n")),
            transcriber.clone(),
        );

        let report = engine.process(id, &CancellationToken::new()).await.unwrap();
        assert!(report.used_subtitles);
        assert!(!report.stages.contains(&Stage::Transcribe));
        assert_eq!(transcriber.call_count(), 0);
        assert_eq!(fx.status(id).await.status, ContentStatus::Done);
    }

    #[tokio::test]
    async fn test_retries_are_counted() {
        let fx = Fixture::new();
        let id = fx.item().await;
        let engine = fx.engine(
            Arc::new(StubDownloader::new()),
            Arc::new(StubTranscriber::new("text").failing_first(2)),
        );

        let report = engine.process(id, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.retries, 2);
        let item = fx.status(id).await;
        assert_eq!(item.status, ContentStatus::Done);
        assert_eq!(item.retry_count, 2);
    }

    #[tokio::test]
    async fn test_fatal_download_failure() {
        let fx = Fixture::new();
        let id = fx.item().await;
        let engine = fx.engine(
            Arc::new(StubDownloader::new().failing("video removed")),
            Arc::new(StubTranscriber::new("text")),
        );

        let err = engine.process(id, &CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("video removed"));
        let item = fx.status(id).await;
        assert_eq!(item.status, ContentStatus::Failed);
        assert!(item.error_message.unwrap().contains("video removed"));
        assert_eq!(item.retry_count, 1);
    }

    #[tokio::test]
    async fn test_analysis_failure_is_not_fatal() {
        let fx = Fixture::new();
        let id = fx.item().await;
        let engine = fx
            .engine(Arc::new(StubDownloader::new()), Arc::new(StubTranscriber::new("text")))
            .with_analyzer(Arc::new(StubAnalyzer::failing()));

        let report = engine.process(id, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.warnings.len(), 1);
        let item = fx.status(id).await;
        assert_eq!(item.status, ContentStatus::Done);
        assert!(item.analysis.is_none());
    }

    #[tokio::test]
    async fn test_analysis_write_failure_is_not_fatal() {
        let fx = Fixture::new();
        let id = fx.item().await;
        fx.db.reject_analysis_writes(true);
        let engine = fx
            .engine(Arc::new(StubDownloader::new()), Arc::new(StubTranscriber::new("text")))
            .with_analyzer(Arc::new(StubAnalyzer::new(ContentAnalysis::default())));

        let report = engine.process(id, &CancellationToken::new()).await.unwrap();
        assert!(report.indexed);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].starts_with("analyze:"));
        let item = fx.status(id).await;
        assert_eq!(item.status, ContentStatus::Done);
        assert!(item.analysis.is_none());
    }

    #[tokio::test]
    async fn test_cancel_mid_stage() {
        let fx = Fixture::new();
        let id = fx.item().await;
        let engine = Arc::new(fx.engine(
            Arc::new(StubDownloader::new()),
            Arc::new(StubTranscriber::new("text").with_delay(Duration::from_secs(5))),
        ));

        let cancel = CancellationToken::new();
        let task = {
            let engine = engine.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { engine.process(id, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(fx.status(id).await.status, ContentStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_rerun_reuses_artifacts() {
        let fx = Fixture::new();
        let id = fx.item().await;
        let downloader = Arc::new(StubDownloader::new());
        let engine = fx.engine(downloader.clone(), Arc::new(StubTranscriber::new("same text")));

        engine.process(id, &CancellationToken::new()).await.unwrap();
        engine.process(id, &CancellationToken::new()).await.unwrap();
        assert_eq!(downloader.call_count(), 1);

        let partition = fx.retrieval.get_or_create_partition(1).await.unwrap();
        let exported = fx.retrieval.export_all(&partition).await.unwrap();
        assert_eq!(exported.len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_audio() {
        let fx = Fixture::new();
        let id = fx.item().await;
        let engine = fx.engine(Arc::new(StubDownloader::new()), Arc::new(StubTranscriber::new("text")));
        engine.process(id, &CancellationToken::new()).await.unwrap();
        let audio = fx.status(id).await.audio_path.unwrap();
        assert!(std::path::Path::new(&audio).exists());

        tokio::time::sleep(Duration::from_millis(5)).await;
        let removed = engine.cleanup_audio(chrono::Duration::zero()).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!std::path::Path::new(&audio).exists());
        let item = fx.status(id).await;
        assert!(item.audio_path.is_none());
        assert!(item.transcript_path.is_some());
    }

    #[tokio::test]
    async fn test_missing_item() {
        let fx = Fixture::new();
        let engine = fx.engine(Arc::new(StubDownloader::new()), Arc::new(StubTranscriber::new("t")));
        let err = engine.process(999, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::ItemNotFound(999)));
    }
}
