//! Content processing: resolve a source, download, extract audio,
//! transcribe, analyse and index, with a bounded queue in front and a
//! scheduler that keeps it fed.

mod artifacts;
mod engine;
mod queue;
mod retry;
mod scheduler;
mod source;
mod stages;

pub use artifacts::{ArtifactStore, Transcript, TranscriptSegment, TranscriptSource};
pub use engine::{PipelineEngine, PipelineReport, Stage};
pub use queue::{DEFAULT_MAX_PARALLEL, ProcessingQueue, QueueInfo, QueueStatus};
pub use retry::{RetryPolicy, retry_with_backoff};
pub use scheduler::{Job, Scheduler, SchedulerConfig};
pub use source::{ContentRef, parse_parts, parse_reference, parse_source, podcast_id};
pub use stages::{
    Analyzer, AudioExtractor, CopyExtractor, DEFAULT_ANALYSIS_PROMPT, DownloadOutput, Downloader,
    FfmpegExtractor, HttpDownloader, LlmAnalyzer, MediaKind, SourceDownloaders, StubAnalyzer,
    StubDownloader, StubTranscriber, Transcriber, WhisperApiTranscriber, YtDlpDownloader,
    parse_analysis,
};
