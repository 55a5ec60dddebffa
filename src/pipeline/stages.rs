//! Pluggable stage backends: download, audio extraction, transcription and
//! analysis.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use regex::Regex;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::PipelineError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::models::{ContentAnalysis, ContentItem, SourceType};
use crate::pipeline::artifacts::{ArtifactStore, Transcript, TranscriptSegment};

/// Transcript text beyond this is cut to head and tail before analysis.
const MAX_ANALYSIS_CHARS: usize = 15_000;

pub(crate) fn stage_error(stage: &str, reason: impl Into<String>, retryable: bool) -> PipelineError {
    PipelineError::Stage {
        stage: stage.to_string(),
        reason: reason.into(),
        retryable,
    }
}

fn http_error(stage: &str, e: reqwest::Error) -> PipelineError {
    let retryable = e.is_timeout() || e.is_connect() || e.status().is_none_or(|s| s.is_server_error());
    stage_error(stage, e.to_string(), retryable)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

/// What a download produced.
#[derive(Debug, Clone)]
pub struct DownloadOutput {
    pub path: PathBuf,
    pub kind: MediaKind,
    /// Subtitles published alongside the media, raw.
    pub subtitles: Option<String>,
}

#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(
        &self,
        item: &ContentItem,
        artifacts: &ArtifactStore,
    ) -> Result<DownloadOutput, PipelineError>;
}

#[async_trait]
pub trait AudioExtractor: Send + Sync {
    async fn extract(&self, video: &Path, audio: &Path) -> Result<(), PipelineError>;
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(
        &self,
        audio: &Path,
        language: Option<&str>,
    ) -> Result<Transcript, PipelineError>;
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(
        &self,
        item: &ContentItem,
        transcript: &Transcript,
    ) -> Result<ContentAnalysis, PipelineError>;
}

/// Dispatches to a downloader per source type.
#[derive(Default)]
pub struct SourceDownloaders {
    by_type: HashMap<SourceType, Arc<dyn Downloader>>,
}

impl SourceDownloaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, source_type: SourceType, downloader: Arc<dyn Downloader>) -> Self {
        self.by_type.insert(source_type, downloader);
        self
    }

    /// yt-dlp for video platforms, plain HTTP for podcasts.
    pub fn standard() -> Self {
        let ytdlp: Arc<dyn Downloader> = Arc::new(YtDlpDownloader::new());
        Self::new()
            .with(SourceType::Bilibili, ytdlp.clone())
            .with(SourceType::Youtube, ytdlp)
            .with(SourceType::Podcast, Arc::new(HttpDownloader::new()))
    }
}

#[async_trait]
impl Downloader for SourceDownloaders {
    async fn download(
        &self,
        item: &ContentItem,
        artifacts: &ArtifactStore,
    ) -> Result<DownloadOutput, PipelineError> {
        let downloader = self.by_type.get(&item.source_type).ok_or_else(|| {
            stage_error(
                "download",
                format!("no downloader for {}", item.source_type),
                false,
            )
        })?;
        downloader.download(item, artifacts).await
    }
}

/// Audio-only download through the `yt-dlp` binary, with published
/// subtitles when the platform has them.
pub struct YtDlpDownloader {
    binary: String,
}

impl YtDlpDownloader {
    pub fn new() -> Self {
        Self {
            binary: "yt-dlp".to_string(),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }
}

impl Default for YtDlpDownloader {
    fn default() -> Self {
        Self::new()
    }
}

async fn find_subtitles(dir: &Path, id: i64) -> Option<String> {
    let prefix = format!("{}.", id);
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(&prefix) && (name.ends_with(".vtt") || name.ends_with(".srt")) {
            let text = tokio::fs::read_to_string(entry.path()).await.ok();
            ArtifactStore::remove_file(&entry.path()).await;
            return text.filter(|t| !t.trim().is_empty());
        }
    }
    None
}

#[async_trait]
impl Downloader for YtDlpDownloader {
    async fn download(
        &self,
        item: &ContentItem,
        artifacts: &ArtifactStore,
    ) -> Result<DownloadOutput, PipelineError> {
        let url = item
            .source_url()
            .ok_or_else(|| stage_error("download", "item has no source URL", false))?;
        let dir = artifacts.audio_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let template = dir.join(format!("{}.%(ext)s", item.id));

        let output = Command::new(&self.binary)
            .args(["--no-progress", "--no-playlist", "-f", "bestaudio/best"])
            .args(["--write-subs", "--sub-langs", "zh.*,en.*", "--sub-format", "vtt/srt"])
            .args(["--print", "after_move:filepath", "-o"])
            .arg(&template)
            .arg(&url)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| stage_error("download", format!("failed to run {}: {}", self.binary, e), false))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // yt-dlp reports both network hiccups and removed videos this way.
            let retryable = !stderr.contains("Video unavailable") && !stderr.contains("Private video");
            return Err(stage_error("download", stderr.trim().to_string(), retryable));
        }

        let path = String::from_utf8_lossy(&output.stdout)
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(|l| PathBuf::from(l.trim()))
            .ok_or_else(|| stage_error("download", "yt-dlp reported no output file", true))?;

        Ok(DownloadOutput {
            path,
            kind: MediaKind::Audio,
            subtitles: find_subtitles(&dir, item.id).await,
        })
    }
}

/// Streams a direct media URL to disk.
pub struct HttpDownloader {
    client: Client,
}

impl HttpDownloader {
    pub fn new() -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }
}

impl Default for HttpDownloader {
    fn default() -> Self {
        Self::new()
    }
}

fn extension_for(content_type: &str, url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_lowercase();
    for ext in ["mp3", "m4a", "aac", "ogg", "wav", "flac"] {
        if path.ends_with(&format!(".{}", ext)) {
            return ext;
        }
    }
    match content_type {
        t if t.contains("mp4") || t.contains("m4a") => "m4a",
        t if t.contains("ogg") => "ogg",
        t if t.contains("wav") => "wav",
        _ => "mp3",
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(
        &self,
        item: &ContentItem,
        artifacts: &ArtifactStore,
    ) -> Result<DownloadOutput, PipelineError> {
        let url = item
            .media_url
            .as_deref()
            .ok_or_else(|| stage_error("download", "podcast item has no media URL", false))?;
        let url = url.split('#').next().unwrap_or(url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| http_error("download", e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(stage_error(
                "download",
                format!("HTTP {} for {}", status, url),
                status.is_server_error() || status.as_u16() == 429,
            ));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_lowercase();
        if content_type.contains("xml") || content_type.contains("html") {
            return Err(stage_error(
                "download",
                format!("{} is not an audio file ({})", url, content_type),
                false,
            ));
        }

        tokio::fs::create_dir_all(artifacts.audio_dir()).await?;
        let path = artifacts.audio_path(item.id, extension_for(&content_type, url));
        let mut file = tokio::fs::File::create(&path).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| http_error("download", e))?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        Ok(DownloadOutput {
            path,
            kind: MediaKind::Audio,
            subtitles: None,
        })
    }
}

/// 16 kHz mono mp3 through ffmpeg, suitable for speech recognition.
pub struct FfmpegExtractor {
    binary: String,
}

impl FfmpegExtractor {
    pub fn new() -> Self {
        Self {
            binary: "ffmpeg".to_string(),
        }
    }
}

impl Default for FfmpegExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioExtractor for FfmpegExtractor {
    async fn extract(&self, video: &Path, audio: &Path) -> Result<(), PipelineError> {
        let output = Command::new(&self.binary)
            .args(["-v", "error", "-y", "-i"])
            .arg(video)
            .args(["-vn", "-acodec", "libmp3lame", "-ab", "128k", "-ar", "16000", "-ac", "1"])
            .arg(audio)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| stage_error("extract_audio", format!("failed to run ffmpeg: {}", e), false))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(stage_error(
                "extract_audio",
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
                false,
            ))
        }
    }
}

#[derive(Debug, Deserialize)]
struct VerboseTranscription {
    text: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    segments: Vec<TranscriptSegment>,
}

/// OpenAI-compatible `/audio/transcriptions` endpoint.
pub struct WhisperApiTranscriber {
    client: Client,
    base_url: String,
    api_key: SecretString,
    model: String,
}

impl WhisperApiTranscriber {
    pub fn new(base_url: impl Into<String>, api_key: SecretString, model: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Transcriber for WhisperApiTranscriber {
    async fn transcribe(
        &self,
        audio: &Path,
        language: Option<&str>,
    ) -> Result<Transcript, PipelineError> {
        let bytes = tokio::fs::read(audio).await?;
        let file_name = audio
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio.mp3".to_string());
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("audio/mpeg")
            .map_err(|e| stage_error("transcribe", e.to_string(), false))?;
        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("response_format", "verbose_json");
        if let Some(lang) = language {
            form = form.text("language", lang.to_string());
        }

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .multipart(form)
            .send()
            .await
            .map_err(|e| http_error("transcribe", e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(stage_error(
                "transcribe",
                format!("HTTP {}: {}", status, body),
                status.is_server_error() || status.as_u16() == 429,
            ));
        }

        let parsed: VerboseTranscription = response
            .json()
            .await
            .map_err(|e| stage_error("transcribe", format!("bad response: {}", e), false))?;
        Ok(Transcript {
            language: parsed.language,
            duration: parsed.duration,
            segments: parsed.segments,
            ..Transcript::from_text(parsed.text.trim())
        })
    }
}

pub const DEFAULT_ANALYSIS_PROMPT: &str = "You analyse transcripts of videos and podcasts. \
Reply with a JSON object only: {\"summary\": \"2-4 sentence summary\", \"key_points\": \
[\"3-5 main points\"], \"concepts\": [\"key concepts\"], \"tags\": [\"short tags\"]}";

static JSON_OBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("valid regex"));

/// Parse the analysis object out of a model reply.
pub fn parse_analysis(content: &str) -> Option<ContentAnalysis> {
    serde_json::from_str::<ContentAnalysis>(content.trim())
        .ok()
        .or_else(|| {
            JSON_OBJECT
                .find(content)
                .and_then(|m| serde_json::from_str(m.as_str()).ok())
        })
}

fn clip_middle(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    let half = max / 2;
    let head: String = text.chars().take(half).collect();
    let tail: String = text.chars().skip(count - half).collect();
    format!("{}\n...[middle omitted]...\n{}", head, tail)
}

/// Summary, key points, concepts and tags from the chat model.
pub struct LlmAnalyzer {
    llm: Arc<dyn LlmProvider>,
    prompt: String,
}

impl LlmAnalyzer {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self {
            llm,
            prompt: DEFAULT_ANALYSIS_PROMPT.to_string(),
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }
}

#[async_trait]
impl Analyzer for LlmAnalyzer {
    async fn analyze(
        &self,
        item: &ContentItem,
        transcript: &Transcript,
    ) -> Result<ContentAnalysis, PipelineError> {
        let user = format!(
            "Title: {}\nAuthor: {}\nDuration: {} min\n\nTranscript:\n{}",
            item.title,
            item.author.as_deref().unwrap_or("unknown"),
            item.duration_secs.unwrap_or(0) / 60,
            clip_middle(&transcript.text, MAX_ANALYSIS_CHARS)
        );
        let request = CompletionRequest::new(vec![
            ChatMessage::system(self.prompt.clone()),
            ChatMessage::user(user),
        ])
        .with_temperature(0.3)
        .with_json_mode();

        let response = self
            .llm
            .complete(request)
            .await
            .map_err(|e| stage_error("analyze", e.to_string(), e.is_retryable()))?;
        parse_analysis(&response.content)
            .ok_or_else(|| stage_error("analyze", "model reply was not an analysis object", false))
    }
}

/// Writes a small placeholder audio file and optionally reports subtitles.
#[derive(Default)]
pub struct StubDownloader {
    subtitles: Option<String>,
    fail_with: Option<String>,
    calls: AtomicU32,
}

impl StubDownloader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subtitles(mut self, subtitles: impl Into<String>) -> Self {
        self.subtitles = Some(subtitles.into());
        self
    }

    /// Every call fails with a non-retryable error.
    pub fn failing(mut self, reason: impl Into<String>) -> Self {
        self.fail_with = Some(reason.into());
        self
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Downloader for StubDownloader {
    async fn download(
        &self,
        item: &ContentItem,
        artifacts: &ArtifactStore,
    ) -> Result<DownloadOutput, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = &self.fail_with {
            return Err(stage_error("download", reason.clone(), false));
        }
        tokio::fs::create_dir_all(artifacts.audio_dir()).await?;
        let path = artifacts.audio_path(item.id, "mp3");
        tokio::fs::write(&path, b"ID3stub").await?;
        Ok(DownloadOutput {
            path,
            kind: MediaKind::Audio,
            subtitles: self.subtitles.clone(),
        })
    }
}

/// Copies the input instead of transcoding it.
pub struct CopyExtractor;

#[async_trait]
impl AudioExtractor for CopyExtractor {
    async fn extract(&self, video: &Path, audio: &Path) -> Result<(), PipelineError> {
        tokio::fs::copy(video, audio).await?;
        Ok(())
    }
}

/// Returns fixed text, optionally after a number of retryable failures.
pub struct StubTranscriber {
    text: String,
    fail_first: u32,
    delay: Duration,
    calls: AtomicU32,
}

impl StubTranscriber {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            fail_first: 0,
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
        }
    }

    pub fn failing_first(mut self, n: u32) -> Self {
        self.fail_first = n;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcriber for StubTranscriber {
    async fn transcribe(
        &self,
        _audio: &Path,
        language: Option<&str>,
    ) -> Result<Transcript, PipelineError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if call <= self.fail_first {
            return Err(stage_error("transcribe", format!("transient failure #{}", call), true));
        }
        Ok(Transcript {
            language: language.map(str::to_string),
            ..Transcript::from_text(self.text.clone())
        })
    }
}

/// Fixed analysis, or a failure when constructed with `failing`.
pub struct StubAnalyzer {
    analysis: Option<ContentAnalysis>,
}

impl StubAnalyzer {
    pub fn new(analysis: ContentAnalysis) -> Self {
        Self {
            analysis: Some(analysis),
        }
    }

    pub fn failing() -> Self {
        Self { analysis: None }
    }
}

#[async_trait]
impl Analyzer for StubAnalyzer {
    async fn analyze(
        &self,
        _item: &ContentItem,
        _transcript: &Transcript,
    ) -> Result<ContentAnalysis, PipelineError> {
        self.analysis
            .clone()
            .ok_or_else(|| stage_error("analyze", "analysis unavailable", false))
    }
}
