//! On-disk layout of pipeline artifacts.
//!
//! ```text
//! <data_dir>/
//!   audio/<id>.<ext>
//!   video/<id>.<ext>
//!   transcripts/<id>.txt
//!   transcripts/<id>.json
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

const AUDIO_EXTENSIONS: &[&str] = &["m4a", "mp3", "wav", "aac", "ogg", "opus", "flac", "webm"];

/// Where the transcript text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptSource {
    #[default]
    Asr,
    /// Subtitles published with the content.
    Subtitles,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Canonical transcript artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub segments: Vec<TranscriptSegment>,
    #[serde(default)]
    pub source: TranscriptSource,
}

impl Transcript {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            language: None,
            duration: None,
            segments: Vec::new(),
            source: TranscriptSource::Asr,
        }
    }

    /// Subtitle text normalised into transcript form: cue numbers and
    /// timestamp lines dropped, one line per cue.
    pub fn from_subtitles(raw: &str) -> Self {
        let text = raw
            .lines()
            .map(str::trim)
            .filter(|line| {
                !line.is_empty()
                    && *line != "WEBVTT"
                    && !line.contains("-->")
                    && !line.chars().all(|c| c.is_ascii_digit())
            })
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            source: TranscriptSource::Subtitles,
            ..Self::from_text(text)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Paths for one data directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn audio_dir(&self) -> PathBuf {
        self.root.join("audio")
    }

    pub fn video_dir(&self) -> PathBuf {
        self.root.join("video")
    }

    pub fn transcripts_dir(&self) -> PathBuf {
        self.root.join("transcripts")
    }

    pub async fn ensure_dirs(&self) -> Result<(), PipelineError> {
        for dir in [self.audio_dir(), self.video_dir(), self.transcripts_dir()] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }

    pub fn audio_path(&self, id: i64, ext: &str) -> PathBuf {
        self.audio_dir().join(format!("{}.{}", id, ext))
    }

    pub fn video_path(&self, id: i64, ext: &str) -> PathBuf {
        self.video_dir().join(format!("{}.{}", id, ext))
    }

    pub fn transcript_text_path(&self, id: i64) -> PathBuf {
        self.transcripts_dir().join(format!("{}.txt", id))
    }

    pub fn transcript_json_path(&self, id: i64) -> PathBuf {
        self.transcripts_dir().join(format!("{}.json", id))
    }

    /// Audio left behind by an earlier run, if any.
    pub async fn existing_audio(&self, id: i64) -> Option<PathBuf> {
        for ext in AUDIO_EXTENSIONS {
            let path = self.audio_path(id, ext);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Some(path);
            }
        }
        None
    }

    pub async fn write_transcript(
        &self,
        id: i64,
        transcript: &Transcript,
    ) -> Result<PathBuf, PipelineError> {
        tokio::fs::create_dir_all(self.transcripts_dir()).await?;
        let json = serde_json::to_vec_pretty(transcript).map_err(|e| PipelineError::Stage {
            stage: "transcribe".into(),
            reason: format!("failed to encode transcript: {}", e),
            retryable: false,
        })?;
        let json_path = self.transcript_json_path(id);
        tokio::fs::write(&json_path, json).await?;
        tokio::fs::write(self.transcript_text_path(id), &transcript.text).await?;
        Ok(json_path)
    }

    /// Transcript from an earlier run. Unreadable files count as missing.
    pub async fn read_transcript(&self, id: i64) -> Option<Transcript> {
        let bytes = tokio::fs::read(self.transcript_json_path(id)).await.ok()?;
        match serde_json::from_slice::<Transcript>(&bytes) {
            Ok(t) if !t.is_empty() => Some(t),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(item_id = id, error = %e, "Ignoring unreadable transcript artifact");
                None
            }
        }
    }

    pub async fn remove_file(path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove artifact");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_transcript_roundtrip_and_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.ensure_dirs().await.unwrap();

        let transcript = Transcript {
            language: Some("en".into()),
            ..Transcript::from_text("hello world")
        };
        let path = store.write_transcript(7, &transcript).await.unwrap();
        assert_eq!(path, dir.path().join("transcripts/7.json"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("transcripts/7.txt")).unwrap(),
            "hello world"
        );
        assert_eq!(store.read_transcript(7).await, Some(transcript));
        assert_eq!(store.read_transcript(8).await, None);
    }

    #[tokio::test]
    async fn test_existing_audio() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.ensure_dirs().await.unwrap();
        assert!(store.existing_audio(3).await.is_none());
        std::fs::write(store.audio_path(3, "mp3"), b"id3").unwrap();
        assert_eq!(store.existing_audio(3).await, Some(store.audio_path(3, "mp3")));
    }

    #[test]
    fn test_subtitles_are_normalised() {
        let raw = "WEBVTT\n\n1\n00:00:01.000 --> 00:00:02.000\nHello\n\n2\n00:00:02.000 --> 00:00:03.000\nthere\n";
        let t = Transcript::from_subtitles(raw);
        assert_eq!(t.text, "Hello\nthere");
        assert_eq!(t.source, TranscriptSource::Subtitles);
    }
}
