//! Turning user input (URLs or `type:id` shorthands) into content references.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::PipelineError;
use crate::models::SourceType;

/// Identity of a piece of content on its platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentRef {
    pub source_type: SourceType,
    pub source_id: String,
    /// Original URL when the reference came from one. Podcasts need it to
    /// fetch the audio since their id is only a hash.
    pub url: Option<String>,
}

impl ContentRef {
    pub fn new(source_type: SourceType, source_id: impl Into<String>) -> Self {
        Self {
            source_type,
            source_id: source_id.into(),
            url: None,
        }
    }
}

static BILIBILI_BV: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(BV[a-zA-Z0-9]{10})").expect("valid regex"));
static BILIBILI_AV: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)/video/av(\d+)").expect("valid regex"));
static YOUTUBE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:youtube\.com/(?:watch\?(?:.*&)?v=|embed/|shorts/|live/|v/)|youtu\.be/)([A-Za-z0-9_-]{11})",
    )
    .expect("valid regex")
});
static SHORTHAND_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("valid regex"));

const AUDIO_EXTENSIONS: &[&str] = &[".mp3", ".m4a", ".aac", ".ogg", ".wav", ".flac"];

/// Stable 12-hex-char id for a podcast feed or episode URL.
pub fn podcast_id(url: &str) -> String {
    let hash = blake3::hash(url.trim().as_bytes());
    hash.to_hex()[..12].to_string()
}

fn looks_like_podcast(lower: &str) -> bool {
    let path = lower.split(['?', '#']).next().unwrap_or(lower);
    path.ends_with(".rss")
        || path.ends_with(".xml")
        || lower.contains("feed")
        || lower.contains("podcast")
        || AUDIO_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

/// Recognise a platform URL. Returns `None` for anything unsupported.
pub fn parse_source(url: &str) -> Option<ContentRef> {
    let url = url.trim();
    if url.is_empty() {
        return None;
    }
    let lower = url.to_lowercase();

    if lower.contains("bilibili.com") || lower.contains("b23.tv") {
        if let Some(caps) = BILIBILI_BV.captures(url) {
            return Some(with_url(SourceType::Bilibili, &caps[1], url));
        }
        if let Some(caps) = BILIBILI_AV.captures(url) {
            return Some(with_url(SourceType::Bilibili, format!("av{}", &caps[1]), url));
        }
        return None;
    }

    if lower.contains("youtube.com") || lower.contains("youtu.be") {
        return YOUTUBE
            .captures(url)
            .map(|caps| with_url(SourceType::Youtube, &caps[1], url));
    }

    if (lower.starts_with("http://") || lower.starts_with("https://")) && looks_like_podcast(&lower)
    {
        // An episode inside a feed is addressed as `feed#guid`.
        return Some(with_url(SourceType::Podcast, podcast_id(url), url));
    }

    None
}

fn with_url(source_type: SourceType, id: impl Into<String>, url: &str) -> ContentRef {
    ContentRef {
        url: Some(url.to_string()),
        ..ContentRef::new(source_type, id)
    }
}

/// Accept either a URL or a `source_type:source_id` shorthand such as
/// `bilibili:BV1xx411c7mD`.
pub fn parse_reference(input: &str) -> Result<ContentRef, PipelineError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(PipelineError::InvalidReference("empty reference".into()));
    }
    if input.contains("://") {
        return parse_source(input)
            .ok_or_else(|| PipelineError::InvalidReference(format!("unsupported URL: {}", input)));
    }

    let (kind, id) = input.split_once(':').ok_or_else(|| {
        PipelineError::InvalidReference(format!(
            "expected a URL or <source_type>:<id>, got '{}'",
            input
        ))
    })?;
    let source_type: SourceType = kind
        .trim()
        .parse()
        .map_err(|e: String| PipelineError::InvalidReference(e))?;
    parse_parts(source_type, id)
}

/// Validate an explicit `(source_type, source_id)` pair.
pub fn parse_parts(source_type: SourceType, id: &str) -> Result<ContentRef, PipelineError> {
    let id = id.trim();
    if !SHORTHAND_ID.is_match(id) {
        return Err(PipelineError::InvalidReference(format!(
            "invalid {} id '{}'",
            source_type, id
        )));
    }
    if source_type == SourceType::Bilibili && !(id.starts_with("BV") || id.starts_with("av")) {
        return Err(PipelineError::InvalidReference(format!(
            "bilibili ids start with BV or av, got '{}'",
            id
        )));
    }
    Ok(ContentRef::new(source_type, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_bilibili_urls() {
        let r = parse_source("https://www.bilibili.com/video/BV1xx411c7mD?p=1").unwrap();
        assert_eq!(r.source_type, SourceType::Bilibili);
        assert_eq!(r.source_id, "BV1xx411c7mD");

        let r = parse_source("https://www.bilibili.com/video/av170001").unwrap();
        assert_eq!(r.source_id, "av170001");

        assert!(parse_source("https://www.bilibili.com/").is_none());
    }

    #[test]
    fn test_youtube_urls() {
        for url in [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://youtu.be/dQw4w9WgXcQ",
            "https://www.youtube.com/shorts/dQw4w9WgXcQ",
            "https://www.youtube.com/watch?list=abc&v=dQw4w9WgXcQ",
        ] {
            let r = parse_source(url).unwrap();
            assert_eq!(r.source_type, SourceType::Youtube);
            assert_eq!(r.source_id, "dQw4w9WgXcQ");
        }
    }

    #[test]
    fn test_podcast_ids_are_stable_hashes() {
        let a = parse_source("https://example.com/show/feed.xml").unwrap();
        let b = parse_source("https://example.com/show/feed.xml").unwrap();
        assert_eq!(a.source_type, SourceType::Podcast);
        assert_eq!(a.source_id.len(), 12);
        assert_eq!(a.source_id, b.source_id);

        let episode = parse_source("https://example.com/show/feed.xml#ep-42").unwrap();
        assert_ne!(episode.source_id, a.source_id);

        let audio = parse_source("https://cdn.example.com/ep1.mp3").unwrap();
        assert_eq!(audio.source_type, SourceType::Podcast);
    }

    #[test]
    fn test_unsupported() {
        assert!(parse_source("https://example.com/article").is_none());
        assert!(parse_source("").is_none());
    }

    #[test]
    fn test_shorthand() {
        let r = parse_reference("bilibili:BV1xxxxxxxxxx").unwrap();
        assert_eq!(r.source_type, SourceType::Bilibili);
        assert_eq!(r.source_id, "BV1xxxxxxxxxx");
        assert!(r.url.is_none());

        assert!(parse_reference("bilibili:12345").is_err());
        assert!(parse_reference("vimeo:123").is_err());
        assert!(parse_reference("youtube:has space").is_err());
        assert!(parse_reference("nonsense").is_err());
    }
}
