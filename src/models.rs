//! Shared record types persisted by the relational store.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Named UI context a task runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scene {
    Chat,
    Research,
    Video,
    Library,
    Timeline,
    Graph,
    Console,
}

impl Scene {
    pub const ALL: [Scene; 7] = [
        Scene::Chat,
        Scene::Research,
        Scene::Video,
        Scene::Library,
        Scene::Timeline,
        Scene::Graph,
        Scene::Console,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Research => "research",
            Self::Video => "video",
            Self::Library => "library",
            Self::Timeline => "timeline",
            Self::Graph => "graph",
            Self::Console => "console",
        }
    }
}

impl FromStr for Scene {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scene::ALL
            .into_iter()
            .find(|scene| scene.as_str() == s)
            .ok_or_else(|| format!("unknown scene '{}'", s))
    }
}

impl std::fmt::Display for Scene {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User role for tool visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    #[default]
    Normal,
    Guest,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Normal => "normal",
            Self::Guest => "guest",
        }
    }
}

impl FromStr for UserRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "normal" => Ok(Self::Normal),
            "guest" => Ok(Self::Guest),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// Platform a content item comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Bilibili,
    Youtube,
    Podcast,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bilibili => "bilibili",
            Self::Youtube => "youtube",
            Self::Podcast => "podcast",
        }
    }
}

impl FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bilibili" => Ok(Self::Bilibili),
            "youtube" => Ok(Self::Youtube),
            "podcast" => Ok(Self::Podcast),
            other => Err(format!("unknown source type '{}'", other)),
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing status of a content item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentStatus {
    Pending,
    Downloading,
    Transcribing,
    Analyzing,
    Indexing,
    Done,
    Failed,
    Cancelled,
}

impl ContentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Transcribing => "transcribing",
            Self::Analyzing => "analyzing",
            Self::Indexing => "indexing",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

impl FromStr for ContentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "downloading" => Ok(Self::Downloading),
            "transcribing" => Ok(Self::Transcribing),
            "analyzing" => Ok(Self::Analyzing),
            "indexing" => Ok(Self::Indexing),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown content status '{}'", other)),
        }
    }
}

impl std::fmt::Display for ContentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: i64,
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub tenant_id: i64,
    pub username: String,
    pub email: String,
    pub role: UserRole,
    /// Encrypted platform credential (see `crypto::SecretBox`).
    pub credential: Option<String>,
}

/// Structured output of the analyze stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentAnalysis {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub concepts: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A piece of long-form content tracked by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: i64,
    pub tenant_id: i64,
    pub source_type: SourceType,
    pub source_id: String,
    pub title: String,
    pub author: Option<String>,
    pub duration_secs: Option<i64>,
    pub cover_url: Option<String>,
    /// Where the media was found when the id alone cannot locate it (podcasts).
    pub media_url: Option<String>,
    pub folder_id: Option<i64>,
    pub status: ContentStatus,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub audio_path: Option<String>,
    pub transcript_path: Option<String>,
    pub analysis: Option<ContentAnalysis>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl ContentItem {
    /// Public URL for the item, when the platform has one.
    pub fn source_url(&self) -> Option<String> {
        match self.source_type {
            SourceType::Bilibili => Some(format!(
                "https://www.bilibili.com/video/{}",
                self.source_id
            )),
            SourceType::Youtube => Some(format!(
                "https://www.youtube.com/watch?v={}",
                self.source_id
            )),
            SourceType::Podcast => self.media_url.clone(),
        }
    }
}

/// Insert payload for a content item.
#[derive(Debug, Clone)]
pub struct NewContentItem {
    pub tenant_id: i64,
    pub source_type: SourceType,
    pub source_id: String,
    pub title: String,
    pub author: Option<String>,
    pub duration_secs: Option<i64>,
    pub cover_url: Option<String>,
    pub media_url: Option<String>,
    pub folder_id: Option<i64>,
}

impl NewContentItem {
    pub fn new(
        tenant_id: i64,
        source_type: SourceType,
        source_id: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id,
            source_type,
            source_id: source_id.into(),
            title: title.into(),
            author: None,
            duration_secs: None,
            cover_url: None,
            media_url: None,
            folder_id: None,
        }
    }
}

/// An external collection the folder watcher enumerates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchedFolder {
    pub id: i64,
    pub tenant_id: i64,
    /// Identifier on the external platform (or a local path).
    pub external_id: String,
    pub folder_type: String,
    pub name: String,
    pub is_active: bool,
    pub last_scan_at: Option<DateTime<Utc>>,
}

/// Timeline event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    VideoWatched,
    VideoProcessed,
    QuestionAsked,
    AgentRun,
    NoteCreated,
    Search,
    ContentImported,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VideoWatched => "video_watched",
            Self::VideoProcessed => "video_processed",
            Self::QuestionAsked => "question_asked",
            Self::AgentRun => "agent_run",
            Self::NoteCreated => "note_created",
            Self::Search => "search",
            Self::ContentImported => "content_imported",
        }
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "video_watched" => Ok(Self::VideoWatched),
            "video_processed" => Ok(Self::VideoProcessed),
            "question_asked" => Ok(Self::QuestionAsked),
            "agent_run" => Ok(Self::AgentRun),
            "note_created" => Ok(Self::NoteCreated),
            "search" => Ok(Self::Search),
            "content_imported" => Ok(Self::ContentImported),
            other => Err(format!("unknown event type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub id: i64,
    pub tenant_id: i64,
    pub user_id: Option<i64>,
    pub event_type: EventType,
    pub scene: Scene,
    pub content_id: Option<i64>,
    pub conversation_id: Option<i64>,
    pub title: Option<String>,
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTimelineEvent {
    pub tenant_id: i64,
    pub user_id: Option<i64>,
    pub event_type: EventType,
    pub scene: Scene,
    pub content_id: Option<i64>,
    pub conversation_id: Option<i64>,
    pub title: Option<String>,
    pub context: serde_json::Value,
}

/// Query filter for timeline events.
#[derive(Debug, Clone, Default)]
pub struct TimelineFilter {
    pub tenant_id: i64,
    pub user_id: Option<i64>,
    pub event_types: Vec<EventType>,
    pub scenes: Vec<Scene>,
    pub content_id: Option<i64>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

impl TimelineFilter {
    pub fn for_tenant(tenant_id: i64) -> Self {
        Self {
            tenant_id,
            limit: 100,
            ..Default::default()
        }
    }

    pub fn matches(&self, event: &TimelineEvent) -> bool {
        event.tenant_id == self.tenant_id
            && self.user_id.is_none_or(|u| event.user_id == Some(u))
            && (self.event_types.is_empty() || self.event_types.contains(&event.event_type))
            && (self.scenes.is_empty() || self.scenes.contains(&event.scene))
            && self.content_id.is_none_or(|c| event.content_id == Some(c))
            && self.since.is_none_or(|t| event.created_at >= t)
            && self.until.is_none_or(|t| event.created_at <= t)
    }
}

/// A stored conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Scope of a stored configuration override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigScope {
    Tenant(i64),
    User(i64),
}

impl ConfigScope {
    pub fn scope_type(&self) -> &'static str {
        match self {
            Self::Tenant(_) => "tenant",
            Self::User(_) => "user",
        }
    }

    pub fn scope_id(&self) -> i64 {
        match self {
            Self::Tenant(id) | Self::User(id) => *id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scene_round_trip() {
        for scene in Scene::ALL {
            assert_eq!(scene.as_str().parse::<Scene>().unwrap(), scene);
        }
        assert!("kitchen".parse::<Scene>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ContentStatus::Done.is_terminal());
        assert!(ContentStatus::Cancelled.is_terminal());
        assert!(!ContentStatus::Indexing.is_terminal());
    }

    #[test]
    fn test_timeline_filter_matches() {
        let event = TimelineEvent {
            id: 1,
            tenant_id: 7,
            user_id: Some(3),
            event_type: EventType::AgentRun,
            scene: Scene::Chat,
            content_id: None,
            conversation_id: None,
            title: None,
            context: serde_json::json!({}),
            created_at: Utc::now(),
        };

        let mut filter = TimelineFilter::for_tenant(7);
        assert!(filter.matches(&event));

        filter.event_types = vec![EventType::Search];
        assert!(!filter.matches(&event));

        let other_user = TimelineFilter {
            user_id: Some(4),
            ..TimelineFilter::for_tenant(7)
        };
        assert!(!other_user.matches(&event));
    }
}
