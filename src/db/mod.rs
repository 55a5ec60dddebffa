//! Relational store abstraction.
//!
//! Holds tenants, users, content items, watched folders, agent runs,
//! timeline events, conversation messages and per-scope config values.

mod memory;
mod postgres;

pub use memory::InMemoryDatabase;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::agent::AgentRun;
use crate::error::DatabaseError;
use crate::models::{
    ConfigScope, ContentAnalysis, ContentItem, ContentStatus, ConversationMessage,
    NewContentItem, NewTimelineEvent, Tenant, TimelineEvent, TimelineFilter, User, UserRole,
    WatchedFolder,
};

/// Database abstraction layer.
#[async_trait]
pub trait Database: Send + Sync {
    // --- Tenants & users ---

    /// Create the tenant if it does not exist and return it.
    async fn ensure_tenant(&self, slug: &str, name: &str) -> Result<Tenant, DatabaseError>;

    async fn get_tenant_by_slug(&self, slug: &str) -> Result<Option<Tenant>, DatabaseError>;

    async fn list_tenants(&self) -> Result<Vec<Tenant>, DatabaseError>;

    async fn ensure_user(
        &self,
        tenant_id: i64,
        username: &str,
        email: &str,
        role: UserRole,
    ) -> Result<User, DatabaseError>;

    async fn get_user(&self, user_id: i64) -> Result<Option<User>, DatabaseError>;

    /// Store an already-encrypted credential on the user record.
    async fn set_user_credential(&self, user_id: i64, sealed: &str) -> Result<(), DatabaseError>;

    // --- Content items ---

    /// Insert a content item, idempotent on `(tenant_id, source_type, source_id)`.
    ///
    /// Returns the stored row and whether it was newly created.
    async fn insert_content_item(
        &self,
        item: &NewContentItem,
    ) -> Result<(ContentItem, bool), DatabaseError>;

    async fn get_content_item(&self, id: i64) -> Result<Option<ContentItem>, DatabaseError>;

    async fn find_content_item(
        &self,
        tenant_id: i64,
        source_type: &str,
        source_id: &str,
    ) -> Result<Option<ContentItem>, DatabaseError>;

    /// Newest first.
    async fn list_content_items(
        &self,
        tenant_id: i64,
        status: Option<ContentStatus>,
        limit: usize,
    ) -> Result<Vec<ContentItem>, DatabaseError>;

    /// Set the status. `error` replaces the stored error message.
    async fn update_content_status(
        &self,
        id: i64,
        status: ContentStatus,
        error: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Increment `retry_count` and return the new value.
    async fn increment_retry_count(&self, id: i64) -> Result<u32, DatabaseError>;

    async fn set_content_artifacts(
        &self,
        id: i64,
        audio_path: Option<&str>,
        transcript_path: Option<&str>,
    ) -> Result<(), DatabaseError>;

    async fn save_content_analysis(
        &self,
        id: i64,
        analysis: &ContentAnalysis,
    ) -> Result<(), DatabaseError>;

    /// Mark the item done and stamp `processed_at`.
    async fn mark_content_done(&self, id: i64) -> Result<(), DatabaseError>;

    async fn attach_content_to_folder(&self, id: i64, folder_id: i64)
    -> Result<(), DatabaseError>;

    /// Case-insensitive substring match on titles.
    async fn search_content_titles(
        &self,
        tenant_id: i64,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ContentItem>, DatabaseError>;

    /// Reset failed items with `retry_count < max_retries` back to pending.
    async fn reset_failed_items(
        &self,
        tenant_id: Option<i64>,
        max_retries: u32,
    ) -> Result<u64, DatabaseError>;

    /// Done items processed before `cutoff` that still have an audio artifact.
    async fn list_audio_for_cleanup(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ContentItem>, DatabaseError>;

    // --- Watched folders ---

    async fn add_watched_folder(
        &self,
        tenant_id: i64,
        external_id: &str,
        folder_type: &str,
        name: &str,
    ) -> Result<WatchedFolder, DatabaseError>;

    async fn list_watched_folders(
        &self,
        tenant_id: i64,
        active_only: bool,
    ) -> Result<Vec<WatchedFolder>, DatabaseError>;

    async fn touch_folder_scan(&self, folder_id: i64) -> Result<(), DatabaseError>;

    // --- Timeline ---

    async fn append_timeline_event(
        &self,
        event: &NewTimelineEvent,
    ) -> Result<TimelineEvent, DatabaseError>;

    /// Newest first, honouring `limit` and `offset`.
    async fn list_timeline_events(
        &self,
        filter: &TimelineFilter,
    ) -> Result<Vec<TimelineEvent>, DatabaseError>;

    // --- Agent runs ---

    async fn save_agent_run(&self, run: &AgentRun) -> Result<(), DatabaseError>;

    async fn get_agent_run(&self, id: Uuid) -> Result<Option<AgentRun>, DatabaseError>;

    // --- Conversations ---

    async fn append_conversation_message(
        &self,
        conversation_id: i64,
        role: &str,
        content: &str,
    ) -> Result<(), DatabaseError>;

    /// The most recent `limit` messages, oldest first.
    async fn recent_conversation_messages(
        &self,
        conversation_id: i64,
        limit: usize,
    ) -> Result<Vec<ConversationMessage>, DatabaseError>;

    // --- Config key/values ---

    async fn get_config_value(
        &self,
        scope: ConfigScope,
        key: &str,
    ) -> Result<Option<String>, DatabaseError>;

    async fn set_config_value(
        &self,
        scope: ConfigScope,
        key: &str,
        value: &str,
    ) -> Result<(), DatabaseError>;

    /// All values whose key starts with `prefix`, ordered by key.
    async fn list_config_values(
        &self,
        scope: ConfigScope,
        prefix: &str,
    ) -> Result<Vec<(String, String)>, DatabaseError>;
}
