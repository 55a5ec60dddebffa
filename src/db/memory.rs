//! In-process store used when no database URL is configured and in tests.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::Database;
use crate::agent::AgentRun;
use crate::error::DatabaseError;
use crate::models::{
    ConfigScope, ContentAnalysis, ContentItem, ContentStatus, ConversationMessage,
    NewContentItem, NewTimelineEvent, Tenant, TimelineEvent, TimelineFilter, User, UserRole,
    WatchedFolder,
};

#[derive(Default)]
struct Tables {
    tenants: Vec<Tenant>,
    users: Vec<User>,
    content: HashMap<i64, ContentItem>,
    folders: Vec<WatchedFolder>,
    timeline: Vec<TimelineEvent>,
    runs: HashMap<Uuid, AgentRun>,
    messages: HashMap<i64, Vec<ConversationMessage>>,
    config: HashMap<(&'static str, i64, String), String>,
}

/// Map-backed [`Database`] with the same uniqueness rules as the Postgres schema.
pub struct InMemoryDatabase {
    tables: RwLock<Tables>,
    next_id: AtomicI64,
    reject_analysis: AtomicBool,
}

impl Default for InMemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            next_id: AtomicI64::new(1),
            reject_analysis: AtomicBool::new(false),
        }
    }

    /// Make `save_content_analysis` fail, to exercise callers' error paths.
    pub fn reject_analysis_writes(&self, reject: bool) {
        self.reject_analysis.store(reject, Ordering::SeqCst);
    }

    fn id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>, DatabaseError> {
        self.tables
            .read()
            .map_err(|_| DatabaseError::Pool("in-memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>, DatabaseError> {
        self.tables
            .write()
            .map_err(|_| DatabaseError::Pool("in-memory store lock poisoned".to_string()))
    }

    fn with_item<F>(&self, id: i64, f: F) -> Result<(), DatabaseError>
    where
        F: FnOnce(&mut ContentItem),
    {
        let mut tables = self.write()?;
        let item = tables
            .content
            .get_mut(&id)
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "content_item".to_string(),
                id: id.to_string(),
            })?;
        f(item);
        item.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl Database for InMemoryDatabase {
    async fn ensure_tenant(&self, slug: &str, name: &str) -> Result<Tenant, DatabaseError> {
        let mut tables = self.write()?;
        if let Some(t) = tables.tenants.iter().find(|t| t.slug == slug) {
            return Ok(t.clone());
        }
        let tenant = Tenant {
            id: self.id(),
            name: name.to_string(),
            slug: slug.to_string(),
        };
        tables.tenants.push(tenant.clone());
        Ok(tenant)
    }

    async fn get_tenant_by_slug(&self, slug: &str) -> Result<Option<Tenant>, DatabaseError> {
        Ok(self.read()?.tenants.iter().find(|t| t.slug == slug).cloned())
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>, DatabaseError> {
        Ok(self.read()?.tenants.clone())
    }

    async fn ensure_user(
        &self,
        tenant_id: i64,
        username: &str,
        email: &str,
        role: UserRole,
    ) -> Result<User, DatabaseError> {
        let mut tables = self.write()?;
        if let Some(u) = tables
            .users
            .iter()
            .find(|u| u.tenant_id == tenant_id && u.username == username)
        {
            return Ok(u.clone());
        }
        let user = User {
            id: self.id(),
            tenant_id,
            username: username.to_string(),
            email: email.to_string(),
            role,
            credential: None,
        };
        tables.users.push(user.clone());
        Ok(user)
    }

    async fn get_user(&self, user_id: i64) -> Result<Option<User>, DatabaseError> {
        Ok(self.read()?.users.iter().find(|u| u.id == user_id).cloned())
    }

    async fn set_user_credential(&self, user_id: i64, sealed: &str) -> Result<(), DatabaseError> {
        let mut tables = self.write()?;
        let user = tables
            .users
            .iter_mut()
            .find(|u| u.id == user_id)
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "user".to_string(),
                id: user_id.to_string(),
            })?;
        user.credential = Some(sealed.to_string());
        Ok(())
    }

    async fn insert_content_item(
        &self,
        item: &NewContentItem,
    ) -> Result<(ContentItem, bool), DatabaseError> {
        let mut tables = self.write()?;
        if let Some(existing) = tables.content.values().find(|c| {
            c.tenant_id == item.tenant_id
                && c.source_type == item.source_type
                && c.source_id == item.source_id
        }) {
            return Ok((existing.clone(), false));
        }

        let now = Utc::now();
        let row = ContentItem {
            id: self.id(),
            tenant_id: item.tenant_id,
            source_type: item.source_type,
            source_id: item.source_id.clone(),
            title: item.title.clone(),
            author: item.author.clone(),
            duration_secs: item.duration_secs,
            cover_url: item.cover_url.clone(),
            media_url: item.media_url.clone(),
            folder_id: item.folder_id,
            status: ContentStatus::Pending,
            retry_count: 0,
            error_message: None,
            audio_path: None,
            transcript_path: None,
            analysis: None,
            created_at: now,
            updated_at: now,
            processed_at: None,
        };
        tables.content.insert(row.id, row.clone());
        Ok((row, true))
    }

    async fn get_content_item(&self, id: i64) -> Result<Option<ContentItem>, DatabaseError> {
        Ok(self.read()?.content.get(&id).cloned())
    }

    async fn find_content_item(
        &self,
        tenant_id: i64,
        source_type: &str,
        source_id: &str,
    ) -> Result<Option<ContentItem>, DatabaseError> {
        Ok(self
            .read()?
            .content
            .values()
            .find(|c| {
                c.tenant_id == tenant_id
                    && c.source_type.as_str() == source_type
                    && c.source_id == source_id
            })
            .cloned())
    }

    async fn list_content_items(
        &self,
        tenant_id: i64,
        status: Option<ContentStatus>,
        limit: usize,
    ) -> Result<Vec<ContentItem>, DatabaseError> {
        let tables = self.read()?;
        let mut items: Vec<ContentItem> = tables
            .content
            .values()
            .filter(|c| c.tenant_id == tenant_id && status.is_none_or(|s| c.status == s))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        items.truncate(limit);
        Ok(items)
    }

    async fn update_content_status(
        &self,
        id: i64,
        status: ContentStatus,
        error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        self.with_item(id, |item| {
            item.status = status;
            item.error_message = error.map(str::to_string);
        })
    }

    async fn increment_retry_count(&self, id: i64) -> Result<u32, DatabaseError> {
        let mut count = 0;
        self.with_item(id, |item| {
            item.retry_count += 1;
            count = item.retry_count;
        })?;
        Ok(count)
    }

    async fn set_content_artifacts(
        &self,
        id: i64,
        audio_path: Option<&str>,
        transcript_path: Option<&str>,
    ) -> Result<(), DatabaseError> {
        self.with_item(id, |item| {
            item.audio_path = audio_path.map(str::to_string);
            item.transcript_path = transcript_path.map(str::to_string);
        })
    }

    async fn save_content_analysis(
        &self,
        id: i64,
        analysis: &ContentAnalysis,
    ) -> Result<(), DatabaseError> {
        if self.reject_analysis.load(Ordering::SeqCst) {
            return Err(DatabaseError::Query("analysis write rejected".to_string()));
        }
        self.with_item(id, |item| item.analysis = Some(analysis.clone()))
    }

    async fn mark_content_done(&self, id: i64) -> Result<(), DatabaseError> {
        self.with_item(id, |item| {
            item.status = ContentStatus::Done;
            item.error_message = None;
            item.processed_at = Some(Utc::now());
        })
    }

    async fn attach_content_to_folder(
        &self,
        id: i64,
        folder_id: i64,
    ) -> Result<(), DatabaseError> {
        self.with_item(id, |item| item.folder_id = Some(folder_id))
    }

    async fn search_content_titles(
        &self,
        tenant_id: i64,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ContentItem>, DatabaseError> {
        let needle = query.to_lowercase();
        let tables = self.read()?;
        let mut items: Vec<ContentItem> = tables
            .content
            .values()
            .filter(|c| c.tenant_id == tenant_id && c.title.to_lowercase().contains(&needle))
            .cloned()
            .collect();
        items.sort_by_key(|c| c.id);
        items.truncate(limit);
        Ok(items)
    }

    async fn reset_failed_items(
        &self,
        tenant_id: Option<i64>,
        max_retries: u32,
    ) -> Result<u64, DatabaseError> {
        let mut tables = self.write()?;
        let mut reset = 0;
        for item in tables.content.values_mut() {
            if item.status == ContentStatus::Failed
                && item.retry_count < max_retries
                && tenant_id.is_none_or(|t| item.tenant_id == t)
            {
                item.status = ContentStatus::Pending;
                item.error_message = None;
                item.updated_at = Utc::now();
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn list_audio_for_cleanup(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ContentItem>, DatabaseError> {
        Ok(self
            .read()?
            .content
            .values()
            .filter(|c| {
                c.status == ContentStatus::Done
                    && c.audio_path.is_some()
                    && c.processed_at.is_some_and(|t| t < cutoff)
            })
            .cloned()
            .collect())
    }

    async fn add_watched_folder(
        &self,
        tenant_id: i64,
        external_id: &str,
        folder_type: &str,
        name: &str,
    ) -> Result<WatchedFolder, DatabaseError> {
        let mut tables = self.write()?;
        if let Some(f) = tables.folders.iter_mut().find(|f| {
            f.tenant_id == tenant_id && f.external_id == external_id && f.folder_type == folder_type
        }) {
            f.is_active = true;
            return Ok(f.clone());
        }
        let folder = WatchedFolder {
            id: self.id(),
            tenant_id,
            external_id: external_id.to_string(),
            folder_type: folder_type.to_string(),
            name: name.to_string(),
            is_active: true,
            last_scan_at: None,
        };
        tables.folders.push(folder.clone());
        Ok(folder)
    }

    async fn list_watched_folders(
        &self,
        tenant_id: i64,
        active_only: bool,
    ) -> Result<Vec<WatchedFolder>, DatabaseError> {
        Ok(self
            .read()?
            .folders
            .iter()
            .filter(|f| f.tenant_id == tenant_id && (!active_only || f.is_active))
            .cloned()
            .collect())
    }

    async fn touch_folder_scan(&self, folder_id: i64) -> Result<(), DatabaseError> {
        let mut tables = self.write()?;
        if let Some(f) = tables.folders.iter_mut().find(|f| f.id == folder_id) {
            f.last_scan_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn append_timeline_event(
        &self,
        event: &NewTimelineEvent,
    ) -> Result<TimelineEvent, DatabaseError> {
        let row = TimelineEvent {
            id: self.id(),
            tenant_id: event.tenant_id,
            user_id: event.user_id,
            event_type: event.event_type,
            scene: event.scene,
            content_id: event.content_id,
            conversation_id: event.conversation_id,
            title: event.title.clone(),
            context: event.context.clone(),
            created_at: Utc::now(),
        };
        self.write()?.timeline.push(row.clone());
        Ok(row)
    }

    async fn list_timeline_events(
        &self,
        filter: &TimelineFilter,
    ) -> Result<Vec<TimelineEvent>, DatabaseError> {
        let tables = self.read()?;
        let mut events: Vec<TimelineEvent> = tables
            .timeline
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(events
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .collect())
    }

    async fn save_agent_run(&self, run: &AgentRun) -> Result<(), DatabaseError> {
        self.write()?.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_agent_run(&self, id: Uuid) -> Result<Option<AgentRun>, DatabaseError> {
        Ok(self.read()?.runs.get(&id).cloned())
    }

    async fn append_conversation_message(
        &self,
        conversation_id: i64,
        role: &str,
        content: &str,
    ) -> Result<(), DatabaseError> {
        self.write()?
            .messages
            .entry(conversation_id)
            .or_default()
            .push(ConversationMessage {
                role: role.to_string(),
                content: content.to_string(),
                created_at: Utc::now(),
            });
        Ok(())
    }

    async fn recent_conversation_messages(
        &self,
        conversation_id: i64,
        limit: usize,
    ) -> Result<Vec<ConversationMessage>, DatabaseError> {
        let tables = self.read()?;
        let Some(all) = tables.messages.get(&conversation_id) else {
            return Ok(Vec::new());
        };
        let start = all.len().saturating_sub(limit);
        Ok(all[start..].to_vec())
    }

    async fn get_config_value(
        &self,
        scope: ConfigScope,
        key: &str,
    ) -> Result<Option<String>, DatabaseError> {
        Ok(self
            .read()?
            .config
            .get(&(scope.scope_type(), scope.scope_id(), key.to_string()))
            .cloned())
    }

    async fn set_config_value(
        &self,
        scope: ConfigScope,
        key: &str,
        value: &str,
    ) -> Result<(), DatabaseError> {
        self.write()?.config.insert(
            (scope.scope_type(), scope.scope_id(), key.to_string()),
            value.to_string(),
        );
        Ok(())
    }

    async fn list_config_values(
        &self,
        scope: ConfigScope,
        prefix: &str,
    ) -> Result<Vec<(String, String)>, DatabaseError> {
        let tables = self.read()?;
        let mut values: Vec<(String, String)> = tables
            .config
            .iter()
            .filter(|((kind, id, key), _)| {
                *kind == scope.scope_type() && *id == scope.scope_id() && key.starts_with(prefix)
            })
            .map(|((_, _, key), value)| (key.clone(), value.clone()))
            .collect();
        values.sort();
        Ok(values)
    }
}
