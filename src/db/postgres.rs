//! PostgreSQL store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, Pool, Runtime};
use secrecy::{ExposeSecret, SecretString};
use tokio_postgres::{NoTls, Row};
use uuid::Uuid;

use super::Database;
use crate::agent::AgentRun;
use crate::error::DatabaseError;
use crate::models::{
    ConfigScope, ContentAnalysis, ContentItem, ContentStatus, ConversationMessage, EventType,
    NewContentItem, NewTimelineEvent, Scene, SourceType, Tenant, TimelineEvent, TimelineFilter,
    User, UserRole, WatchedFolder,
};

mod embedded {
    refinery::embed_migrations!("migrations");
}

const CONTENT_COLUMNS: &str = "id, tenant_id, source_type, source_id, title, author, \
     duration_secs, cover_url, media_url, folder_id, status, retry_count, error_message, audio_path, \
     transcript_path, analysis, created_at, updated_at, processed_at";

const TIMELINE_COLUMNS: &str = "id, tenant_id, user_id, event_type, scene, content_id, \
     conversation_id, title, context, created_at";

/// Database store backed by a deadpool connection pool.
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    /// Create a new store and connect to the database.
    pub async fn new(url: &SecretString, pool_size: usize) -> Result<Self, DatabaseError> {
        let mut cfg = Config::new();
        cfg.url = Some(url.expose_secret().to_string());
        cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: pool_size,
            ..Default::default()
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| DatabaseError::Pool(e.to_string()))?;

        // Test connection
        let _ = pool.get().await?;

        Ok(Self { pool })
    }

    /// Apply the embedded schema migrations.
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let mut conn = self.conn().await?;
        let client: &mut tokio_postgres::Client = &mut conn;
        let report = embedded::migrations::runner()
            .run_async(client)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        tracing::info!(
            applied = report.applied_migrations().len(),
            "Database migrations complete"
        );
        Ok(())
    }

    /// Get a connection from the pool.
    pub async fn conn(&self) -> Result<deadpool_postgres::Object, DatabaseError> {
        Ok(self.pool.get().await?)
    }

    /// Clone of the pool, shared with the vector index.
    pub fn pool(&self) -> Pool {
        self.pool.clone()
    }

    async fn update_item(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
        id: i64,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        let n = conn.execute(sql, params).await?;
        if n == 0 {
            return Err(DatabaseError::NotFound {
                entity: "content_item".to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

fn parse_col<T: std::str::FromStr<Err = String>>(row: &Row, col: &str) -> Result<T, DatabaseError> {
    let raw: String = row.get(col);
    raw.parse().map_err(DatabaseError::Serialization)
}

fn row_to_tenant(row: &Row) -> Tenant {
    Tenant {
        id: row.get("id"),
        name: row.get("name"),
        slug: row.get("slug"),
    }
}

fn row_to_user(row: &Row) -> Result<User, DatabaseError> {
    Ok(User {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        username: row.get("username"),
        email: row.get("email"),
        role: parse_col::<UserRole>(row, "role")?,
        credential: row.get("credential"),
    })
}

fn row_to_content(row: &Row) -> Result<ContentItem, DatabaseError> {
    let analysis: Option<serde_json::Value> = row.get("analysis");
    let analysis = analysis
        .map(serde_json::from_value::<ContentAnalysis>)
        .transpose()
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

    Ok(ContentItem {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        source_type: parse_col::<SourceType>(row, "source_type")?,
        source_id: row.get("source_id"),
        title: row.get("title"),
        author: row.get("author"),
        duration_secs: row.get("duration_secs"),
        cover_url: row.get("cover_url"),
        media_url: row.get("media_url"),
        folder_id: row.get("folder_id"),
        status: parse_col::<ContentStatus>(row, "status")?,
        retry_count: row.get::<_, i32>("retry_count").max(0) as u32,
        error_message: row.get("error_message"),
        audio_path: row.get("audio_path"),
        transcript_path: row.get("transcript_path"),
        analysis,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        processed_at: row.get("processed_at"),
    })
}

fn row_to_folder(row: &Row) -> WatchedFolder {
    WatchedFolder {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        external_id: row.get("external_id"),
        folder_type: row.get("folder_type"),
        name: row.get("name"),
        is_active: row.get("is_active"),
        last_scan_at: row.get("last_scan_at"),
    }
}

fn row_to_event(row: &Row) -> Result<TimelineEvent, DatabaseError> {
    Ok(TimelineEvent {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        user_id: row.get("user_id"),
        event_type: parse_col::<EventType>(row, "event_type")?,
        scene: parse_col::<Scene>(row, "scene")?,
        content_id: row.get("content_id"),
        conversation_id: row.get("conversation_id"),
        title: row.get("title"),
        context: row.get("context"),
        created_at: row.get("created_at"),
    })
}

#[async_trait]
impl Database for PgStore {
    async fn ensure_tenant(&self, slug: &str, name: &str) -> Result<Tenant, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                r#"
                INSERT INTO tenants (slug, name) VALUES ($1, $2)
                ON CONFLICT (slug) DO UPDATE SET slug = EXCLUDED.slug
                RETURNING id, name, slug
                "#,
                &[&slug, &name],
            )
            .await?;
        Ok(row_to_tenant(&row))
    }

    async fn get_tenant_by_slug(&self, slug: &str) -> Result<Option<Tenant>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt("SELECT id, name, slug FROM tenants WHERE slug = $1", &[&slug])
            .await?;
        Ok(row.as_ref().map(row_to_tenant))
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query("SELECT id, name, slug FROM tenants ORDER BY id", &[])
            .await?;
        Ok(rows.iter().map(row_to_tenant).collect())
    }

    async fn ensure_user(
        &self,
        tenant_id: i64,
        username: &str,
        email: &str,
        role: UserRole,
    ) -> Result<User, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                r#"
                INSERT INTO users (tenant_id, username, email, role) VALUES ($1, $2, $3, $4)
                ON CONFLICT (tenant_id, username) DO UPDATE SET username = EXCLUDED.username
                RETURNING id, tenant_id, username, email, role, credential
                "#,
                &[&tenant_id, &username, &email, &role.as_str()],
            )
            .await?;
        row_to_user(&row)
    }

    async fn get_user(&self, user_id: i64) -> Result<Option<User>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT id, tenant_id, username, email, role, credential FROM users WHERE id = $1",
                &[&user_id],
            )
            .await?;
        row.as_ref().map(row_to_user).transpose()
    }

    async fn set_user_credential(&self, user_id: i64, sealed: &str) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        let n = conn
            .execute(
                "UPDATE users SET credential = $2 WHERE id = $1",
                &[&user_id, &sealed],
            )
            .await?;
        if n == 0 {
            return Err(DatabaseError::NotFound {
                entity: "user".to_string(),
                id: user_id.to_string(),
            });
        }
        Ok(())
    }

    async fn insert_content_item(
        &self,
        item: &NewContentItem,
    ) -> Result<(ContentItem, bool), DatabaseError> {
        let conn = self.conn().await?;
        let inserted = conn
            .query_opt(
                &format!(
                    r#"
                    INSERT INTO content_items
                        (tenant_id, source_type, source_id, title, author, duration_secs,
                         cover_url, media_url, folder_id, status)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending')
                    ON CONFLICT (tenant_id, source_type, source_id) DO NOTHING
                    RETURNING {CONTENT_COLUMNS}
                    "#
                ),
                &[
                    &item.tenant_id,
                    &item.source_type.as_str(),
                    &item.source_id,
                    &item.title,
                    &item.author,
                    &item.duration_secs,
                    &item.cover_url,
                    &item.media_url,
                    &item.folder_id,
                ],
            )
            .await?;

        if let Some(row) = inserted {
            return Ok((row_to_content(&row)?, true));
        }

        let existing = self
            .find_content_item(item.tenant_id, item.source_type.as_str(), &item.source_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "content_item".to_string(),
                id: item.source_id.clone(),
            })?;
        Ok((existing, false))
    }

    async fn get_content_item(&self, id: i64) -> Result<Option<ContentItem>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!("SELECT {CONTENT_COLUMNS} FROM content_items WHERE id = $1"),
                &[&id],
            )
            .await?;
        row.as_ref().map(row_to_content).transpose()
    }

    async fn find_content_item(
        &self,
        tenant_id: i64,
        source_type: &str,
        source_id: &str,
    ) -> Result<Option<ContentItem>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT {CONTENT_COLUMNS} FROM content_items \
                     WHERE tenant_id = $1 AND source_type = $2 AND source_id = $3"
                ),
                &[&tenant_id, &source_type, &source_id],
            )
            .await?;
        row.as_ref().map(row_to_content).transpose()
    }

    async fn list_content_items(
        &self,
        tenant_id: i64,
        status: Option<ContentStatus>,
        limit: usize,
    ) -> Result<Vec<ContentItem>, DatabaseError> {
        let conn = self.conn().await?;
        let status = status.map(|s| s.as_str());
        let rows = conn
            .query(
                &format!(
                    "SELECT {CONTENT_COLUMNS} FROM content_items \
                     WHERE tenant_id = $1 AND ($2::TEXT IS NULL OR status = $2) \
                     ORDER BY created_at DESC, id DESC LIMIT $3"
                ),
                &[&tenant_id, &status, &(limit as i64)],
            )
            .await?;
        rows.iter().map(row_to_content).collect()
    }

    async fn update_content_status(
        &self,
        id: i64,
        status: ContentStatus,
        error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        self.update_item(
            "UPDATE content_items SET status = $2, error_message = $3, updated_at = NOW() \
             WHERE id = $1",
            &[&id, &status.as_str(), &error],
            id,
        )
        .await
    }

    async fn increment_retry_count(&self, id: i64) -> Result<u32, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "UPDATE content_items SET retry_count = retry_count + 1, updated_at = NOW() \
                 WHERE id = $1 RETURNING retry_count",
                &[&id],
            )
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "content_item".to_string(),
                id: id.to_string(),
            })?;
        Ok(row.get::<_, i32>("retry_count").max(0) as u32)
    }

    async fn set_content_artifacts(
        &self,
        id: i64,
        audio_path: Option<&str>,
        transcript_path: Option<&str>,
    ) -> Result<(), DatabaseError> {
        self.update_item(
            "UPDATE content_items SET audio_path = $2, transcript_path = $3, updated_at = NOW() \
             WHERE id = $1",
            &[&id, &audio_path, &transcript_path],
            id,
        )
        .await
    }

    async fn save_content_analysis(
        &self,
        id: i64,
        analysis: &ContentAnalysis,
    ) -> Result<(), DatabaseError> {
        let value = serde_json::to_value(analysis)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.update_item(
            "UPDATE content_items SET analysis = $2, updated_at = NOW() WHERE id = $1",
            &[&id, &value],
            id,
        )
        .await
    }

    async fn mark_content_done(&self, id: i64) -> Result<(), DatabaseError> {
        self.update_item(
            "UPDATE content_items SET status = 'done', error_message = NULL, \
             processed_at = NOW(), updated_at = NOW() WHERE id = $1",
            &[&id],
            id,
        )
        .await
    }

    async fn attach_content_to_folder(
        &self,
        id: i64,
        folder_id: i64,
    ) -> Result<(), DatabaseError> {
        self.update_item(
            "UPDATE content_items SET folder_id = $2, updated_at = NOW() WHERE id = $1",
            &[&id, &folder_id],
            id,
        )
        .await
    }

    async fn search_content_titles(
        &self,
        tenant_id: i64,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ContentItem>, DatabaseError> {
        let conn = self.conn().await?;
        let pattern = format!("%{}%", query);
        let rows = conn
            .query(
                &format!(
                    "SELECT {CONTENT_COLUMNS} FROM content_items \
                     WHERE tenant_id = $1 AND title ILIKE $2 ORDER BY id LIMIT $3"
                ),
                &[&tenant_id, &pattern, &(limit as i64)],
            )
            .await?;
        rows.iter().map(row_to_content).collect()
    }

    async fn reset_failed_items(
        &self,
        tenant_id: Option<i64>,
        max_retries: u32,
    ) -> Result<u64, DatabaseError> {
        let conn = self.conn().await?;
        let n = conn
            .execute(
                "UPDATE content_items SET status = 'pending', error_message = NULL, \
                 updated_at = NOW() \
                 WHERE status = 'failed' AND retry_count < $1 \
                 AND ($2::BIGINT IS NULL OR tenant_id = $2)",
                &[&(max_retries as i32), &tenant_id],
            )
            .await?;
        Ok(n)
    }

    async fn list_audio_for_cleanup(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ContentItem>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {CONTENT_COLUMNS} FROM content_items \
                     WHERE status = 'done' AND audio_path IS NOT NULL AND processed_at < $1"
                ),
                &[&cutoff],
            )
            .await?;
        rows.iter().map(row_to_content).collect()
    }

    async fn add_watched_folder(
        &self,
        tenant_id: i64,
        external_id: &str,
        folder_type: &str,
        name: &str,
    ) -> Result<WatchedFolder, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                r#"
                INSERT INTO watched_folders (tenant_id, external_id, folder_type, name)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (tenant_id, external_id, folder_type) DO UPDATE SET is_active = TRUE
                RETURNING id, tenant_id, external_id, folder_type, name, is_active, last_scan_at
                "#,
                &[&tenant_id, &external_id, &folder_type, &name],
            )
            .await?;
        Ok(row_to_folder(&row))
    }

    async fn list_watched_folders(
        &self,
        tenant_id: i64,
        active_only: bool,
    ) -> Result<Vec<WatchedFolder>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT id, tenant_id, external_id, folder_type, name, is_active, last_scan_at \
                 FROM watched_folders WHERE tenant_id = $1 AND (NOT $2 OR is_active) ORDER BY id",
                &[&tenant_id, &active_only],
            )
            .await?;
        Ok(rows.iter().map(row_to_folder).collect())
    }

    async fn touch_folder_scan(&self, folder_id: i64) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE watched_folders SET last_scan_at = NOW() WHERE id = $1",
            &[&folder_id],
        )
        .await?;
        Ok(())
    }

    async fn append_timeline_event(
        &self,
        event: &NewTimelineEvent,
    ) -> Result<TimelineEvent, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                &format!(
                    r#"
                    INSERT INTO timeline_events
                        (tenant_id, user_id, event_type, scene, content_id, conversation_id,
                         title, context)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    RETURNING {TIMELINE_COLUMNS}
                    "#
                ),
                &[
                    &event.tenant_id,
                    &event.user_id,
                    &event.event_type.as_str(),
                    &event.scene.as_str(),
                    &event.content_id,
                    &event.conversation_id,
                    &event.title,
                    &event.context,
                ],
            )
            .await?;
        row_to_event(&row)
    }

    async fn list_timeline_events(
        &self,
        filter: &TimelineFilter,
    ) -> Result<Vec<TimelineEvent>, DatabaseError> {
        let conn = self.conn().await?;
        let types: Vec<&str> = filter.event_types.iter().map(|t| t.as_str()).collect();
        let scenes: Vec<&str> = filter.scenes.iter().map(|s| s.as_str()).collect();
        let rows = conn
            .query(
                &format!(
                    "SELECT {TIMELINE_COLUMNS} FROM timeline_events \
                     WHERE tenant_id = $1 \
                     AND ($2::BIGINT IS NULL OR user_id = $2) \
                     AND (cardinality($3::TEXT[]) = 0 OR event_type = ANY($3)) \
                     AND (cardinality($4::TEXT[]) = 0 OR scene = ANY($4)) \
                     AND ($5::BIGINT IS NULL OR content_id = $5) \
                     AND ($6::TIMESTAMPTZ IS NULL OR created_at >= $6) \
                     AND ($7::TIMESTAMPTZ IS NULL OR created_at <= $7) \
                     ORDER BY created_at DESC, id DESC LIMIT $8 OFFSET $9"
                ),
                &[
                    &filter.tenant_id,
                    &filter.user_id,
                    &types,
                    &scenes,
                    &filter.content_id,
                    &filter.since,
                    &filter.until,
                    &(filter.limit as i64),
                    &(filter.offset as i64),
                ],
            )
            .await?;
        rows.iter().map(row_to_event).collect()
    }

    async fn save_agent_run(&self, run: &AgentRun) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        let body =
            serde_json::to_value(run).map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let error_code = run.error_code.map(|k| k.as_str());
        conn.execute(
            r#"
            INSERT INTO agent_runs
                (id, tenant_id, user_id, scene, strategy, answer, error_code, body, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                answer = EXCLUDED.answer,
                error_code = EXCLUDED.error_code,
                body = EXCLUDED.body
            "#,
            &[
                &run.id,
                &run.tenant_id,
                &run.user_id,
                &run.scene.as_str(),
                &run.strategy,
                &run.answer,
                &error_code,
                &body,
                &run.created_at,
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_agent_run(&self, id: Uuid) -> Result<Option<AgentRun>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt("SELECT body FROM agent_runs WHERE id = $1", &[&id])
            .await?;
        row.map(|r| {
            serde_json::from_value(r.get("body"))
                .map_err(|e| DatabaseError::Serialization(e.to_string()))
        })
        .transpose()
    }

    async fn append_conversation_message(
        &self,
        conversation_id: i64,
        role: &str,
        content: &str,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO conversation_messages (conversation_id, role, content) VALUES ($1, $2, $3)",
            &[&conversation_id, &role, &content],
        )
        .await?;
        Ok(())
    }

    async fn recent_conversation_messages(
        &self,
        conversation_id: i64,
        limit: usize,
    ) -> Result<Vec<ConversationMessage>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                r#"
                SELECT role, content, created_at FROM (
                    SELECT id, role, content, created_at FROM conversation_messages
                    WHERE conversation_id = $1 ORDER BY id DESC LIMIT $2
                ) recent ORDER BY id ASC
                "#,
                &[&conversation_id, &(limit as i64)],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| ConversationMessage {
                role: row.get("role"),
                content: row.get("content"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    async fn get_config_value(
        &self,
        scope: ConfigScope,
        key: &str,
    ) -> Result<Option<String>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT value FROM config_values \
                 WHERE scope_type = $1 AND scope_id = $2 AND key = $3",
                &[&scope.scope_type(), &scope.scope_id(), &key],
            )
            .await?;
        Ok(row.map(|r| r.get("value")))
    }

    async fn set_config_value(
        &self,
        scope: ConfigScope,
        key: &str,
        value: &str,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            r#"
            INSERT INTO config_values (scope_type, scope_id, key, value) VALUES ($1, $2, $3, $4)
            ON CONFLICT (scope_type, scope_id, key) DO UPDATE SET
                value = EXCLUDED.value, updated_at = NOW()
            "#,
            &[&scope.scope_type(), &scope.scope_id(), &key, &value],
        )
        .await?;
        Ok(())
    }

    async fn list_config_values(
        &self,
        scope: ConfigScope,
        prefix: &str,
    ) -> Result<Vec<(String, String)>, DatabaseError> {
        let conn = self.conn().await?;
        let pattern = format!("{}%", prefix);
        let rows = conn
            .query(
                "SELECT key, value FROM config_values \
                 WHERE scope_type = $1 AND scope_id = $2 AND key LIKE $3 ORDER BY key",
                &[&scope.scope_type(), &scope.scope_id(), &pattern],
            )
            .await?;
        Ok(rows.iter().map(|r| (r.get("key"), r.get("value"))).collect())
    }
}
