//! Folder watcher: discovers new content in watched external collections
//! and records it as `pending` content items.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::error::{DatabaseError, ErrorKind};
use crate::models::{NewContentItem, SourceType, WatchedFolder};

const API_FAVLIST: &str = "https://api.bilibili.com/x/v3/fav/resource/list";
const API_SEASON: &str = "https://api.bilibili.com/x/polymer/web-space/seasons_archives_list";
const FAVLIST_PAGE_SIZE: u32 = 20;
const SEASON_PAGE_SIZE: u32 = 100;
/// Stop paginating after this many pages even if the API says there is more.
const MAX_PAGES: u32 = 50;

#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("Folder {folder} could not be listed: {reason}")]
    Source { folder: String, reason: String },

    #[error("No source registered for folder type '{0}'")]
    UnknownFolderType(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl WatcherError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Source { .. } => ErrorKind::Network,
            Self::UnknownFolderType(_) => ErrorKind::Config,
            Self::Database(e) => e.kind(),
        }
    }
}

/// One entry found in an external collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredItem {
    pub source_type: SourceType,
    pub source_id: String,
    pub title: String,
    pub author: Option<String>,
    pub duration_secs: Option<i64>,
    pub cover_url: Option<String>,
    pub media_url: Option<String>,
}

impl DiscoveredItem {
    pub fn new(source_type: SourceType, source_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            source_type,
            source_id: source_id.into(),
            title: title.into(),
            author: None,
            duration_secs: None,
            cover_url: None,
            media_url: None,
        }
    }

    fn to_new_item(&self, tenant_id: i64, folder_id: i64) -> NewContentItem {
        NewContentItem {
            author: self.author.clone(),
            duration_secs: self.duration_secs,
            cover_url: self.cover_url.clone(),
            media_url: self.media_url.clone(),
            folder_id: Some(folder_id),
            ..NewContentItem::new(tenant_id, self.source_type, &self.source_id, &self.title)
        }
    }
}

/// Lists the contents of one kind of external collection.
#[async_trait]
pub trait FolderSource: Send + Sync {
    async fn list_items(&self, folder: &WatchedFolder) -> Result<Vec<DiscoveredItem>, WatcherError>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub folders_scanned: usize,
    pub new_items: Vec<i64>,
    pub failed_folders: Vec<String>,
}

impl ScanReport {
    fn merge(&mut self, other: ScanReport) {
        self.folders_scanned += other.folders_scanned;
        self.new_items.extend(other.new_items);
        self.failed_folders.extend(other.failed_folders);
    }
}

pub struct FolderWatcher {
    db: Arc<dyn Database>,
    sources: HashMap<String, Arc<dyn FolderSource>>,
}

impl FolderWatcher {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            db,
            sources: HashMap::new(),
        }
    }

    /// Register the source used for folders of `folder_type`.
    pub fn with_source(mut self, folder_type: impl Into<String>, source: Arc<dyn FolderSource>) -> Self {
        self.sources.insert(folder_type.into(), source);
        self
    }

    /// Bilibili favourites lists and seasons.
    pub fn with_bilibili(self, sessdata: Option<SecretString>) -> Self {
        let client = Arc::new(BilibiliClient::new(sessdata));
        self.with_source("favlist", client.clone())
            .with_source("season", client)
    }

    pub async fn add_folder(
        &self,
        tenant_id: i64,
        external_id: &str,
        folder_type: &str,
        name: &str,
    ) -> Result<WatchedFolder, WatcherError> {
        if !self.sources.contains_key(folder_type) {
            return Err(WatcherError::UnknownFolderType(folder_type.to_string()));
        }
        let folder = self
            .db
            .add_watched_folder(tenant_id, external_id, folder_type, name)
            .await?;
        tracing::info!(tenant_id, folder_id = folder.id, external_id, "Watching folder");
        Ok(folder)
    }

    /// Scan one folder. Items already known are linked to the folder when
    /// they were not linked to any.
    pub async fn scan_folder(&self, folder: &WatchedFolder) -> Result<Vec<i64>, WatcherError> {
        let source = self
            .sources
            .get(&folder.folder_type)
            .ok_or_else(|| WatcherError::UnknownFolderType(folder.folder_type.clone()))?;
        let discovered = source.list_items(folder).await?;

        let mut created = Vec::new();
        for entry in &discovered {
            let (item, is_new) = self
                .db
                .insert_content_item(&entry.to_new_item(folder.tenant_id, folder.id))
                .await?;
            if is_new {
                created.push(item.id);
            } else if item.folder_id.is_none() {
                self.db.attach_content_to_folder(item.id, folder.id).await?;
            }
        }
        self.db.touch_folder_scan(folder.id).await?;

        tracing::info!(
            tenant_id = folder.tenant_id,
            folder_id = folder.id,
            found = discovered.len(),
            new_items = created.len(),
            "Folder scanned"
        );
        Ok(created)
    }

    /// Scan every active folder of a tenant. A failing folder is logged and
    /// skipped.
    pub async fn scan_tenant(&self, tenant_id: i64) -> Result<ScanReport, WatcherError> {
        let folders = self.db.list_watched_folders(tenant_id, true).await?;
        let mut report = ScanReport::default();
        for folder in &folders {
            match self.scan_folder(folder).await {
                Ok(created) => {
                    report.folders_scanned += 1;
                    report.new_items.extend(created);
                }
                Err(e) => {
                    tracing::warn!(
                        tenant_id,
                        folder_id = folder.id,
                        kind = %e.kind(),
                        error = %e,
                        "Folder scan failed"
                    );
                    report.failed_folders.push(folder.external_id.clone());
                }
            }
        }
        Ok(report)
    }

    pub async fn scan_all(&self) -> Result<ScanReport, WatcherError> {
        let mut report = ScanReport::default();
        for tenant in self.db.list_tenants().await? {
            report.merge(self.scan_tenant(tenant.id).await?);
        }
        Ok(report)
    }
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct FavlistPage {
    #[serde(default)]
    medias: Option<Vec<FavMedia>>,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct FavMedia {
    bvid: String,
    title: String,
    #[serde(default)]
    duration: Option<i64>,
    #[serde(default)]
    cover: Option<String>,
    #[serde(default)]
    upper: Option<Upper>,
}

#[derive(Debug, Deserialize)]
struct Upper {
    name: String,
}

#[derive(Debug, Deserialize)]
struct SeasonPage {
    #[serde(default)]
    archives: Option<Vec<SeasonArchive>>,
    #[serde(default)]
    aids: Option<Vec<i64>>,
    #[serde(default)]
    meta: Option<SeasonMeta>,
}

#[derive(Debug, Deserialize)]
struct SeasonArchive {
    bvid: String,
    title: String,
    #[serde(default)]
    duration: Option<i64>,
    #[serde(default)]
    pic: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SeasonMeta {
    #[serde(default)]
    upper: Option<Upper>,
}

/// Bilibili web API client for favourites lists and seasons.
pub struct BilibiliClient {
    client: Client,
    sessdata: Option<SecretString>,
}

impl BilibiliClient {
    pub fn new(sessdata: Option<SecretString>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("Mozilla/5.0 (X11; Linux x86_64)")
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, sessdata }
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        folder: &str,
    ) -> Result<T, WatcherError> {
        let source_err = |reason: String| WatcherError::Source {
            folder: folder.to_string(),
            reason,
        };
        let mut request = self.client.get(url).query(query);
        if let Some(sessdata) = &self.sessdata {
            request = request.header(
                reqwest::header::COOKIE,
                format!("SESSDATA={}", sessdata.expose_secret()),
            );
        }
        let envelope: ApiEnvelope<T> = request
            .send()
            .await
            .map_err(|e| source_err(e.to_string()))?
            .json()
            .await
            .map_err(|e| source_err(format!("bad response: {}", e)))?;
        if envelope.code != 0 {
            return Err(source_err(format!("[{}] {}", envelope.code, envelope.message)));
        }
        envelope
            .data
            .ok_or_else(|| source_err("response has no data".to_string()))
    }

    async fn favlist(&self, media_id: &str) -> Result<Vec<DiscoveredItem>, WatcherError> {
        let mut items = Vec::new();
        for page in 1..=MAX_PAGES {
            let data: FavlistPage = self
                .get(
                    API_FAVLIST,
                    &[
                        ("media_id", media_id.to_string()),
                        ("pn", page.to_string()),
                        ("ps", FAVLIST_PAGE_SIZE.to_string()),
                    ],
                    media_id,
                )
                .await?;
            for m in data.medias.unwrap_or_default() {
                items.push(DiscoveredItem {
                    author: m.upper.map(|u| u.name),
                    duration_secs: m.duration,
                    cover_url: m.cover,
                    ..DiscoveredItem::new(SourceType::Bilibili, m.bvid, m.title)
                });
            }
            if !data.has_more {
                break;
            }
        }
        Ok(items)
    }

    async fn season(&self, season_id: &str) -> Result<Vec<DiscoveredItem>, WatcherError> {
        let mut items = Vec::new();
        let mut author: Option<String> = None;
        for page in 1..=MAX_PAGES {
            let data: SeasonPage = self
                .get(
                    API_SEASON,
                    &[
                        ("season_id", season_id.to_string()),
                        ("page_num", page.to_string()),
                        ("page_size", SEASON_PAGE_SIZE.to_string()),
                    ],
                    season_id,
                )
                .await?;
            if author.is_none() {
                author = data.meta.and_then(|m| m.upper).map(|u| u.name);
            }
            let archives = data.archives.unwrap_or_default();
            if archives.is_empty() {
                break;
            }
            for v in archives {
                items.push(DiscoveredItem {
                    author: author.clone(),
                    duration_secs: v.duration,
                    cover_url: v.pic,
                    ..DiscoveredItem::new(SourceType::Bilibili, v.bvid, v.title)
                });
            }
            let total = data.aids.map(|a| a.len()).unwrap_or(0);
            if items.len() >= total {
                break;
            }
        }
        Ok(items)
    }
}

#[async_trait]
impl FolderSource for BilibiliClient {
    async fn list_items(&self, folder: &WatchedFolder) -> Result<Vec<DiscoveredItem>, WatcherError> {
        match folder.folder_type.as_str() {
            "season" => self.season(&folder.external_id).await,
            _ => self.favlist(&folder.external_id).await,
        }
    }
}

/// In-memory folder contents keyed by external folder id.
#[derive(Default)]
pub struct MockFolderSource {
    folders: Mutex<HashMap<String, Vec<DiscoveredItem>>>,
    failing: Mutex<Vec<String>>,
}

impl MockFolderSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_items(&self, external_id: &str, items: Vec<DiscoveredItem>) {
        self.folders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(external_id.to_string(), items);
    }

    pub fn fail(&self, external_id: &str) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(external_id.to_string());
    }
}

#[async_trait]
impl FolderSource for MockFolderSource {
    async fn list_items(&self, folder: &WatchedFolder) -> Result<Vec<DiscoveredItem>, WatcherError> {
        let failing = self
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&folder.external_id);
        if failing {
            return Err(WatcherError::Source {
                folder: folder.external_id.clone(),
                reason: "unreachable".to_string(),
            });
        }
        Ok(self
            .folders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&folder.external_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryDatabase;
    use crate::models::ContentStatus;
    use pretty_assertions::assert_eq;

    async fn setup() -> (Arc<InMemoryDatabase>, Arc<MockFolderSource>, FolderWatcher, i64) {
        let db = Arc::new(InMemoryDatabase::new());
        let tenant = db.ensure_tenant("default", "Default").await.unwrap();
        let source = Arc::new(MockFolderSource::new());
        let watcher = FolderWatcher::new(db.clone()).with_source("favlist", source.clone());
        (db, source, watcher, tenant.id)
    }

    #[tokio::test]
    async fn test_scan_inserts_only_new_items() {
        let (db, source, watcher, tenant) = setup().await;
        watcher.add_folder(tenant, "123", "favlist", "Later").await.unwrap();
        source.set_items(
            "123",
            vec![
                DiscoveredItem::new(SourceType::Bilibili, "BV1aaaaaaaaa", "One"),
                DiscoveredItem::new(SourceType::Bilibili, "BV1bbbbbbbbb", "Two"),
            ],
        );

        let first = watcher.scan_tenant(tenant).await.unwrap();
        assert_eq!(first.new_items.len(), 2);
        assert_eq!(first.folders_scanned, 1);

        let second = watcher.scan_all().await.unwrap();
        assert!(second.new_items.is_empty());

        let pending = db
            .list_content_items(tenant, Some(ContentStatus::Pending), 10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|i| i.folder_id.is_some()));
    }

    #[tokio::test]
    async fn test_failing_folder_is_skipped() {
        let (_db, source, watcher, tenant) = setup().await;
        watcher.add_folder(tenant, "bad", "favlist", "Broken").await.unwrap();
        watcher.add_folder(tenant, "good", "favlist", "Fine").await.unwrap();
        source.fail("bad");
        source.set_items(
            "good",
            vec![DiscoveredItem::new(SourceType::Youtube, "dQw4w9WgXcQ", "Song")],
        );

        let report = watcher.scan_tenant(tenant).await.unwrap();
        assert_eq!(report.failed_folders, vec!["bad".to_string()]);
        assert_eq!(report.new_items.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_folder_type() {
        let (_db, _source, watcher, tenant) = setup().await;
        let err = watcher.add_folder(tenant, "1", "playlist", "X").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
