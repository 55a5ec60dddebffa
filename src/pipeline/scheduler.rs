//! Worker scheduler: periodic folder scans, pending-item drain, the daily
//! failed-item sweep and audio cleanup.
//!
//! Each job keeps its own consecutive-failure count. Failures are logged
//! and the loop keeps going.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio_util::sync::CancellationToken;

use crate::config::{SweepSettings, WatcherSettings};
use crate::db::Database;
use crate::error::{ConfigError, Error};
use crate::models::ContentStatus;
use crate::pipeline::queue::ProcessingQueue;
use crate::watcher::{FolderWatcher, WatcherError};

/// Consecutive failures after which a job logs at error level.
const ALERT_AFTER_FAILURES: u32 = 3;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub scan_interval: Duration,
    pub drain_interval: Duration,
    pub drain_batch: usize,
    pub sweep_schedule: Schedule,
    pub max_retries: u32,
    pub cleanup_schedule: Schedule,
    pub audio_retention: chrono::Duration,
}

impl SchedulerConfig {
    pub fn from_settings(watcher: &WatcherSettings, sweep: &SweepSettings) -> Result<Self, ConfigError> {
        let parse = |expr: &str| {
            Schedule::from_str(expr)
                .map_err(|e| ConfigError::Invalid(format!("bad cron expression '{}': {}", expr, e)))
        };
        Ok(Self {
            scan_interval: Duration::from_secs(watcher.interval_secs.max(1)),
            drain_interval: Duration::from_secs(watcher.drain_interval_secs.max(1)),
            drain_batch: watcher.process_batch.max(1),
            sweep_schedule: parse(&sweep.schedule)?,
            max_retries: sweep.max_retries,
            cleanup_schedule: parse(&sweep.cleanup_schedule)?,
            audio_retention: chrono::Duration::days(sweep.audio_retention_days.clamp(0, crate::context::MAX_DAYS)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    ScanFolders,
    DrainPending,
    RetrySweep,
    AudioCleanup,
}

impl Job {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ScanFolders => "scan_folders",
            Self::DrainPending => "drain_pending",
            Self::RetrySweep => "retry_sweep",
            Self::AudioCleanup => "audio_cleanup",
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct JobHealth {
    consecutive_failures: u32,
}

impl JobHealth {
    fn record(&mut self, job: Job, result: Result<usize, Error>) {
        match result {
            Ok(count) => {
                if self.consecutive_failures > 0 {
                    tracing::info!(job = job.as_str(), "Job recovered");
                }
                self.consecutive_failures = 0;
                tracing::debug!(job = job.as_str(), count, "Job finished");
            }
            Err(error) => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= ALERT_AFTER_FAILURES {
                    tracing::error!(
                        job = job.as_str(),
                        kind = %error.kind(),
                        consecutive_failures = self.consecutive_failures,
                        "Job keeps failing: {}",
                        error
                    );
                } else {
                    tracing::warn!(job = job.as_str(), kind = %error.kind(), "Job failed: {}", error);
                }
            }
        }
    }
}

fn next_after(schedule: &Schedule, now: DateTime<Utc>) -> Duration {
    schedule
        .after(&now)
        .next()
        .and_then(|at| (at - now).to_std().ok())
        .unwrap_or(Duration::from_secs(24 * 60 * 60))
}

pub struct Scheduler {
    config: SchedulerConfig,
    db: Arc<dyn Database>,
    queue: Arc<ProcessingQueue>,
    watcher: Option<Arc<FolderWatcher>>,
    health: [JobHealth; 4],
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, db: Arc<dyn Database>, queue: Arc<ProcessingQueue>) -> Self {
        Self {
            config,
            db,
            queue,
            watcher: None,
            health: [JobHealth::default(); 4],
        }
    }

    pub fn with_watcher(mut self, watcher: Arc<FolderWatcher>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub fn consecutive_failures(&self, job: Job) -> u32 {
        self.health[job as usize].consecutive_failures
    }

    /// Discover new items in watched folders.
    pub async fn scan_folders(&self) -> Result<usize, Error> {
        let Some(watcher) = &self.watcher else {
            return Ok(0);
        };
        let report = watcher.scan_all().await?;
        if !report.new_items.is_empty() {
            tracing::info!(new_items = report.new_items.len(), "New content discovered");
        }
        if report.failed_folders.is_empty() {
            Ok(report.new_items.len())
        } else {
            Err(WatcherError::Source {
                folder: report.failed_folders.join(", "),
                reason: "listing failed".to_string(),
            }
            .into())
        }
    }

    /// Feed pending items of every tenant into the processing queue.
    pub async fn drain_pending(&self) -> Result<usize, Error> {
        let tenants = self.db.list_tenants().await?;
        let mut submitted = 0;
        for tenant in tenants {
            let pending = self
                .db
                .list_content_items(tenant.id, Some(ContentStatus::Pending), self.config.drain_batch)
                .await?;
            for item in pending {
                if self.queue.submit(item.id, None) {
                    submitted += 1;
                }
            }
        }
        Ok(submitted)
    }

    /// Reset retryable failed items to pending.
    pub async fn retry_sweep(&self) -> Result<usize, Error> {
        let reset = self
            .db
            .reset_failed_items(None, self.config.max_retries)
            .await?;
        tracing::info!(reset, max_retries = self.config.max_retries, "Failed items reset");
        Ok(reset as usize)
    }

    pub async fn audio_cleanup(&self) -> Result<usize, Error> {
        Ok(self
            .queue
            .engine()
            .cleanup_audio(self.config.audio_retention)
            .await?)
    }

    pub async fn run_job(&mut self, job: Job) {
        let result = match job {
            Job::ScanFolders => self.scan_folders().await,
            Job::DrainPending => self.drain_pending().await,
            Job::RetrySweep => self.retry_sweep().await,
            Job::AudioCleanup => self.audio_cleanup().await,
        };
        self.health[job as usize].record(job, result);
    }

    /// Run until `shutdown` fires.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        tracing::info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            drain_interval_secs = self.config.drain_interval.as_secs(),
            "Starting worker scheduler"
        );

        let mut scan = tokio::time::interval(self.config.scan_interval);
        let mut drain = tokio::time::interval(self.config.drain_interval);
        scan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        drain.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let sweep = tokio::time::sleep(next_after(&self.config.sweep_schedule, Utc::now()));
        let cleanup = tokio::time::sleep(next_after(&self.config.cleanup_schedule, Utc::now()));
        tokio::pin!(sweep, cleanup);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Worker scheduler stopping");
                    break;
                }
                _ = scan.tick() => self.run_job(Job::ScanFolders).await,
                _ = drain.tick() => self.run_job(Job::DrainPending).await,
                _ = &mut sweep => {
                    self.run_job(Job::RetrySweep).await;
                    let next = next_after(&self.config.sweep_schedule, Utc::now());
                    sweep.as_mut().reset(tokio::time::Instant::now() + next);
                }
                _ = &mut cleanup => {
                    self.run_job(Job::AudioCleanup).await;
                    let next = next_after(&self.config.cleanup_schedule, Utc::now());
                    cleanup.as_mut().reset(tokio::time::Instant::now() + next);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryDatabase;
    use crate::error::ErrorKind;
    use crate::models::{NewContentItem, SourceType};
    use crate::pipeline::artifacts::ArtifactStore;
    use crate::pipeline::engine::PipelineEngine;
    use crate::pipeline::queue::QueueStatus;
    use crate::pipeline::stages::{StubDownloader, StubTranscriber};
    use crate::retrieval::{InMemoryVectorIndex, MockEmbeddings, VectorRetrieval};
    use crate::watcher::{DiscoveredItem, MockFolderSource};

    fn config() -> SchedulerConfig {
        SchedulerConfig::from_settings(&WatcherSettings::default(), &SweepSettings::default()).unwrap()
    }

    fn scheduler(db: Arc<InMemoryDatabase>, dir: &std::path::Path) -> Scheduler {
        let engine = PipelineEngine::new(
            db.clone(),
            Arc::new(VectorRetrieval::new(
                Arc::new(InMemoryVectorIndex::new()),
                Arc::new(MockEmbeddings::new(16)),
            )),
            ArtifactStore::new(dir),
            Arc::new(StubDownloader::new()),
            Arc::new(StubTranscriber::new("scheduled")),
        );
        Scheduler::new(config(), db, ProcessingQueue::new(Arc::new(engine), 2))
    }

    #[test]
    fn test_default_schedules_parse() {
        let cfg = config();
        let wait = next_after(&cfg.sweep_schedule, Utc::now());
        assert!(wait <= Duration::from_secs(24 * 60 * 60));
        assert!(SchedulerConfig::from_settings(
            &WatcherSettings::default(),
            &SweepSettings {
                schedule: "not cron".into(),
                ..SweepSettings::default()
            }
        )
        .is_err());
    }

    #[tokio::test]
    async fn test_scan_then_drain() {
        let db = Arc::new(InMemoryDatabase::new());
        let tenant = db.ensure_tenant("default", "Default").await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(MockFolderSource::new());
        source.set_items(
            "42",
            vec![DiscoveredItem::new(SourceType::Bilibili, "BV1ccccccccc", "Queued")],
        );
        let watcher = FolderWatcher::new(db.clone()).with_source("favlist", source);
        watcher.add_folder(tenant.id, "42", "favlist", "Later").await.unwrap();

        let mut scheduler = scheduler(db.clone(), dir.path()).with_watcher(Arc::new(watcher));
        assert_eq!(scheduler.scan_folders().await.unwrap(), 1);
        assert_eq!(scheduler.drain_pending().await.unwrap(), 1);

        let item = db
            .find_content_item(tenant.id, "bilibili", "BV1ccccccccc")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            scheduler.queue.wait_for(item.id, Duration::from_secs(5)).await,
            Some(QueueStatus::Completed)
        );
        scheduler.run_job(Job::DrainPending).await;
        assert_eq!(scheduler.consecutive_failures(Job::DrainPending), 0);
    }

    #[tokio::test]
    async fn test_retry_sweep_respects_max_retries() {
        let db = Arc::new(InMemoryDatabase::new());
        let tenant = db.ensure_tenant("default", "Default").await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut ids = Vec::new();
        for (i, retries) in [1u32, 5].iter().enumerate() {
            let (item, _) = db
                .insert_content_item(&NewContentItem::new(tenant.id, SourceType::Youtube, format!("id{:09}", i), "t"))
                .await
                .unwrap();
            for _ in 0..*retries {
                db.increment_retry_count(item.id).await.unwrap();
            }
            db.update_content_status(item.id, ContentStatus::Failed, Some("boom"))
                .await
                .unwrap();
            ids.push(item.id);
        }

        let scheduler = scheduler(db.clone(), dir.path());
        assert_eq!(scheduler.retry_sweep().await.unwrap(), 1);
        let first = db.get_content_item(ids[0]).await.unwrap().unwrap();
        let second = db.get_content_item(ids[1]).await.unwrap().unwrap();
        assert_eq!(first.status, ContentStatus::Pending);
        assert_eq!(second.status, ContentStatus::Failed);
    }

    #[tokio::test]
    async fn test_failures_are_counted() {
        let db = Arc::new(InMemoryDatabase::new());
        let tenant = db.ensure_tenant("default", "Default").await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(MockFolderSource::new());
        source.fail("down");
        let watcher = FolderWatcher::new(db.clone()).with_source("favlist", source);
        watcher.add_folder(tenant.id, "down", "favlist", "X").await.unwrap();

        let mut scheduler = scheduler(db, dir.path()).with_watcher(Arc::new(watcher));
        let err = scheduler.scan_folders().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
        assert!(err.to_string().contains("down"));

        scheduler.run_job(Job::ScanFolders).await;
        scheduler.run_job(Job::ScanFolders).await;
        assert_eq!(scheduler.consecutive_failures(Job::ScanFolders), 2);
    }
}
