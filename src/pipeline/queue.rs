//! Bounded-parallel processing queue.
//!
//! At most `max_parallel` items run at once; the rest wait for a permit.
//! One process-wide queue is kept behind [`ProcessingQueue::global`], but
//! queues can also be built directly for tests and embedding.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::PipelineError;
use crate::models::ContentStatus;
use crate::pipeline::engine::PipelineEngine;

pub const DEFAULT_MAX_PARALLEL: usize = 2;

/// How long finished entries stay visible to `status` and `wait_for`.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(600);

static GLOBAL_QUEUE: OnceLock<Arc<ProcessingQueue>> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl QueueStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueInfo {
    pub max_parallel: usize,
    pub running: usize,
    pub queued: usize,
    pub total: usize,
}

struct Entry {
    generation: u64,
    status: QueueStatus,
    user_id: Option<i64>,
    cancel: CancellationToken,
    error: Option<String>,
    finished_at: Option<Instant>,
}

pub struct ProcessingQueue {
    engine: Arc<PipelineEngine>,
    max_parallel: usize,
    retention: Duration,
    generations: AtomicU64,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    entries: Mutex<HashMap<i64, Entry>>,
    changed: Notify,
    shutdown: CancellationToken,
}

impl ProcessingQueue {
    pub fn new(engine: Arc<PipelineEngine>, max_parallel: usize) -> Arc<Self> {
        Self::with_retention(engine, max_parallel, DEFAULT_RETENTION)
    }

    /// Like [`ProcessingQueue::new`], keeping finished entries for `retention`.
    pub fn with_retention(
        engine: Arc<PipelineEngine>,
        max_parallel: usize,
        retention: Duration,
    ) -> Arc<Self> {
        let max_parallel = max_parallel.max(1);
        tracing::info!(max_parallel, retention_secs = retention.as_secs(), "Processing queue ready");
        Arc::new(Self {
            engine,
            max_parallel,
            retention,
            generations: AtomicU64::new(0),
            permits: Arc::new(Semaphore::new(max_parallel)),
            tracker: TaskTracker::new(),
            entries: Mutex::new(HashMap::new()),
            changed: Notify::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// The process-wide queue, if one was installed.
    pub fn global() -> Option<Arc<Self>> {
        GLOBAL_QUEUE.get().cloned()
    }

    /// Install the process-wide queue on first call; later calls return the
    /// existing one and drop `make` unused.
    pub fn global_or_init(make: impl FnOnce() -> Arc<Self>) -> Arc<Self> {
        GLOBAL_QUEUE.get_or_init(make).clone()
    }

    pub fn engine(&self) -> &Arc<PipelineEngine> {
        &self.engine
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<i64, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Updates the entry only if it still belongs to the run `generation`;
    /// a removed or resubmitted item is left alone.
    fn set_status(&self, item_id: i64, generation: u64, status: QueueStatus, error: Option<String>) {
        if let Some(entry) = self
            .entries()
            .get_mut(&item_id)
            .filter(|e| e.generation == generation)
        {
            entry.status = status;
            entry.error = error;
            if !status.is_active() {
                entry.finished_at = Some(Instant::now());
            }
        }
        self.changed.notify_waiters();
    }

    /// Drop finished entries older than the retention window.
    fn prune(&self, entries: &mut HashMap<i64, Entry>) {
        let retention = self.retention;
        entries.retain(|_, e| e.finished_at.is_none_or(|at| at.elapsed() < retention));
    }

    /// Enqueue `item_id`. Returns `false` if it is already queued or running
    /// or the queue is shutting down.
    pub fn submit(self: &Arc<Self>, item_id: i64, user_id: Option<i64>) -> bool {
        if self.tracker.is_closed() || self.shutdown.is_cancelled() {
            tracing::warn!(item_id, "Queue is shutting down, submission refused");
            return false;
        }
        let cancel = self.shutdown.child_token();
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        {
            let mut entries = self.entries();
            self.prune(&mut entries);
            if entries.get(&item_id).is_some_and(|e| e.status.is_active()) {
                tracing::debug!(item_id, "Item already queued");
                return false;
            }
            entries.insert(
                item_id,
                Entry {
                    generation,
                    status: QueueStatus::Queued,
                    user_id,
                    cancel: cancel.clone(),
                    error: None,
                    finished_at: None,
                },
            );
        }

        let queue = Arc::clone(self);
        self.tracker.spawn(async move {
            queue.run(item_id, generation, cancel).await;
        });
        tracing::info!(item_id, user_id = ?user_id, "Item queued");
        true
    }

    async fn run(&self, item_id: i64, generation: u64, cancel: CancellationToken) {
        let permit = tokio::select! {
            _ = cancel.cancelled() => None,
            permit = self.permits.clone().acquire_owned() => permit.ok(),
        };
        let Some(_permit) = permit else {
            self.mark_cancelled_while_queued(item_id, generation).await;
            return;
        };

        self.set_status(item_id, generation, QueueStatus::Running, None);
        let outcome = self.engine.process(item_id, &cancel).await;
        let (status, error) = match outcome {
            Ok(_) => (QueueStatus::Completed, None),
            Err(PipelineError::Cancelled) => (QueueStatus::Cancelled, None),
            Err(e) => (QueueStatus::Failed, Some(e.to_string())),
        };
        self.set_status(item_id, generation, status, error);
    }

    async fn mark_cancelled_while_queued(&self, item_id: i64, generation: u64) {
        self.set_status(item_id, generation, QueueStatus::Cancelled, None);
        if let Err(e) = self
            .engine
            .db()
            .update_content_status(item_id, ContentStatus::Cancelled, Some("cancelled"))
            .await
        {
            tracing::warn!(item_id, error = %e, "Failed to mark item cancelled");
        }
    }

    /// Remove a queued item or ask a running one to stop. Returns `false`
    /// when there is nothing active to cancel.
    pub fn cancel(&self, item_id: i64) -> bool {
        let mut entries = self.entries();
        let status = match entries.get(&item_id) {
            Some(entry) if entry.status.is_active() => entry.status,
            _ => return false,
        };
        if status == QueueStatus::Queued {
            if let Some(entry) = entries.remove(&item_id) {
                entry.cancel.cancel();
            }
            tracing::info!(item_id, "Queued item removed");
        } else if let Some(entry) = entries.get(&item_id) {
            entry.cancel.cancel();
            tracing::info!(item_id, "Cancelling running item");
        }
        drop(entries);
        self.changed.notify_waiters();
        true
    }

    pub fn status(&self, item_id: i64) -> Option<QueueStatus> {
        self.entries().get(&item_id).map(|e| e.status)
    }

    /// Failure message of the last run, when it failed.
    pub fn error(&self, item_id: i64) -> Option<String> {
        self.entries().get(&item_id).and_then(|e| e.error.clone())
    }

    pub fn submitted_by(&self, item_id: i64) -> Option<i64> {
        self.entries().get(&item_id).and_then(|e| e.user_id)
    }

    pub fn info(&self) -> QueueInfo {
        let mut entries = self.entries();
        self.prune(&mut entries);
        let running = entries
            .values()
            .filter(|e| e.status == QueueStatus::Running)
            .count();
        let queued = entries
            .values()
            .filter(|e| e.status == QueueStatus::Queued)
            .count();
        QueueInfo {
            max_parallel: self.max_parallel,
            running,
            queued,
            total: entries.len(),
        }
    }

    /// Wait until `item_id` leaves the queued/running states or `timeout`
    /// passes. Returns the status seen last.
    pub async fn wait_for(&self, item_id: i64, timeout: Duration) -> Option<QueueStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let status = self.status(item_id);
            if status.is_none_or(|s| !s.is_active()) {
                return status;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.status(item_id);
            }
        }
    }

    /// Stop accepting work and wait up to `wait` for running items. Items
    /// still running afterwards are cancelled.
    pub async fn shutdown(&self, wait: Duration) {
        tracing::info!(wait_secs = wait.as_secs(), "Processing queue shutting down");
        self.tracker.close();
        // Queued items have not started; drop them now.
        {
            let entries = self.entries();
            for entry in entries.values().filter(|e| e.status == QueueStatus::Queued) {
                entry.cancel.cancel();
            }
        }
        if tokio::time::timeout(wait, self.tracker.wait()).await.is_err() {
            tracing::warn!("Shutdown wait elapsed, cancelling running items");
            self.shutdown.cancel();
            self.tracker.wait().await;
        }
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, InMemoryDatabase};
    use crate::models::{NewContentItem, SourceType};
    use crate::pipeline::artifacts::ArtifactStore;
    use crate::pipeline::retry::RetryPolicy;
    use crate::pipeline::stages::{StubDownloader, StubTranscriber};
    use crate::retrieval::{InMemoryVectorIndex, MockEmbeddings, VectorRetrieval};
    use pretty_assertions::assert_eq;

    async fn setup(delay: Duration) -> (Arc<ProcessingQueue>, Arc<InMemoryDatabase>, Vec<i64>, tempfile::TempDir) {
        setup_with_retention(delay, DEFAULT_RETENTION).await
    }

    async fn setup_with_retention(
        delay: Duration,
        retention: Duration,
    ) -> (Arc<ProcessingQueue>, Arc<InMemoryDatabase>, Vec<i64>, tempfile::TempDir) {
        let db = Arc::new(InMemoryDatabase::new());
        let dir = tempfile::tempdir().unwrap();
        let engine = PipelineEngine::new(
            db.clone(),
            Arc::new(VectorRetrieval::new(
                Arc::new(InMemoryVectorIndex::new()),
                Arc::new(MockEmbeddings::new(16)),
            )),
            ArtifactStore::new(dir.path()),
            Arc::new(StubDownloader::new()),
            Arc::new(StubTranscriber::new("queued text").with_delay(delay)),
        )
        .with_retry(RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        });

        let mut ids = Vec::new();
        for i in 0..3 {
            let (item, _) = db
                .insert_content_item(&NewContentItem::new(
                    1,
                    SourceType::Youtube,
                    format!("vid{:08}", i),
                    format!("Video {}", i),
                ))
                .await
                .unwrap();
            ids.push(item.id);
        }
        (ProcessingQueue::with_retention(Arc::new(engine), 2, retention), db, ids, dir)
    }

    #[tokio::test]
    async fn test_submit_runs_to_completion() {
        let (queue, db, ids, _dir) = setup(Duration::ZERO).await;
        assert!(queue.submit(ids[0], Some(7)));
        assert_eq!(
            queue.wait_for(ids[0], Duration::from_secs(5)).await,
            Some(QueueStatus::Completed)
        );
        assert_eq!(queue.submitted_by(ids[0]), Some(7));
        let item = db.get_content_item(ids[0]).await.unwrap().unwrap();
        assert_eq!(item.status, ContentStatus::Done);
    }

    #[tokio::test]
    async fn test_duplicate_submit_rejected() {
        let (queue, _db, ids, _dir) = setup(Duration::from_millis(200)).await;
        assert!(queue.submit(ids[0], None));
        assert!(!queue.submit(ids[0], None));
        queue.wait_for(ids[0], Duration::from_secs(5)).await;
        // Finished items may be resubmitted.
        assert!(queue.submit(ids[0], None));
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let (queue, _db, ids, _dir) = setup(Duration::from_millis(300)).await;
        for id in &ids {
            assert!(queue.submit(*id, None));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        let info = queue.info();
        assert_eq!(info.running, 2);
        assert_eq!(info.queued, 1);
        assert_eq!(info.total, 3);

        for id in &ids {
            assert_eq!(
                queue.wait_for(*id, Duration::from_secs(5)).await,
                Some(QueueStatus::Completed)
            );
        }
    }

    #[tokio::test]
    async fn test_cancel_queued_and_running() {
        let (queue, db, ids, _dir) = setup(Duration::from_secs(5)).await;
        for id in &ids {
            queue.submit(*id, None);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The third item waits for a permit and is removed outright.
        assert_eq!(queue.status(ids[2]), Some(QueueStatus::Queued));
        assert!(queue.cancel(ids[2]));
        assert_eq!(queue.status(ids[2]), None);
        assert_eq!(queue.info().queued, 0);
        assert!(!queue.cancel(ids[2]));

        assert!(queue.cancel(ids[0]));
        assert_eq!(
            queue.wait_for(ids[0], Duration::from_secs(2)).await,
            Some(QueueStatus::Cancelled)
        );
        let item = db.get_content_item(ids[0]).await.unwrap().unwrap();
        assert_eq!(item.status, ContentStatus::Cancelled);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let item = db.get_content_item(ids[2]).await.unwrap().unwrap();
            if item.status == ContentStatus::Cancelled {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "queued item never marked cancelled");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!queue.cancel(ids[0]));
        assert!(!queue.cancel(9999));

        queue.shutdown(Duration::from_millis(10)).await;
        assert_eq!(queue.status(ids[1]), Some(QueueStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_finished_entries_are_pruned() {
        let (queue, _db, ids, _dir) = setup_with_retention(Duration::ZERO, Duration::from_millis(500)).await;
        for id in &ids {
            assert!(queue.submit(*id, None));
        }
        for id in &ids {
            assert_eq!(
                queue.wait_for(*id, Duration::from_secs(5)).await,
                Some(QueueStatus::Completed)
            );
        }
        assert_eq!(queue.info().total, 3);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(queue.info().total, 0);
        assert_eq!(queue.status(ids[0]), None);
        assert!(queue.submit(ids[0], None));
        assert_eq!(queue.info().total, 1);
    }
}
