//! Timeline of user activity.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::error::{DatabaseError, ErrorKind};
use crate::models::{EventType, NewTimelineEvent, Scene, TimelineEvent, TimelineFilter};

/// Events returned by [`TimelineService::recent_summary`].
pub const SUMMARY_RECENT: usize = 10;

/// Longest look-back window, in days.
pub const MAX_DAYS: i64 = 3_650;

/// Upper bound on events scanned for a summary.
const SUMMARY_SCAN: usize = 1_000;

#[derive(Debug, thiserror::Error)]
pub enum TimelineError {
    #[error("Invalid timeline event: {0}")]
    Invalid(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl TimelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Invalid(_) => ErrorKind::Validation,
            Self::Database(e) => e.kind(),
        }
    }
}

/// Bounds a caller supplied window to `1..=MAX_DAYS`.
pub fn clamp_days(days: i64) -> i64 {
    days.clamp(1, MAX_DAYS)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineSummary {
    pub days: i64,
    pub total: usize,
    /// Event type identifier to count.
    pub counts: BTreeMap<String, usize>,
    pub recent: Vec<TimelineEvent>,
}

pub struct TimelineService {
    db: Arc<dyn Database>,
}

impl TimelineService {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    pub async fn append_event(
        &self,
        event: &NewTimelineEvent,
    ) -> Result<TimelineEvent, TimelineError> {
        if event.tenant_id <= 0 {
            return Err(TimelineError::Invalid(format!(
                "tenant id must be positive, got {}",
                event.tenant_id
            )));
        }
        if !event.context.is_object() && !event.context.is_null() {
            return Err(TimelineError::Invalid("context must be a map".into()));
        }
        Ok(self.db.append_timeline_event(event).await?)
    }

    /// Append from string identifiers, rejecting unknown event types and scenes.
    #[allow(clippy::too_many_arguments)]
    pub async fn append_raw(
        &self,
        tenant_id: i64,
        user_id: Option<i64>,
        event_type: &str,
        scene: &str,
        content_id: Option<i64>,
        title: Option<String>,
        context: serde_json::Value,
    ) -> Result<TimelineEvent, TimelineError> {
        let event_type: EventType = event_type.parse().map_err(TimelineError::Invalid)?;
        let scene: Scene = scene.parse().map_err(TimelineError::Invalid)?;
        self.append_event(&NewTimelineEvent {
            tenant_id,
            user_id,
            event_type,
            scene,
            content_id,
            conversation_id: None,
            title,
            context,
        })
        .await
    }

    /// Newest first.
    pub async fn list_events(
        &self,
        filter: &TimelineFilter,
    ) -> Result<Vec<TimelineEvent>, TimelineError> {
        Ok(self.db.list_timeline_events(filter).await?)
    }

    /// Counts per event type over the last `days`, plus the latest events.
    pub async fn recent_summary(
        &self,
        tenant_id: i64,
        user_id: Option<i64>,
        days: i64,
    ) -> Result<TimelineSummary, TimelineError> {
        let days = clamp_days(days);
        let filter = TimelineFilter {
            user_id,
            since: Some(Utc::now() - Duration::days(days)),
            limit: SUMMARY_SCAN,
            ..TimelineFilter::for_tenant(tenant_id)
        };
        let events = self.db.list_timeline_events(&filter).await?;

        let mut counts = BTreeMap::new();
        for event in &events {
            *counts.entry(event.event_type.as_str().to_string()).or_insert(0) += 1;
        }

        Ok(TimelineSummary {
            days,
            total: events.len(),
            counts,
            recent: events.into_iter().take(SUMMARY_RECENT).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryDatabase;

    fn service() -> TimelineService {
        TimelineService::new(Arc::new(InMemoryDatabase::new()))
    }

    #[tokio::test]
    async fn test_append_raw_rejects_unknown_type() {
        let timeline = service();
        let err = timeline
            .append_raw(1, None, "dreamt", "chat", None, None, serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = timeline
            .append_raw(1, None, "search", "kitchen", None, None, serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_summary_counts() {
        let timeline = service();
        for kind in ["search", "search", "agent_run"] {
            timeline
                .append_raw(1, Some(2), kind, "chat", None, None, serde_json::json!({}))
                .await
                .unwrap();
        }
        timeline
            .append_raw(9, None, "search", "chat", None, None, serde_json::json!({}))
            .await
            .unwrap();

        let summary = timeline.recent_summary(1, None, 7).await.unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.counts["search"], 2);
        assert_eq!(summary.counts["agent_run"], 1);
        assert_eq!(summary.recent.len(), 3);
    }

    #[tokio::test]
    async fn test_summary_window_is_bounded() {
        let timeline = service();
        timeline
            .append_raw(1, None, "search", "chat", None, None, serde_json::json!({}))
            .await
            .unwrap();

        let summary = timeline.recent_summary(1, None, i64::MAX).await.unwrap();
        assert_eq!(summary.days, MAX_DAYS);
        assert_eq!(summary.total, 1);

        let summary = timeline.recent_summary(1, None, i64::MIN).await.unwrap();
        assert_eq!(summary.days, 1);
    }
}
