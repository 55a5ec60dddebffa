//! Timeline lookup tools.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use crate::context::{TimelineService, clamp_days};
use crate::models::{EventType, Scene, TimelineFilter};
use crate::tools::tool::{Tool, ToolContext, ToolError, ToolOutput};

fn parse_list<T: std::str::FromStr<Err = String>>(
    params: &serde_json::Value,
    name: &str,
) -> Result<Vec<T>, ToolError> {
    let Some(values) = params.get(name).and_then(|v| v.as_array()) else {
        return Ok(Vec::new());
    };
    values
        .iter()
        .filter_map(|v| v.as_str())
        .map(|s| s.parse::<T>().map_err(ToolError::InvalidParameters))
        .collect()
}

/// Filtered listing of timeline events.
pub struct TimelineQueryTool {
    timeline: Arc<TimelineService>,
}

impl TimelineQueryTool {
    pub fn new(timeline: Arc<TimelineService>) -> Self {
        Self { timeline }
    }
}

#[async_trait]
impl Tool for TimelineQueryTool {
    fn name(&self) -> &str {
        "timeline_query"
    }

    fn description(&self) -> &str {
        "List the user's recent activity (videos watched, questions asked, searches), newest first."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "days": {"type": "integer", "description": "Look back this many days (default 7)"},
                "event_types": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Filter by event type, e.g. video_watched, question_asked"
                },
                "scenes": {"type": "array", "items": {"type": "string"}},
                "video_id": {"type": "integer"},
                "limit": {"type": "integer", "description": "Maximum events (default 20)"}
            },
            "required": []
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let days = clamp_days(params.get("days").and_then(|v| v.as_i64()).unwrap_or(7));
        let limit = params
            .get("limit")
            .and_then(|v| v.as_u64())
            .map(|n| usize::try_from(n).unwrap_or(100).clamp(1, 100))
            .unwrap_or(20);

        let filter = TimelineFilter {
            user_id: ctx.user_id,
            event_types: parse_list::<EventType>(&params, "event_types")?,
            scenes: parse_list::<Scene>(&params, "scenes")?,
            content_id: params.get("video_id").and_then(|v| v.as_i64()),
            since: Some(Utc::now() - Duration::days(days)),
            limit,
            ..TimelineFilter::for_tenant(ctx.tenant_id)
        };

        let events = self
            .timeline
            .list_events(&filter)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        Ok(ToolOutput::success(
            serde_json::json!({"days": days, "count": events.len(), "events": events}),
            start.elapsed(),
        ))
    }
}

/// Activity counts over a window.
pub struct TimelineSummaryTool {
    timeline: Arc<TimelineService>,
}

impl TimelineSummaryTool {
    pub fn new(timeline: Arc<TimelineService>) -> Self {
        Self { timeline }
    }
}

#[async_trait]
impl Tool for TimelineSummaryTool {
    fn name(&self) -> &str {
        "get_timeline_summary"
    }

    fn description(&self) -> &str {
        "Summarise the user's activity over the last N days: counts per activity type and the latest events."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "days": {"type": "integer", "description": "Window in days (default 7)"}
            },
            "required": []
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let days = params.get("days").and_then(|v| v.as_i64()).unwrap_or(7);
        let summary = self
            .timeline
            .recent_summary(ctx.tenant_id, ctx.user_id, days)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        let result = serde_json::to_value(&summary)
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(ToolOutput::success(result, start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryDatabase;

    #[tokio::test]
    async fn test_query_filters_by_type() {
        let timeline = Arc::new(TimelineService::new(Arc::new(InMemoryDatabase::new())));
        for kind in ["video_watched", "search"] {
            timeline
                .append_raw(1, None, kind, "timeline", None, Some(kind.into()), serde_json::json!({}))
                .await
                .unwrap();
        }

        let tool = TimelineQueryTool::new(timeline.clone());
        let ctx = ToolContext::new(1, Scene::Timeline);
        let out = tool
            .execute(serde_json::json!({"event_types": ["search"]}), &ctx)
            .await
            .unwrap();
        assert_eq!(out.result["count"], 1);
        assert_eq!(out.result["events"][0]["event_type"], "search");

        let err = tool
            .execute(serde_json::json!({"event_types": ["napping"]}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));

        let summary = TimelineSummaryTool::new(timeline)
            .execute(serde_json::json!({"days": 3}), &ctx)
            .await
            .unwrap();
        assert_eq!(summary.result["total"], 2);
    }

    #[tokio::test]
    async fn test_huge_windows_are_clamped() {
        let timeline = Arc::new(TimelineService::new(Arc::new(InMemoryDatabase::new())));
        timeline
            .append_raw(1, None, "search", "timeline", None, None, serde_json::json!({}))
            .await
            .unwrap();
        let ctx = ToolContext::new(1, Scene::Timeline);

        let out = TimelineQueryTool::new(timeline.clone())
            .execute(serde_json::json!({"days": i64::MAX, "limit": u64::MAX}), &ctx)
            .await
            .unwrap();
        assert_eq!(out.result["days"], crate::context::MAX_DAYS);
        assert_eq!(out.result["count"], 1);

        let summary = TimelineSummaryTool::new(timeline)
            .execute(serde_json::json!({"days": i64::MAX}), &ctx)
            .await
            .unwrap();
        assert_eq!(summary.result["days"], crate::context::MAX_DAYS);
    }
}
