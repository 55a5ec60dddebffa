//! Small utility tools: time, echo and sleep.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;

use crate::tools::tool::{Tool, ToolContext, ToolError, ToolOutput, require_str};

/// Longest sleep the debug tool accepts.
const MAX_SLEEP_SECS: f64 = 30.0;

/// Reports the current UTC time.
#[derive(Debug, Default)]
pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time (UTC)."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}, "required": []})
    }

    async fn execute(
        &self,
        _params: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let now = Utc::now();
        Ok(ToolOutput::success(
            serde_json::json!({
                "iso": now.to_rfc3339(),
                "unix": now.timestamp(),
                "weekday": now.format("%A").to_string(),
            }),
            Duration::ZERO,
        ))
    }
}

/// Echoes its input back.
#[derive(Debug, Default)]
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echoes back the input message. Useful for testing."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "The message to echo back"
                }
            },
            "required": ["message"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let message = require_str(&params, "message")?;
        Ok(ToolOutput::text(message, Duration::ZERO))
    }
}

/// Waits for a number of seconds. Debug aid for timeouts and cancellation.
#[derive(Debug, Default)]
pub struct SleepTool;

#[async_trait]
impl Tool for SleepTool {
    fn name(&self) -> &str {
        "sleep"
    }

    fn description(&self) -> &str {
        "Wait for the given number of seconds (debugging only)."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "seconds": {
                    "type": "number",
                    "description": "How long to wait, at most 30"
                }
            },
            "required": ["seconds"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let seconds = params
            .get("seconds")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| ToolError::InvalidParameters("missing 'seconds' parameter".into()))?;
        if !(0.0..=MAX_SLEEP_SECS).contains(&seconds) {
            return Err(ToolError::InvalidParameters(format!(
                "seconds must be between 0 and {}",
                MAX_SLEEP_SECS
            )));
        }

        let start = Instant::now();
        tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(ToolError::Cancelled),
            _ = tokio::time::sleep(Duration::from_secs_f64(seconds)) => {}
        }
        Ok(ToolOutput::text(
            format!("slept {:.1}s", seconds),
            start.elapsed(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Scene;

    #[tokio::test]
    async fn test_echo_tool() {
        let ctx = ToolContext::new(1, Scene::Chat);
        let result = EchoTool
            .execute(serde_json::json!({"message": "hello"}), &ctx)
            .await
            .unwrap();
        assert_eq!(result.result, serde_json::json!("hello"));

        let err = EchoTool.execute(serde_json::json!({}), &ctx).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));
    }

    #[tokio::test]
    async fn test_current_time_fields() {
        let ctx = ToolContext::new(1, Scene::Chat);
        let out = CurrentTimeTool
            .execute(serde_json::json!({}), &ctx)
            .await
            .unwrap();
        assert!(out.result["unix"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_sleep_rejects_out_of_range() {
        let ctx = ToolContext::new(1, Scene::Chat);
        let err = SleepTool
            .execute(serde_json::json!({"seconds": 600}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));

        let out = SleepTool
            .execute(serde_json::json!({"seconds": 0.01}), &ctx)
            .await
            .unwrap();
        assert_eq!(out.result, serde_json::json!("slept 0.0s"));
    }
}
