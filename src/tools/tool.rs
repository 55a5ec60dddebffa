//! Tool trait and types.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::models::{Scene, UserRole};

/// Visibility category a tool belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Basic,
    File,
    Web,
    Search,
    Foreign,
    Unsafe,
}

impl ToolCategory {
    pub const ALL: [ToolCategory; 6] = [
        ToolCategory::Basic,
        ToolCategory::File,
        ToolCategory::Web,
        ToolCategory::Search,
        ToolCategory::Foreign,
        ToolCategory::Unsafe,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::File => "file",
            Self::Web => "web",
            Self::Search => "search",
            Self::Foreign => "foreign",
            Self::Unsafe => "unsafe",
        }
    }
}

impl FromStr for ToolCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ToolCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown tool category '{}'", s))
    }
}

/// Error type for tool execution.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Rate limited, retry after {0:?}")]
    RateLimited(Option<Duration>),

    #[error("External service error: {0}")]
    ExternalService(String),

    #[error("Unknown tool: {0}")]
    NotFound(String),

    #[error("Tool '{0}' is not visible in this context")]
    NotVisible(String),

    #[error("Tool call cancelled")]
    Cancelled,
}

impl ToolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidParameters(_) | Self::NotFound(_) | Self::NotVisible(_) => {
                ErrorKind::Validation
            }
            Self::RateLimited(_) => ErrorKind::RateLimit,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::ExecutionFailed(_)
            | Self::Timeout(_)
            | Self::NotAuthorized(_)
            | Self::ExternalService(_) => ErrorKind::ToolError,
        }
    }

    /// Network-like failures are worth another attempt; the rest are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::ExternalService(_) | Self::RateLimited(_)
        )
    }
}

impl From<std::io::Error> for ToolError {
    fn from(err: std::io::Error) -> Self {
        ToolError::ExecutionFailed(err.to_string())
    }
}

/// Output from a tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub result: serde_json::Value,
    pub duration: Duration,
}

impl ToolOutput {
    pub fn success(result: serde_json::Value, duration: Duration) -> Self {
        Self { result, duration }
    }

    pub fn text(text: impl Into<String>, duration: Duration) -> Self {
        Self {
            result: serde_json::Value::String(text.into()),
            duration,
        }
    }
}

/// Definition of a tool's parameters using JSON Schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        }
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Shape expected by function-calling chat APIs.
    pub fn to_function_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// Who is calling a tool, and from where.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub tenant_id: i64,
    pub user_id: Option<i64>,
    pub role: UserRole,
    pub scene: Scene,
    pub run_id: Option<Uuid>,
    pub cancel: CancellationToken,
    /// Final visible set of the run. `None` means only the scene/role policy applies.
    pub allowed: Option<Arc<BTreeSet<String>>>,
}

impl ToolContext {
    pub fn new(tenant_id: i64, scene: Scene) -> Self {
        Self {
            tenant_id,
            user_id: None,
            role: UserRole::default(),
            scene,
            run_id: None,
            cancel: CancellationToken::new(),
            allowed: None,
        }
    }

    pub fn with_user(mut self, user_id: i64, role: UserRole) -> Self {
        self.user_id = Some(user_id);
        self.role = role;
        self
    }

    pub fn with_role(mut self, role: UserRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_allowed(mut self, allowed: BTreeSet<String>) -> Self {
        self.allowed = Some(Arc::new(allowed));
        self
    }

    pub fn permits(&self, name: &str) -> bool {
        self.allowed.as_ref().is_none_or(|set| set.contains(name))
    }
}

/// Trait for tools that the agent can use.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    fn category(&self) -> ToolCategory {
        ToolCategory::Basic
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError>;

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// Read a required string parameter.
pub fn require_str<'a>(params: &'a serde_json::Value, name: &str) -> Result<&'a str, ToolError> {
    params
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidParameters(format!("missing '{}' parameter", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_parse() {
        for category in ToolCategory::ALL {
            assert_eq!(category.as_str().parse::<ToolCategory>().unwrap(), category);
        }
        assert!("magic".parse::<ToolCategory>().is_err());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            ToolError::NotVisible("shell".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(ToolError::NotFound("x".into()).kind(), ErrorKind::Validation);
        assert!(ToolError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!ToolError::InvalidParameters("x".into()).is_retryable());
    }

    #[test]
    fn test_function_schema_shape() {
        let schema = ToolSchema::new("echo", "Echo input");
        let f = schema.to_function_schema();
        assert_eq!(f["type"], "function");
        assert_eq!(f["function"]["name"], "echo");
        assert_eq!(f["function"]["parameters"]["type"], "object");
    }

    #[test]
    fn test_context_permits() {
        let ctx = ToolContext::new(1, Scene::Chat);
        assert!(ctx.permits("anything"));

        let ctx = ctx.with_allowed(["echo".to_string()].into_iter().collect());
        assert!(ctx.permits("echo"));
        assert!(!ctx.permits("shell"));
    }
}
