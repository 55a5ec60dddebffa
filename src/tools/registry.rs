//! Tool registry and router.
//!
//! Owns local and foreign tools, computes what a scene and role may see,
//! and dispatches invocations with a timeout and the caller's cancellation.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::mcp::{ForeignTool, McpClient};
use super::policy::ToolPolicy;
use super::tool::{Tool, ToolCategory, ToolContext, ToolError, ToolOutput, ToolSchema};
use crate::error::ErrorKind;
use crate::models::{Scene, UserRole};

/// Default per-call timeout.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on `ToolResult::summary`.
pub const MAX_SUMMARY_CHARS: usize = 500;

/// Outcome of [`ToolRouter::execute_safe`]. Never an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub summary: String,
    pub duration_ms: u64,
}

impl ToolResult {
    /// Observation text fed back to the model.
    pub fn observation(&self) -> String {
        match (&self.output, &self.error) {
            (Some(serde_json::Value::String(s)), _) => s.clone(),
            (Some(value), _) => value.to_string(),
            (None, Some(err)) => format!("Error: {}", err),
            (None, None) => String::new(),
        }
    }
}

fn summarize(value: &serde_json::Value) -> String {
    let text = match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    crate::agent::truncate_chars(&text, MAX_SUMMARY_CHARS)
}

/// Registry of every tool known to the process.
pub struct ToolRouter {
    local: RwLock<HashMap<String, Arc<dyn Tool>>>,
    foreign: RwLock<HashMap<String, Arc<dyn Tool>>>,
    /// Declared scenes per tool; tools without an entry are declared everywhere.
    declared: RwLock<HashMap<String, Vec<Scene>>>,
    policy: ToolPolicy,
    timeout: Duration,
}

impl Default for ToolRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRouter {
    pub fn new() -> Self {
        Self {
            local: RwLock::new(HashMap::new()),
            foreign: RwLock::new(HashMap::new()),
            declared: RwLock::new(HashMap::new()),
            policy: ToolPolicy::default(),
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    /// Base policy applied when a call carries no precomputed visible set.
    pub fn with_policy(mut self, policy: ToolPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn policy(&self) -> &ToolPolicy {
        &self.policy
    }

    /// Register a local tool, replacing any tool of the same name.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.local
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), tool);
        tracing::debug!(tool = %name, "Registered tool");
    }

    /// Register a foreign tool. Returns `false` when the name is taken.
    pub fn register_foreign(&self, tool: Arc<dyn Tool>) -> bool {
        let name = tool.name().to_string();
        if self.contains_local(&name) {
            tracing::warn!(tool = %name, "Foreign tool collides with a local tool, skipping");
            return false;
        }
        let mut foreign = self.foreign.write().unwrap_or_else(PoisonError::into_inner);
        if foreign.contains_key(&name) {
            tracing::warn!(tool = %name, "Foreign tool already registered by another endpoint, skipping");
            return false;
        }
        foreign.insert(name, tool);
        true
    }

    /// List an endpoint's tools once and register them.
    ///
    /// An unreachable endpoint contributes nothing; returns how many tools
    /// were registered.
    pub async fn connect_foreign(&self, client: Arc<dyn McpClient>) -> usize {
        let endpoint = client.endpoint_name().to_string();
        let tools = match client.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                tracing::warn!(
                    endpoint = %endpoint,
                    kind = %e.kind(),
                    component = "tools",
                    "Foreign tool endpoint unreachable, its tools are omitted: {}",
                    e
                );
                return 0;
            }
        };

        let mut registered = 0;
        for info in tools {
            let tool = ForeignTool::new(Arc::clone(&client), info);
            if self.register_foreign(Arc::new(tool)) {
                registered += 1;
            }
        }
        tracing::info!(endpoint = %endpoint, count = registered, "Connected foreign tool endpoint");
        registered
    }

    /// Restrict `name` to the given scenes. An empty list means every scene.
    pub fn declare_scenes(&self, name: impl Into<String>, scenes: Vec<Scene>) {
        self.declared
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), scenes);
    }

    fn contains_local(&self, name: &str) -> bool {
        self.local
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Local tools shadow foreign ones.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        if let Some(tool) = self
            .local
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Some(Arc::clone(tool));
        }
        self.foreign
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn category_of(&self, name: &str) -> Option<ToolCategory> {
        self.get(name).map(|t| t.category())
    }

    /// Every registered name, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = self
            .local
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.extend(
            self.foreign
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .keys()
                .cloned(),
        );
        names.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.names().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn declared_for(&self, name: &str, scene: Scene) -> bool {
        self.declared
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .is_none_or(|scenes| scenes.is_empty() || scenes.contains(&scene))
    }

    /// Visibility under the router's base policy.
    pub fn is_visible(&self, name: &str, scene: Scene, role: UserRole) -> bool {
        self.is_visible_with(&self.policy, name, scene, role)
    }

    pub fn is_visible_with(
        &self,
        policy: &ToolPolicy,
        name: &str,
        scene: Scene,
        role: UserRole,
    ) -> bool {
        let Some(category) = self.category_of(name) else {
            return false;
        };
        self.declared_for(name, scene) && policy.is_visible(name, category, scene, role)
    }

    /// Names visible to `(scene, role)` under `policy`, sorted.
    pub fn visible_names(
        &self,
        policy: &ToolPolicy,
        scene: Scene,
        role: UserRole,
    ) -> BTreeSet<String> {
        self.names()
            .into_iter()
            .filter(|name| self.is_visible_with(policy, name, scene, role))
            .collect()
    }

    /// Schemas of the registered tools, optionally restricted to `allowed`.
    pub fn tool_schemas(&self, allowed: Option<&BTreeSet<String>>) -> Vec<ToolSchema> {
        self.names()
            .into_iter()
            .filter(|name| allowed.is_none_or(|set| set.contains(name)))
            .filter_map(|name| self.get(&name).map(|t| t.schema()))
            .collect()
    }

    /// Function-calling schemas, optionally restricted to `allowed`.
    pub fn list_tool_schemas(&self, allowed: Option<&BTreeSet<String>>) -> Vec<serde_json::Value> {
        self.tool_schemas(allowed)
            .iter()
            .map(ToolSchema::to_function_schema)
            .collect()
    }

    /// Dispatch without a visibility check.
    pub async fn execute(
        &self,
        name: &str,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        if ctx.cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }

        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(ToolError::Cancelled),
            result = tokio::time::timeout(self.timeout, tool.execute(args, ctx)) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => Err(ToolError::Timeout(self.timeout)),
                }
            }
        }
    }

    /// Dispatch after checking the caller may see the tool.
    ///
    /// When the context carries the run's visible set it is authoritative;
    /// otherwise the base policy decides.
    pub async fn execute_scoped(
        &self,
        name: &str,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        if !self.contains(name) {
            return Err(ToolError::NotFound(name.to_string()));
        }
        let visible = match &ctx.allowed {
            Some(allowed) => allowed.contains(name),
            None => self.is_visible(name, ctx.scene, ctx.role),
        };
        if !visible {
            tracing::warn!(
                tool = %name,
                scene = %ctx.scene,
                role = ctx.role.as_str(),
                tenant_id = ctx.tenant_id,
                kind = %ErrorKind::Validation,
                "Rejected call to a tool outside the visible set"
            );
            return Err(ToolError::NotVisible(name.to_string()));
        }
        self.execute(name, args, ctx).await
    }

    /// Scoped dispatch with errors folded into the result.
    pub async fn execute_safe(
        &self,
        name: &str,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> ToolResult {
        let start = Instant::now();
        match self.execute_scoped(name, args, ctx).await {
            Ok(output) => ToolResult {
                success: true,
                summary: summarize(&output.result),
                output: Some(output.result),
                error: None,
                error_kind: None,
                duration_ms: start.elapsed().as_millis() as u64,
            },
            Err(e) => {
                tracing::debug!(tool = %name, kind = %e.kind(), "Tool call failed: {}", e);
                let message = e.to_string();
                ToolResult {
                    success: false,
                    output: None,
                    summary: crate::agent::truncate_chars(&message, MAX_SUMMARY_CHARS),
                    error: Some(message),
                    error_kind: Some(e.kind()),
                    duration_ms: start.elapsed().as_millis() as u64,
                }
            }
        }
    }
}
