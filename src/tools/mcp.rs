//! Foreign tools over JSON-RPC 2.0.
//!
//! An endpoint is asked for `tools/list` once when it connects; each
//! listed tool becomes a [`ForeignTool`] that forwards `tools/call`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::tool::{Tool, ToolCategory, ToolContext, ToolError, ToolOutput};

pub const JSONRPC_VERSION: &str = "2.0";

/// Environment variable listing endpoints as `name:url,name2:url2`.
pub const ENDPOINTS_VAR: &str = "ALICE_MCP__ENDPOINTS";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    pub id: Value,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id: Value::String(uuid::Uuid::new_v4().to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
    #[serde(default)]
    pub id: Option<Value>,
}

impl JsonRpcResponse {
    pub fn into_result(self) -> Result<Value, ToolError> {
        if let Some(err) = self.error {
            return Err(ToolError::ExternalService(format!(
                "[{}] {}",
                err.code, err.message
            )));
        }
        self.result
            .ok_or_else(|| ToolError::ExternalService("response has neither result nor error".into()))
    }
}

/// A tool as advertised by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema", alias = "inputSchema")]
    pub parameters: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

impl McpToolInfo {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: empty_object_schema(),
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }
}

#[derive(Debug, Deserialize)]
struct ListToolsResult {
    #[serde(default)]
    tools: Vec<McpToolInfo>,
}

/// Flatten a `tools/call` result.
///
/// Text parts of `content` are joined with newlines; `isError` turns the
/// text into a tool error. Anything without a `content` array passes through.
pub fn flatten_call_result(result: Value) -> Result<Value, ToolError> {
    let is_error = result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let Some(parts) = result.get("content").and_then(Value::as_array) else {
        return if is_error {
            Err(ToolError::ExternalService(result.to_string()))
        } else {
            Ok(result)
        };
    };

    let text = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n");

    if is_error {
        Err(ToolError::ExternalService(text))
    } else {
        Ok(Value::String(text))
    }
}

/// A connection to one foreign tool endpoint.
#[async_trait]
pub trait McpClient: Send + Sync {
    fn endpoint_name(&self) -> &str;

    async fn list_tools(&self) -> Result<Vec<McpToolInfo>, ToolError>;

    /// Call a tool and return its flattened result.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ToolError>;
}

/// JSON-RPC over HTTP POST.
pub struct HttpMcpClient {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl HttpMcpClient {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            name: name.into(),
            url: url.into(),
            client,
        }
    }

    async fn rpc(&self, method: &str, params: Option<Value>) -> Result<Value, ToolError> {
        let request = JsonRpcRequest::new(method, params);
        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ToolError::Timeout(Duration::from_secs(60))
                } else {
                    ToolError::ExternalService(format!("{}: {}", self.name, e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ToolError::ExternalService(format!(
                "{} returned HTTP {}",
                self.name, status
            )));
        }

        let body: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| ToolError::ExternalService(format!("invalid JSON-RPC response: {}", e)))?;
        body.into_result()
    }
}

#[async_trait]
impl McpClient for HttpMcpClient {
    fn endpoint_name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<McpToolInfo>, ToolError> {
        let result = self.rpc("tools/list", None).await?;
        let parsed: ListToolsResult = serde_json::from_value(result)
            .map_err(|e| ToolError::ExternalService(format!("malformed tools/list: {}", e)))?;
        Ok(parsed.tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ToolError> {
        let result = self
            .rpc(
                "tools/call",
                Some(serde_json::json!({"name": name, "arguments": arguments})),
            )
            .await?;
        flatten_call_result(result)
    }
}

/// Scripted endpoint for tests.
pub struct MockMcpClient {
    name: String,
    reachable: bool,
    tools: Vec<McpToolInfo>,
    results: HashMap<String, Value>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl MockMcpClient {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reachable: true,
            tools: Vec::new(),
            results: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// An endpoint whose every request fails.
    pub fn unreachable(name: impl Into<String>) -> Self {
        Self {
            reachable: false,
            ..Self::new(name)
        }
    }

    /// Advertise `info`; calls return `result` run through [`flatten_call_result`]
    /// when it carries a `content` array, or verbatim otherwise.
    pub fn with_tool(mut self, info: McpToolInfo, result: Value) -> Self {
        self.results.insert(info.name.clone(), result);
        self.tools.push(info);
        self
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn down(&self) -> ToolError {
        ToolError::ExternalService(format!("{}: connection refused", self.name))
    }
}

#[async_trait]
impl McpClient for MockMcpClient {
    fn endpoint_name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<McpToolInfo>, ToolError> {
        if !self.reachable {
            return Err(self.down());
        }
        Ok(self.tools.clone())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ToolError> {
        if !self.reachable {
            return Err(self.down());
        }
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name.to_string(), arguments));
        let result = self
            .results
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::ExternalService(format!("[-32601] unknown tool {}", name)))?;
        flatten_call_result(result)
    }
}

/// Adapter exposing a foreign tool through the [`Tool`] trait.
pub struct ForeignTool {
    client: Arc<dyn McpClient>,
    info: McpToolInfo,
}

impl ForeignTool {
    pub fn new(client: Arc<dyn McpClient>, info: McpToolInfo) -> Self {
        Self { client, info }
    }

    pub fn endpoint(&self) -> &str {
        self.client.endpoint_name()
    }
}

#[async_trait]
impl Tool for ForeignTool {
    fn name(&self) -> &str {
        &self.info.name
    }

    fn description(&self) -> &str {
        &self.info.description
    }

    fn parameters_schema(&self) -> Value {
        self.info.parameters.clone()
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Foreign
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let result = self.client.call_tool(&self.info.name, params).await?;
        Ok(ToolOutput::success(result, start.elapsed()))
    }
}

/// Parse `name:url,name2:url2`. Malformed entries are skipped with a warning.
pub fn parse_endpoints(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match entry.split_once(':') {
            Some((name, url)) if !name.is_empty() && !url.is_empty() => {
                Some((name.trim().to_string(), url.trim().to_string()))
            }
            _ => {
                tracing::warn!(entry = %entry, "Ignoring malformed foreign tool endpoint");
                None
            }
        })
        .collect()
}

/// HTTP clients for every endpoint in [`ENDPOINTS_VAR`].
pub fn clients_from_env() -> Vec<Arc<dyn McpClient>> {
    std::env::var(ENDPOINTS_VAR)
        .map(|raw| {
            parse_endpoints(&raw)
                .into_iter()
                .map(|(name, url)| Arc::new(HttpMcpClient::new(name, url)) as Arc<dyn McpClient>)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Scene;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_endpoints() {
        let parsed = parse_endpoints("notes:http://localhost:9000/rpc, bad ,calc:https://c.example/rpc");
        assert_eq!(
            parsed,
            vec![
                ("notes".to_string(), "http://localhost:9000/rpc".to_string()),
                ("calc".to_string(), "https://c.example/rpc".to_string()),
            ]
        );
    }

    #[test]
    fn test_flatten_joins_text_parts() {
        let result = serde_json::json!({
            "content": [
                {"type": "text", "text": "line one"},
                {"type": "image", "data": "..."},
                {"type": "text", "text": "line two"}
            ]
        });
        assert_eq!(flatten_call_result(result).unwrap(), Value::String("line one\nline two".into()));
    }

    #[test]
    fn test_flatten_is_error() {
        let result = serde_json::json!({
            "content": [{"type": "text", "text": "boom"}],
            "isError": true
        });
        let err = flatten_call_result(result).unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_rpc_error_format() {
        let response: JsonRpcResponse = serde_json::from_value(serde_json::json!({
            "jsonrpc": "2.0",
            "id": "1",
            "error": {"code": -32602, "message": "bad params"}
        }))
        .unwrap();
        let err = response.into_result().unwrap_err();
        assert!(err.to_string().contains("[-32602] bad params"));
    }

    #[test]
    fn test_tool_info_accepts_input_schema() {
        let info: McpToolInfo = serde_json::from_value(serde_json::json!({
            "name": "lookup",
            "description": "d",
            "inputSchema": {"type": "object", "properties": {"q": {"type": "string"}}}
        }))
        .unwrap();
        assert_eq!(info.parameters["properties"]["q"]["type"], "string");
    }

    #[tokio::test]
    async fn test_foreign_tool_passes_arguments_through() {
        let client = Arc::new(MockMcpClient::new("remote").with_tool(
            McpToolInfo::new("lookup", "find things"),
            serde_json::json!({"content": [{"type": "text", "text": "found it"}]}),
        ));
        let tool = ForeignTool::new(client.clone(), McpToolInfo::new("lookup", "find things"));
        let ctx = ToolContext::new(1, Scene::Console);

        let out = tool
            .execute(serde_json::json!({"q": "rust"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out.result, Value::String("found it".into()));
        assert_eq!(tool.category(), ToolCategory::Foreign);
        assert_eq!(client.calls()[0].1, serde_json::json!({"q": "rust"}));
    }
}
