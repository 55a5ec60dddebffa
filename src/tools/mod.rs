//! Tool system.
//!
//! Tools are the agent's interface to the outside world. They can:
//! - Query the tenant's processed videos and timeline
//! - Search the web and call HTTP endpoints
//! - Queue new content for processing
//! - Proxy tools served by external JSON-RPC endpoints

pub mod builtin;
pub mod mcp;

mod policy;
mod registry;
mod tool;

pub use mcp::{
    ForeignTool, HttpMcpClient, McpClient, McpToolInfo, MockMcpClient, clients_from_env,
    parse_endpoints,
};
pub use policy::{BLOCKED_BY_DEFAULT, ToolPolicy, role_categories, scene_categories};
pub use registry::{DEFAULT_TOOL_TIMEOUT, MAX_SUMMARY_CHARS, ToolResult, ToolRouter};
pub use tool::{
    Tool, ToolCategory, ToolContext, ToolError, ToolOutput, ToolSchema, require_str,
};
