use async_trait::async_trait;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::tools::{RiskClass, Tool, ToolContext, ToolResult};

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const MAX_OUTPUT_CHARS: usize = 10_000;

/// Run a shell script in the workspace directory. Approval-gated in any
/// sane deployment; the registry enforces the configured rule.
pub struct RunScriptTool {
    workdir: Option<PathBuf>,
    timeout: Duration,
}

impl RunScriptTool {
    pub fn new(workdir: Option<PathBuf>, timeout_secs: Option<u64>) -> Self {
        Self {
            workdir,
            timeout: Duration::from_secs(timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)),
        }
    }
}

#[async_trait]
impl Tool for RunScriptTool {
    fn name(&self) -> &str {
        "run_script"
    }

    fn description(&self) -> &str {
        "Execute a shell script and return stdout, stderr and the exit code"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "script": {"type": "string", "description": "Shell script to execute"}
            },
            "required": ["script"]
        })
    }

    fn risk_class(&self) -> RiskClass {
        RiskClass::High
    }

    fn container_compatible(&self) -> bool {
        true
    }

    fn execution_timeout(&self) -> Duration {
        self.timeout + Duration::from_secs(5)
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let script = params["script"].as_str().unwrap_or_default();
        if script.trim().is_empty() {
            return Ok(ToolResult::error("Empty script"));
        }
        debug!("run_script: {} chars", script.len());

        let mut command = Command::new("sh");
        command.arg("-c").arg(script).kill_on_drop(true);
        if let Some(ref dir) = self.workdir {
            command.current_dir(dir);
        }

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Ok(ToolResult::error(format!("Failed to spawn shell: {e}"))),
            Err(_) => {
                return Ok(ToolResult::error(format!(
                    "Script timed out after {}s",
                    self.timeout.as_secs()
                )));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output.status.code().unwrap_or(-1);

        let mut text = String::new();
        if !stdout.trim().is_empty() {
            text.push_str(stdout.trim_end());
        }
        if !stderr.trim().is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str("[stderr] ");
            text.push_str(stderr.trim_end());
        }
        if text.is_empty() {
            text.push_str("(no output)");
        }
        let text = crate::utils::truncate_chars(&text, MAX_OUTPUT_CHARS);

        if output.status.success() {
            Ok(ToolResult::new(text))
        } else {
            Ok(ToolResult::error(format!("exit code {code}\n{text}")))
        }
    }
}
