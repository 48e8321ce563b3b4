//! Git workspace tools. Repositories live under a per-gateway workspace
//! root; every path is confined to it.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

use crate::tools::{RiskClass, Tool, ToolContext, ToolResult};

const GIT_TIMEOUT_SECS: u64 = 120;
const MAX_FILE_CHARS: usize = 30_000;

/// Resolve `relative` under `root`, rejecting traversal and absolute paths.
fn confine(root: &Path, relative: &str) -> Result<PathBuf, String> {
    let rel = Path::new(relative);
    if rel.is_absolute() {
        return Err(format!("absolute paths are not allowed: {relative}"));
    }
    for component in rel.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(format!("path escapes the workspace: {relative}")),
        }
    }
    Ok(root.join(rel))
}

async fn run_git(workdir: &Path, args: &[&str]) -> Result<(bool, String), String> {
    let mut command = Command::new("git");
    command.args(args).current_dir(workdir).kill_on_drop(true);
    let output = tokio::time::timeout(Duration::from_secs(GIT_TIMEOUT_SECS), command.output())
        .await
        .map_err(|_| format!("git {} timed out", args.first().unwrap_or(&"")))?
        .map_err(|e| format!("failed to spawn git: {e}"))?;
    let mut text = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(stderr.trim_end());
    }
    Ok((output.status.success(), text))
}

pub struct GitCloneTool {
    root: PathBuf,
}

impl GitCloneTool {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl Tool for GitCloneTool {
    fn name(&self) -> &str {
        "git_clone"
    }

    fn description(&self) -> &str {
        "Clone a git repository into the workspace"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "Repository URL"},
                "dir": {"type": "string", "description": "Target directory name inside the workspace"}
            },
            "required": ["url", "dir"]
        })
    }

    fn risk_class(&self) -> RiskClass {
        RiskClass::Medium
    }

    fn execution_timeout(&self) -> Duration {
        Duration::from_secs(GIT_TIMEOUT_SECS + 10)
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let url = params["url"].as_str().unwrap_or_default();
        let dir = params["dir"].as_str().unwrap_or_default();
        let target = match confine(&self.root, dir) {
            Ok(p) => p,
            Err(e) => return Ok(ToolResult::error(e)),
        };
        if target.exists() {
            return Ok(ToolResult::error(format!("'{dir}' already exists")));
        }
        std::fs::create_dir_all(&self.root)?;

        match run_git(&self.root, &["clone", "--depth", "1", url, dir]).await {
            Ok((true, _)) => Ok(ToolResult::new(format!("Cloned {url} into {dir}"))),
            Ok((false, output)) => Ok(ToolResult::error(format!("clone failed: {output}"))),
            Err(e) => Ok(ToolResult::error(e)),
        }
    }
}

pub struct GitReadFileTool {
    root: PathBuf,
}

impl GitReadFileTool {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl Tool for GitReadFileTool {
    fn name(&self) -> &str {
        "git_read_file"
    }

    fn description(&self) -> &str {
        "Read a file from a cloned repository in the workspace"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "dir": {"type": "string"},
                "path": {"type": "string"}
            },
            "required": ["dir", "path"]
        })
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let dir = params["dir"].as_str().unwrap_or_default();
        let path = params["path"].as_str().unwrap_or_default();
        let file = match confine(&self.root, &format!("{dir}/{path}")) {
            Ok(p) => p,
            Err(e) => return Ok(ToolResult::error(e)),
        };
        match std::fs::read_to_string(&file) {
            Ok(content) => Ok(ToolResult::new(crate::utils::truncate_chars(
                &content,
                MAX_FILE_CHARS,
            ))),
            Err(e) => Ok(ToolResult::error(format!("cannot read {dir}/{path}: {e}"))),
        }
    }
}

pub struct GitWriteFileTool {
    root: PathBuf,
}

impl GitWriteFileTool {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl Tool for GitWriteFileTool {
    fn name(&self) -> &str {
        "git_write_file"
    }

    fn description(&self) -> &str {
        "Write a file inside a cloned repository in the workspace"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "dir": {"type": "string"},
                "path": {"type": "string"},
                "content": {"type": "string"}
            },
            "required": ["dir", "path", "content"]
        })
    }

    fn risk_class(&self) -> RiskClass {
        RiskClass::Medium
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let dir = params["dir"].as_str().unwrap_or_default();
        let path = params["path"].as_str().unwrap_or_default();
        let content = params["content"].as_str().unwrap_or_default();
        let file = match confine(&self.root, &format!("{dir}/{path}")) {
            Ok(p) => p,
            Err(e) => return Ok(ToolResult::error(e)),
        };
        crate::utils::atomic_write(&file, content)?;
        Ok(ToolResult::new(format!(
            "Wrote {} bytes to {dir}/{path}",
            content.len()
        )))
    }
}

pub struct GitCommitPushTool {
    root: PathBuf,
}

impl GitCommitPushTool {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl Tool for GitCommitPushTool {
    fn name(&self) -> &str {
        "git_commit_push"
    }

    fn description(&self) -> &str {
        "Stage all changes in a repository, commit them, and push to the remote"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "dir": {"type": "string"},
                "message": {"type": "string"},
                "push": {"type": "boolean", "default": true}
            },
            "required": ["dir", "message"]
        })
    }

    fn risk_class(&self) -> RiskClass {
        RiskClass::High
    }

    fn execution_timeout(&self) -> Duration {
        Duration::from_secs(GIT_TIMEOUT_SECS + 10)
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let dir = params["dir"].as_str().unwrap_or_default();
        let message = params["message"].as_str().unwrap_or_default();
        let push = params["push"].as_bool().unwrap_or(true);
        let repo = match confine(&self.root, dir) {
            Ok(p) => p,
            Err(e) => return Ok(ToolResult::error(e)),
        };
        if !repo.join(".git").exists() {
            return Ok(ToolResult::error(format!("'{dir}' is not a git repository")));
        }

        if let Ok((false, output)) | Err(output) = run_git(&repo, &["add", "-A"]).await {
            return Ok(ToolResult::error(format!("git add failed: {output}")));
        }
        match run_git(&repo, &["commit", "-m", message]).await {
            Ok((true, output)) => {
                if push {
                    match run_git(&repo, &["push"]).await {
                        Ok((true, _)) => Ok(ToolResult::new(format!("Committed and pushed: {output}"))),
                        Ok((false, push_out)) | Err(push_out) => {
                            Ok(ToolResult::error(format!("commit ok, push failed: {push_out}")))
                        }
                    }
                } else {
                    Ok(ToolResult::new(format!("Committed: {output}")))
                }
            }
            Ok((false, output)) | Err(output) => {
                Ok(ToolResult::error(format!("commit failed: {output}")))
            }
        }
    }
}
