//! Dynamically loadable tool handlers ("skills"). A skill is a directory
//! `skills/<name>/` holding a `skill.json` manifest plus its handler
//! files; the handler is an executable invoked with the JSON input on
//! stdin. A debounced filesystem watcher hot-reloads the registry.

use async_trait::async_trait;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::registry::ToolRegistry;
use super::{RiskClass, Tool, ToolContext, ToolResult};

/// Reload debounce window.
pub const RELOAD_DEBOUNCE_MS: u64 = 500;

const DEFAULT_SKILL_TIMEOUT_SECS: u64 = 60;
const MAX_SKILL_OUTPUT_CHARS: usize = 10_000;

fn default_parameters() -> Value {
    json!({"type": "object"})
}

#[derive(Debug, Clone, Deserialize)]
pub struct SkillManifest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_parameters")]
    pub parameters: Value,
    /// argv of the handler, resolved relative to the skill directory.
    pub command: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub risk: Option<RiskClass>,
    #[serde(default)]
    pub container_compatible: Option<bool>,
}

pub struct SkillTool {
    manifest: SkillManifest,
    dir: PathBuf,
}

impl SkillTool {
    pub fn new(manifest: SkillManifest, dir: PathBuf) -> Self {
        Self { manifest, dir }
    }
}

#[async_trait]
impl Tool for SkillTool {
    fn name(&self) -> &str {
        &self.manifest.name
    }

    fn description(&self) -> &str {
        &self.manifest.description
    }

    fn parameters(&self) -> Value {
        self.manifest.parameters.clone()
    }

    fn risk_class(&self) -> RiskClass {
        self.manifest.risk.unwrap_or(RiskClass::Medium)
    }

    fn container_compatible(&self) -> bool {
        self.manifest.container_compatible.unwrap_or(true)
    }

    fn execution_timeout(&self) -> Duration {
        Duration::from_secs(
            self.manifest
                .timeout_secs
                .unwrap_or(DEFAULT_SKILL_TIMEOUT_SECS)
                + 5,
        )
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> anyhow::Result<ToolResult> {
        let Some(program) = self.manifest.command.first() else {
            return Ok(ToolResult::error("skill has an empty command"));
        };
        let timeout = Duration::from_secs(
            self.manifest
                .timeout_secs
                .unwrap_or(DEFAULT_SKILL_TIMEOUT_SECS),
        );

        let mut command = tokio::process::Command::new(program);
        command
            .args(&self.manifest.command[1..])
            .current_dir(&self.dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return Ok(ToolResult::error(format!(
                    "failed to start skill '{}': {e}",
                    self.manifest.name
                )));
            }
        };
        if let Some(mut stdin) = child.stdin.take() {
            let input = serde_json::to_vec(&params)?;
            let _ = stdin.write_all(&input).await;
        }

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Ok(ToolResult::error(format!("skill failed: {e}"))),
            Err(_) => {
                return Ok(ToolResult::error(format!(
                    "skill '{}' timed out after {}s",
                    self.manifest.name,
                    timeout.as_secs()
                )));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        if output.status.success() {
            Ok(ToolResult::new(crate::utils::truncate_chars(
                &stdout,
                MAX_SKILL_OUTPUT_CHARS,
            )))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Ok(ToolResult::error(crate::utils::truncate_chars(
                &format!("skill exited with {:?}: {}", output.status.code(), stderr.trim()),
                MAX_SKILL_OUTPUT_CHARS,
            )))
        }
    }
}

/// Scan `skills/<name>/skill.json` one level deep.
pub fn load_skills(dir: &Path) -> Vec<Arc<SkillTool>> {
    let mut skills = Vec::new();
    if !dir.exists() {
        return skills;
    }
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).into_iter().flatten() {
        if !entry.file_type().is_dir() {
            continue;
        }
        let manifest_path = entry.path().join("skill.json");
        if !manifest_path.exists() {
            continue;
        }
        let raw = match std::fs::read_to_string(&manifest_path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("cannot read {}: {}", manifest_path.display(), e);
                continue;
            }
        };
        match serde_json::from_str::<SkillManifest>(&raw) {
            Ok(manifest) => {
                debug!("loaded skill '{}' from {}", manifest.name, entry.path().display());
                skills.push(Arc::new(SkillTool::new(manifest, entry.path().to_path_buf())));
            }
            Err(e) => warn!("invalid manifest {}: {}", manifest_path.display(), e),
        }
    }
    skills.sort_by(|a, b| a.manifest.name.cmp(&b.manifest.name));
    skills
}

/// Replace the registry's skill-sourced tools with the directory's
/// current contents.
pub async fn reload_into(registry: &Mutex<ToolRegistry>, dir: &Path) -> usize {
    let skills = load_skills(dir);
    let count = skills.len();
    let mut registry = registry.lock().await;
    registry.clear_skills();
    for skill in skills {
        registry.register_skill(skill);
    }
    count
}

/// Watch the skills tree and hot-reload the registry on changes,
/// debounced by [`RELOAD_DEBOUNCE_MS`].
pub fn start_watcher(
    dir: PathBuf,
    registry: Arc<Mutex<ToolRegistry>>,
) -> anyhow::Result<JoinHandle<()>> {
    std::fs::create_dir_all(&dir)?;

    // Bridge notify's callback into a tokio channel we can await.
    let (bridge_tx, mut bridge_rx) = tokio::sync::mpsc::channel::<()>(64);
    let mut watcher: RecommendedWatcher = Watcher::new(
        move |result: Result<notify::Event, notify::Error>| {
            if result.is_ok() {
                let _ = bridge_tx.blocking_send(());
            }
        },
        notify::Config::default(),
    )?;
    watcher.watch(&dir, RecursiveMode::Recursive)?;

    let handle = tokio::spawn(async move {
        let _watcher = watcher;
        while bridge_rx.recv().await.is_some() {
            // Let the burst of editor/filesystem events settle.
            tokio::time::sleep(Duration::from_millis(RELOAD_DEBOUNCE_MS)).await;
            while bridge_rx.try_recv().is_ok() {}
            let count = reload_into(&registry, &dir).await;
            info!("skills reloaded: {} tool(s)", count);
        }
    });
    Ok(handle)
}
