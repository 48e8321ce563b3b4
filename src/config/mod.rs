use anyhow::{Context, Result};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    18900
}

fn default_max_iterations() -> usize {
    25
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_max_retries() -> usize {
    2
}

fn default_provider_kind() -> String {
    "anthropic".to_string()
}

fn default_system_prompt() -> String {
    "You are a helpful assistant.".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bearer token guarding the operator approval routes. Unset disables them.
    #[serde(default)]
    pub admin_token: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_port(),
            admin_token: None,
        }
    }
}

/// One LLM endpoint. `kind` selects the adapter family: `anthropic`
/// (native tool calling), `openai` (OpenAI-compatible), `local`
/// (OpenAI-compatible, text only).
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_kind")]
    pub kind: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("kind", &self.kind)
            .field(
                "api_key",
                &if self.api_key.is_empty() {
                    "[empty]"
                } else {
                    "[REDACTED]"
                },
            )
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: default_provider_kind(),
            api_key: String::new(),
            base_url: None,
            model: None,
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub primary: ProviderConfig,
    #[serde(default)]
    pub fallbacks: Vec<ProviderConfig>,
    #[serde(default = "default_true")]
    pub fallback_enabled: bool,
    #[serde(default)]
    pub hot_swap_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_system_prompt")]
    pub default_system_prompt: String,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// IANA timezone for budget windows and the temporal prompt block.
    /// Unset: detect from the host, falling back to UTC.
    #[serde(default)]
    pub timezone: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_system_prompt: default_system_prompt(),
            max_iterations: default_max_iterations(),
            max_tokens: default_max_tokens(),
            timezone: None,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub from: String,
}

fn default_smtp_port() -> u16 {
    587
}

impl std::fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field(
                "password",
                &if self.password.is_empty() {
                    "[empty]"
                } else {
                    "[REDACTED]"
                },
            )
            .field("from", &self.from)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub smtp: Option<SmtpConfig>,
    /// Operator key the secret store derives its AES key from.
    #[serde(default)]
    pub encryption_key: Option<String>,
    /// Data directory holding the SQLite store and the skills tree.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl Config {
    /// Load from an optional TOML file, then overlay environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("Failed to read config: {}", p.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("Failed to parse config: {}", p.display()))?
            }
            Some(p) => {
                warn!("config file {} not found, using defaults", p.display());
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("LOOPGATE_ENCRYPTION_KEY") {
            self.encryption_key = Some(v);
        }
        if let Ok(v) = std::env::var("LOOPGATE_API_KEY") {
            self.providers.primary.api_key = v;
        }
        if let Ok(v) = std::env::var("LOOPGATE_BASE_URL") {
            self.providers.primary.base_url = Some(v);
        }
        if let Ok(v) = std::env::var("LOOPGATE_MODEL") {
            self.providers.primary.model = Some(v);
        }
        if let Ok(v) = std::env::var("LOOPGATE_PROVIDER") {
            self.providers.primary.kind = v;
        }
        if let Ok(v) = std::env::var("LOOPGATE_TZ") {
            self.agent.timezone = Some(v);
        }
        if let Ok(v) = std::env::var("LOOPGATE_SYSTEM_PROMPT") {
            self.agent.default_system_prompt = v;
        }
        if let Ok(v) = std::env::var("LOOPGATE_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("LOOPGATE_ADMIN_TOKEN") {
            self.http.admin_token = Some(v);
        }
        if let Ok(v) = std::env::var("LOOPGATE_PORT")
            && let Ok(port) = v.parse()
        {
            self.http.port = port;
        }
        if let Ok(host) = std::env::var("LOOPGATE_SMTP_HOST") {
            let mut smtp = self.smtp.take().unwrap_or(SmtpConfig {
                host: String::new(),
                port: default_smtp_port(),
                username: String::new(),
                password: String::new(),
                from: String::new(),
            });
            smtp.host = host;
            if let Ok(v) = std::env::var("LOOPGATE_SMTP_PORT")
                && let Ok(port) = v.parse()
            {
                smtp.port = port;
            }
            if let Ok(v) = std::env::var("LOOPGATE_SMTP_USER") {
                smtp.username = v;
            }
            if let Ok(v) = std::env::var("LOOPGATE_SMTP_PASSWORD") {
                smtp.password = v;
            }
            if let Ok(v) = std::env::var("LOOPGATE_SMTP_FROM") {
                smtp.from = v;
            }
            self.smtp = Some(smtp);
        }
    }

    /// The IANA timezone budget windows and the temporal block use:
    /// configured value, else host zone, else UTC.
    pub fn effective_timezone(&self) -> Tz {
        if let Some(ref name) = self.agent.timezone {
            match name.parse::<Tz>() {
                Ok(tz) => return tz,
                Err(_) => warn!("invalid timezone '{}', falling back to host zone", name),
            }
        }
        iana_time_zone::get_timezone()
            .ok()
            .and_then(|name| name.parse().ok())
            .unwrap_or(Tz::UTC)
    }

    pub fn resolved_data_dir(&self) -> Result<PathBuf> {
        match self.data_dir {
            Some(ref dir) => Ok(dir.clone()),
            None => crate::utils::data_home(),
        }
    }
}
