use anyhow::Result;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Database, now_rfc3339};
use crate::config::ProviderConfig;

/// Persona shaping for a tenant's agents. `language` is either a fixed code
/// or `auto` (detected per message).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaConfig {
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub emoji: EmojiPolicy,
}

fn default_language() -> String {
    "auto".to_string()
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            language: default_language(),
            style: None,
            emoji: EmojiPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmojiPolicy {
    None,
    #[default]
    Minimal,
    Moderate,
    Heavy,
}

/// An isolated configuration bundle ("agent group"): prompt, credentials,
/// budgets and allow-listed tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub system_prompt: String,
    /// AEAD ciphertext produced by the secret store; never plaintext.
    #[serde(default)]
    pub encrypted_api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub skill_allow_list: Vec<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub persona: Option<PersonaConfig>,
    #[serde(default)]
    pub container_isolation: bool,
    #[serde(default = "default_max_subagents")]
    pub max_concurrent_subagents: usize,
    /// 0 = unlimited.
    #[serde(default)]
    pub budget_daily_tokens: i64,
    /// 0 = unlimited.
    #[serde(default)]
    pub budget_monthly_tokens: i64,
    #[serde(default = "default_alert_pct")]
    pub budget_alert_pct: u8,
    /// Opaque per-tenant block threaded to the provider adapter layer.
    #[serde(default)]
    pub hot_swap: Option<Value>,
    #[serde(default)]
    pub fallback: Option<Vec<ProviderConfig>>,
    #[serde(default)]
    pub repo_binding: Option<String>,
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_max_subagents() -> usize {
    3
}

fn default_alert_pct() -> u8 {
    80
}

impl Tenant {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            system_prompt: String::new(),
            encrypted_api_key: None,
            model: None,
            max_tokens: default_max_tokens(),
            skill_allow_list: Vec::new(),
            roles: Vec::new(),
            persona: None,
            container_isolation: false,
            max_concurrent_subagents: default_max_subagents(),
            budget_daily_tokens: 0,
            budget_monthly_tokens: 0,
            budget_alert_pct: default_alert_pct(),
            hot_swap: None,
            fallback: None,
            repo_binding: None,
        }
    }
}

fn json_or<T: for<'de> Deserialize<'de>>(raw: Option<String>) -> Option<T> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

impl Database {
    pub fn upsert_tenant(&self, tenant: &Tenant) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO tenants (id, name, system_prompt, encrypted_api_key, model, max_tokens,
                skill_allow_list, roles, persona, container_isolation, max_concurrent_subagents,
                budget_daily_tokens, budget_monthly_tokens, budget_alert_pct, hot_swap, fallback,
                repo_binding, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
             ON CONFLICT(id) DO UPDATE SET
                name=excluded.name, system_prompt=excluded.system_prompt,
                encrypted_api_key=excluded.encrypted_api_key, model=excluded.model,
                max_tokens=excluded.max_tokens, skill_allow_list=excluded.skill_allow_list,
                roles=excluded.roles, persona=excluded.persona,
                container_isolation=excluded.container_isolation,
                max_concurrent_subagents=excluded.max_concurrent_subagents,
                budget_daily_tokens=excluded.budget_daily_tokens,
                budget_monthly_tokens=excluded.budget_monthly_tokens,
                budget_alert_pct=excluded.budget_alert_pct,
                hot_swap=excluded.hot_swap, fallback=excluded.fallback,
                repo_binding=excluded.repo_binding",
            params![
                tenant.id,
                tenant.name,
                tenant.system_prompt,
                tenant.encrypted_api_key,
                tenant.model,
                tenant.max_tokens,
                serde_json::to_string(&tenant.skill_allow_list)?,
                serde_json::to_string(&tenant.roles)?,
                tenant
                    .persona
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                tenant.container_isolation,
                tenant.max_concurrent_subagents as i64,
                tenant.budget_daily_tokens,
                tenant.budget_monthly_tokens,
                tenant.budget_alert_pct,
                tenant
                    .hot_swap
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                tenant
                    .fallback
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                tenant.repo_binding,
                now_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_tenant(&self, id: &str) -> Result<Option<Tenant>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, name, system_prompt, encrypted_api_key, model, max_tokens,
                    skill_allow_list, roles, persona, container_isolation,
                    max_concurrent_subagents, budget_daily_tokens, budget_monthly_tokens,
                    budget_alert_pct, hot_swap, fallback, repo_binding
                 FROM tenants WHERE id = ?1",
                params![id],
                map_tenant_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_tenants(&self) -> Result<Vec<Tenant>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, system_prompt, encrypted_api_key, model, max_tokens,
                skill_allow_list, roles, persona, container_isolation,
                max_concurrent_subagents, budget_daily_tokens, budget_monthly_tokens,
                budget_alert_pct, hot_swap, fallback, repo_binding
             FROM tenants ORDER BY name",
        )?;
        let rows = stmt
            .query_map([], map_tenant_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn bind_channel(&self, channel_id: &str, tenant_id: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO channel_bindings (channel_id, tenant_id) VALUES (?1, ?2)
             ON CONFLICT(channel_id) DO UPDATE SET tenant_id=excluded.tenant_id",
            params![channel_id, tenant_id],
        )?;
        Ok(())
    }

    pub fn channel_binding(&self, channel_id: &str) -> Result<Option<String>> {
        let conn = self.lock();
        let tenant = conn
            .query_row(
                "SELECT tenant_id FROM channel_bindings WHERE channel_id = ?1",
                params![channel_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(tenant)
    }
}

fn map_tenant_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tenant> {
    Ok(Tenant {
        id: row.get(0)?,
        name: row.get(1)?,
        system_prompt: row.get(2)?,
        encrypted_api_key: row.get(3)?,
        model: row.get(4)?,
        max_tokens: row.get(5)?,
        skill_allow_list: json_or(row.get::<_, Option<String>>(6)?).unwrap_or_default(),
        roles: json_or(row.get::<_, Option<String>>(7)?).unwrap_or_default(),
        persona: json_or(row.get::<_, Option<String>>(8)?),
        container_isolation: row.get(9)?,
        max_concurrent_subagents: row.get::<_, i64>(10)? as usize,
        budget_daily_tokens: row.get(11)?,
        budget_monthly_tokens: row.get(12)?,
        budget_alert_pct: row.get::<_, i64>(13)? as u8,
        hot_swap: json_or(row.get::<_, Option<String>>(14)?),
        fallback: json_or(row.get::<_, Option<String>>(15)?),
        repo_binding: row.get(16)?,
    })
}
