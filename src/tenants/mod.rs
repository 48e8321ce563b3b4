//! Maps an input (channel, webhook, scheduler) to the effective
//! configuration its agent loop runs under.

use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;

use crate::budget::{BudgetStatus, UsageLedger};
use crate::config::{AgentConfig, ProviderConfig};
use crate::secrets::SecretStore;
use crate::store::Database;
use crate::store::tenants::{PersonaConfig, Tenant};

/// A resolved configuration bundle. Carries the decrypted API key for the
/// duration of one call frame; never persisted or logged.
#[derive(Clone)]
pub struct EffectiveConfig {
    /// None when running under the synthesized global default tenant.
    pub tenant_id: Option<String>,
    pub name: String,
    pub system_prompt: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub max_tokens: u32,
    pub max_iterations: usize,
    pub skill_allow_list: Vec<String>,
    pub roles: Vec<String>,
    pub persona: PersonaConfig,
    pub max_concurrent_subagents: usize,
    pub budget_daily_tokens: i64,
    pub budget_monthly_tokens: i64,
    pub budget_alert_pct: u8,
    pub hot_swap: Option<Value>,
    pub fallback: Option<Vec<ProviderConfig>>,
}

impl std::fmt::Debug for EffectiveConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectiveConfig")
            .field("tenant_id", &self.tenant_id)
            .field("name", &self.name)
            .field(
                "api_key",
                &self.api_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("model", &self.model)
            .field("max_iterations", &self.max_iterations)
            .field("skill_allow_list", &self.skill_allow_list)
            .finish_non_exhaustive()
    }
}

pub struct TenantResolver {
    db: Arc<Database>,
    secrets: Arc<SecretStore>,
    ledger: Arc<UsageLedger>,
    defaults: AgentConfig,
}

impl TenantResolver {
    pub fn new(
        db: Arc<Database>,
        secrets: Arc<SecretStore>,
        ledger: Arc<UsageLedger>,
        defaults: AgentConfig,
    ) -> Self {
        Self {
            db,
            secrets,
            ledger,
            defaults,
        }
    }

    /// Resolve the tenant bound to a channel; unbound channels run under
    /// the global default configuration.
    pub fn resolve_for_channel(&self, channel_id: &str) -> Result<EffectiveConfig> {
        match self.db.channel_binding(channel_id)? {
            Some(tenant_id) => self.resolve_tenant(&tenant_id),
            None => Ok(self.global_default()),
        }
    }

    /// Resolve a tenant by id, falling back to the global default when the
    /// id is unknown or absent.
    pub fn resolve(&self, tenant_id: Option<&str>) -> Result<EffectiveConfig> {
        match tenant_id {
            Some(id) => self.resolve_tenant(id),
            None => Ok(self.global_default()),
        }
    }

    fn resolve_tenant(&self, tenant_id: &str) -> Result<EffectiveConfig> {
        let Some(tenant) = self.db.get_tenant(tenant_id)? else {
            return Ok(self.global_default());
        };
        self.effective(&tenant)
    }

    fn effective(&self, tenant: &Tenant) -> Result<EffectiveConfig> {
        let api_key = tenant
            .encrypted_api_key
            .as_deref()
            .map(|ct| self.secrets.decrypt(ct))
            .transpose()
            .map_err(|e| anyhow::anyhow!("tenant {} key: {e}", tenant.id))?;
        Ok(EffectiveConfig {
            tenant_id: Some(tenant.id.clone()),
            name: tenant.name.clone(),
            system_prompt: if tenant.system_prompt.is_empty() {
                self.defaults.default_system_prompt.clone()
            } else {
                tenant.system_prompt.clone()
            },
            api_key,
            model: tenant.model.clone(),
            max_tokens: tenant.max_tokens,
            max_iterations: self.defaults.max_iterations,
            skill_allow_list: tenant.skill_allow_list.clone(),
            roles: tenant.roles.clone(),
            persona: tenant.persona.clone().unwrap_or_default(),
            max_concurrent_subagents: tenant.max_concurrent_subagents,
            budget_daily_tokens: tenant.budget_daily_tokens,
            budget_monthly_tokens: tenant.budget_monthly_tokens,
            budget_alert_pct: tenant.budget_alert_pct,
            hot_swap: tenant.hot_swap.clone(),
            fallback: tenant.fallback.clone(),
        })
    }

    fn global_default(&self) -> EffectiveConfig {
        EffectiveConfig {
            tenant_id: None,
            name: "default".into(),
            system_prompt: self.defaults.default_system_prompt.clone(),
            api_key: None,
            model: None,
            max_tokens: self.defaults.max_tokens,
            max_iterations: self.defaults.max_iterations,
            skill_allow_list: Vec::new(),
            roles: Vec::new(),
            persona: PersonaConfig::default(),
            max_concurrent_subagents: 3,
            budget_daily_tokens: 0,
            budget_monthly_tokens: 0,
            budget_alert_pct: 0,
            hot_swap: None,
            fallback: None,
        }
    }

    /// Budget gate, re-exported for the agent loop.
    pub fn check_budget(&self, config: &EffectiveConfig) -> Result<BudgetStatus> {
        let Some(ref tenant_id) = config.tenant_id else {
            return Ok(BudgetStatus::Ok);
        };
        self.ledger.check_budget(
            tenant_id,
            config.budget_daily_tokens,
            config.budget_monthly_tokens,
            config.budget_alert_pct,
        )
    }
}
