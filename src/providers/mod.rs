pub mod anthropic;
pub mod base;
pub mod errors;
pub mod fallback;
pub mod openai;

use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;

use crate::config::{ProviderConfig, ProvidersConfig};
use crate::tenants::EffectiveConfig;
use anthropic::AnthropicProvider;
use base::Provider;
use fallback::{ChainLink, FallbackChain};
use openai::OpenAiProvider;

/// Builds the fallback chain a run executes against. Tests substitute
/// their own factory to inject scripted providers.
pub trait ProviderFactory: Send + Sync {
    fn chain_for(&self, config: &EffectiveConfig) -> Result<FallbackChain>;
}

/// Factory wired from the gateway configuration. Tenant settings override
/// the global primary: API key, model, per-tenant fallback list, and the
/// opaque hot-swap block (threaded into the adapter request body when
/// enabled).
pub struct ConfigProviderFactory {
    providers: ProvidersConfig,
}

impl ConfigProviderFactory {
    pub fn new(providers: ProvidersConfig) -> Self {
        Self { providers }
    }

    fn build_adapter(
        &self,
        spec: &ProviderConfig,
        api_key_override: Option<&str>,
        model_override: Option<&str>,
        extra_body: Option<Value>,
    ) -> Result<Arc<dyn Provider>> {
        let api_key = api_key_override
            .map(str::to_string)
            .unwrap_or_else(|| spec.api_key.clone());
        let model = model_override
            .map(str::to_string)
            .or_else(|| spec.model.clone());

        let provider: Arc<dyn Provider> = match spec.kind.as_str() {
            "anthropic" => match spec.base_url {
                Some(ref base) => Arc::new(AnthropicProvider::with_base_url(
                    api_key,
                    model,
                    base.clone(),
                    extra_body,
                )),
                None => Arc::new(AnthropicProvider::new(api_key, model, extra_body)),
            },
            "openai" => match spec.base_url {
                Some(ref base) => Arc::new(OpenAiProvider::with_base_url(
                    "openai",
                    api_key,
                    model,
                    base.clone(),
                    false,
                    extra_body,
                )),
                None => Arc::new(OpenAiProvider::new(api_key, model, extra_body)),
            },
            "local" => {
                let base = spec
                    .base_url
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("local provider requires base_url"))?;
                Arc::new(OpenAiProvider::local(base, model, extra_body))
            }
            other => anyhow::bail!("unknown provider kind '{other}'"),
        };
        Ok(provider)
    }
}

impl ProviderFactory for ConfigProviderFactory {
    fn chain_for(&self, config: &EffectiveConfig) -> Result<FallbackChain> {
        let extra_body = config.hot_swap.clone().filter(|_| self.providers.hot_swap_enabled);

        let primary = self.build_adapter(
            &self.providers.primary,
            config.api_key.as_deref(),
            config.model.as_deref(),
            extra_body.clone(),
        )?;

        let fallback_specs: &[ProviderConfig] = match config.fallback {
            Some(ref tenant_chain) => tenant_chain,
            None if self.providers.fallback_enabled => &self.providers.fallbacks,
            None => &[],
        };

        let mut fallbacks = Vec::with_capacity(fallback_specs.len());
        for spec in fallback_specs {
            fallbacks.push(ChainLink {
                provider: self.build_adapter(spec, None, None, extra_body.clone())?,
                max_retries: spec.max_retries.max(1),
            });
        }

        Ok(FallbackChain::new(primary, fallbacks))
    }
}
