use std::sync::Arc;
use tracing::warn;

use super::base::{Completion, CompletionRequest, Provider};
use crate::errors::{GatewayError, ProviderAttempt};

/// A provider plus how many attempts it gets.
pub struct ChainLink {
    pub provider: Arc<dyn Provider>,
    pub max_retries: usize,
}

/// Ordered retry across provider adapters. The primary gets a single
/// attempt; each fallback gets its configured retry budget. Non-retryable
/// failures stop the chain immediately.
pub struct FallbackChain {
    primary: Arc<dyn Provider>,
    fallbacks: Vec<ChainLink>,
}

impl FallbackChain {
    pub fn new(primary: Arc<dyn Provider>, fallbacks: Vec<ChainLink>) -> Self {
        Self { primary, fallbacks }
    }

    pub fn single(provider: Arc<dyn Provider>) -> Self {
        Self::new(provider, Vec::new())
    }

    pub fn primary_model(&self) -> &str {
        self.primary.default_model()
    }

    pub fn primary_name(&self) -> &str {
        self.primary.name()
    }

    pub async fn complete(
        &self,
        req: CompletionRequest<'_>,
    ) -> Result<Completion, GatewayError> {
        let mut attempts: Vec<ProviderAttempt> = Vec::new();

        match self.primary.complete(req.clone()).await {
            Ok(completion) => return Ok(completion),
            Err(e) => {
                let retryable = e.is_retryable();
                warn!(
                    "primary provider '{}' failed ({}retryable): {}",
                    self.primary.name(),
                    if retryable { "" } else { "not " },
                    e
                );
                attempts.push(ProviderAttempt {
                    provider: self.primary.name().to_string(),
                    error: e.to_string(),
                    retryable,
                });
                if !retryable {
                    return Err(GatewayError::UpstreamUnavailable { attempts });
                }
            }
        }

        for link in &self.fallbacks {
            for attempt in 1..=link.max_retries {
                match link.provider.complete(req.clone()).await {
                    Ok(completion) => return Ok(completion),
                    Err(e) => {
                        let retryable = e.is_retryable();
                        warn!(
                            "fallback provider '{}' attempt {}/{} failed: {}",
                            link.provider.name(),
                            attempt,
                            link.max_retries,
                            e
                        );
                        attempts.push(ProviderAttempt {
                            provider: link.provider.name().to_string(),
                            error: e.to_string(),
                            retryable,
                        });
                        if !retryable {
                            return Err(GatewayError::UpstreamUnavailable { attempts });
                        }
                        if attempt < link.max_retries {
                            // Jittered backoff before hitting the same endpoint again.
                            let delay = (500.0 * 2f64.powi(attempt as i32 - 1)
                                + fastrand::f64() * 250.0)
                                .min(5_000.0);
                            tokio::time::sleep(std::time::Duration::from_millis(delay as u64))
                                .await;
                        }
                    }
                }
            }
        }

        Err(GatewayError::UpstreamUnavailable { attempts })
    }
}
