use thiserror::Error;

/// Which budget window was exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BudgetWindow {
    Daily,
    Monthly,
}

impl std::fmt::Display for BudgetWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Daily => write!(f, "daily"),
            Self::Monthly => write!(f, "monthly"),
        }
    }
}

/// One failed provider call inside a fallback chain.
#[derive(Debug, Clone)]
pub struct ProviderAttempt {
    pub provider: String,
    pub error: String,
    pub retryable: bool,
}

/// Typed error surface for the gateway.
///
/// Kinds map onto the recovery policies the agent loop applies: the
/// loop-recoverable variants become error tool results the LLM can react to,
/// everything else aborts the current call and is reported to the
/// originating input (HTTP response, scheduler run, webhook event).
/// Internal/leaf functions use `anyhow::Result`; the `Internal` variant
/// converts via `?` at the boundary.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{window} token budget exceeded for tenant {tenant}")]
    BudgetExceeded {
        tenant: String,
        window: BudgetWindow,
    },

    #[error("all providers failed after {} attempt(s)", attempts.len())]
    UpstreamUnavailable { attempts: Vec<ProviderAttempt> },

    #[error("tool input rejected: {0}")]
    ToolValidation(String),

    #[error("tool execution failed: {0}")]
    ToolExecution(String),

    #[error("approval rejected for tool '{0}'")]
    ApprovalRejected(String),

    #[error("approval timed out for tool '{0}'")]
    ApprovalTimeout(String),

    #[error("no response from agent within {0} ms")]
    A2aTimeout(u64),

    #[error("role '{role}' is at capacity ({max} concurrent sub-agents)")]
    RoleCapacity { role: String, max: usize },

    #[error("unknown agent role '{0}'")]
    UnknownRole(String),

    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error("invalid trigger configuration: {0}")]
    SchedulerConfig(String),

    #[error("invalid webhook token")]
    WebhookAuth,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    /// Whether the agent loop can absorb this error as an error tool result
    /// and continue iterating.
    pub fn is_loop_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ToolValidation(_)
                | Self::ToolExecution(_)
                | Self::ApprovalRejected(_)
                | Self::ApprovalTimeout(_)
                | Self::A2aTimeout(_)
                | Self::RoleCapacity { .. }
                | Self::UnknownRole(_)
        )
    }
}
