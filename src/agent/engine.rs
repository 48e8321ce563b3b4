//! The conversational tool-use loop: budget preflight, composed system
//! prompt, provider calls through the fallback chain, tool dispatch, and
//! deterministic iteration capping. Shared by primary runs and sub-agent
//! runs (which restrict tools and cap iterations at 10).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{TimeZone, Utc};
use chrono_tz::Tz;
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::budget::{BudgetStatus, UsageLedger};
use crate::bus::{AgentBus, AgentIdentity, AgentRole};
use crate::errors::GatewayError;
use crate::events::{EventBus, names};
use crate::providers::ProviderFactory;
use crate::providers::base::{ChatMessage, CompletionRequest, StopReason, ToolCallRequest};
use crate::providers::fallback::FallbackChain;
use crate::store::Database;
use crate::store::conversations::{ROLE_ASSISTANT, ROLE_TOOL_RESULT, ROLE_USER, StoredMessage};
use crate::store::usage::UsageRecord;
use crate::tenants::{EffectiveConfig, TenantResolver};
use crate::tools::registry::ToolRegistry;
use crate::tools::{ToolContext, ToolResult};

use super::{persona, temporal};

/// Deterministic text returned when the iteration cap is hit.
pub const MAX_ITERATIONS_SENTINEL: &str = "Maximum iterations reached without a final answer.";

/// Marker returned for cancelled runs.
pub const CANCELLED_MARKER: &str = "Run cancelled.";

/// Sub-agents get a fixed, smaller budget.
pub const SUB_AGENT_MAX_ITERATIONS: usize = 10;

/// A2A tools every primary agent sees regardless of allow-list.
pub const A2A_TOOLS: &[&str] = &["delegate_task", "broadcast_event", "query_agents"];

const HISTORY_LIMIT: usize = 50;
const ERROR_RESULT_PREFIX: &str = "Error: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    Completed,
    Cancelled,
    MaxIterations,
    BudgetExceeded,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub text: String,
    pub status: LoopStatus,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

pub struct AgentEngine {
    db: Arc<Database>,
    resolver: Arc<TenantResolver>,
    ledger: Arc<UsageLedger>,
    registry: Arc<Mutex<ToolRegistry>>,
    factory: Arc<dyn ProviderFactory>,
    bus: Arc<AgentBus>,
    events: EventBus,
    tz: Tz,
    conversation_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl AgentEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Database>,
        resolver: Arc<TenantResolver>,
        ledger: Arc<UsageLedger>,
        registry: Arc<Mutex<ToolRegistry>>,
        factory: Arc<dyn ProviderFactory>,
        bus: Arc<AgentBus>,
        events: EventBus,
        tz: Tz,
    ) -> Self {
        Self {
            db,
            resolver,
            ledger,
            registry,
            factory,
            bus,
            events,
            tz,
            conversation_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn resolver(&self) -> &Arc<TenantResolver> {
        &self.resolver
    }

    async fn conversation_lock(&self, conversation_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.conversation_locks.lock().await;
        locks
            .entry(conversation_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run one primary agent turn in a conversation.
    pub async fn run(
        &self,
        conversation_id: i64,
        user_message: &str,
        config: &EffectiveConfig,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, GatewayError> {
        let lock = self.conversation_lock(conversation_id).await;
        let _guard = lock.lock().await;

        // Budget preflight: no LLM call, no usage row.
        match self
            .resolver
            .check_budget(config)
            .map_err(GatewayError::Internal)?
        {
            BudgetStatus::Ok => {}
            BudgetStatus::Exceeded(window) => {
                let text = format!(
                    "The {window} token budget for this agent group is exceeded. \
                     The request was not sent to the model."
                );
                warn!(
                    "budget gate blocked run for tenant {:?} ({} window)",
                    config.tenant_id, window
                );
                self.events.emit(
                    names::TASK_ERROR,
                    json!({"conversationId": conversation_id, "error": "budget exceeded", "window": window.to_string()}),
                    config.tenant_id.clone(),
                );
                return Ok(RunOutcome {
                    text,
                    status: LoopStatus::BudgetExceeded,
                    input_tokens: 0,
                    output_tokens: 0,
                });
            }
        }

        let identity = AgentIdentity::new(AgentRole::Primary, config.tenant_id.clone());
        // Keep the inbox alive for the whole run so sub-agent responses
        // can be delivered.
        let _inbox = self.bus.register_agent(identity.clone()).await;

        self.events.emit(
            names::AGENT_RUN_START,
            json!({"conversationId": conversation_id, "agentId": identity.id}),
            config.tenant_id.clone(),
        );

        let result = self
            .run_registered(conversation_id, user_message, config, &identity, cancel)
            .await;

        self.bus.unregister_agent(&identity.id).await;

        match result {
            Ok(outcome) => {
                self.events.emit(
                    names::AGENT_RUN_COMPLETE,
                    json!({
                        "conversationId": conversation_id,
                        "agentId": identity.id,
                        "inputTokens": outcome.input_tokens,
                        "outputTokens": outcome.output_tokens,
                    }),
                    config.tenant_id.clone(),
                );
                Ok(outcome)
            }
            Err(e) => {
                self.events.emit(
                    names::AGENT_RUN_ERROR,
                    json!({"conversationId": conversation_id, "error": e.to_string()}),
                    config.tenant_id.clone(),
                );
                Err(e)
            }
        }
    }

    async fn run_registered(
        &self,
        conversation_id: i64,
        user_message: &str,
        config: &EffectiveConfig,
        identity: &AgentIdentity,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, GatewayError> {
        let system = self.compose_system_prompt(config, user_message, None);

        let history = self
            .db
            .conversation_messages(conversation_id, HISTORY_LIMIT)
            .map_err(GatewayError::Internal)?;
        let mut messages = stored_to_chat(&history);
        self.db
            .append_message(conversation_id, ROLE_USER, user_message, None, None)
            .map_err(GatewayError::Internal)?;
        messages.push(ChatMessage::user(user_message));

        let chain = self
            .factory
            .chain_for(config)
            .map_err(GatewayError::Internal)?;

        let ctx = ToolContext {
            tenant_id: config.tenant_id.clone(),
            agent_id: identity.id.clone(),
            conversation_id: Some(conversation_id),
            cancel,
        };

        let outcome = run_tool_loop(LoopParams {
            chain: &chain,
            registry: &self.registry,
            allow_list: Some(&config.skill_allow_list),
            mandatory: A2A_TOOLS,
            system: &system,
            messages,
            max_iterations: config.max_iterations,
            max_tokens: config.max_tokens,
            ctx: &ctx,
            ledger: &self.ledger,
            isolated: false,
            persist: Some((&self.db, conversation_id)),
        })
        .await?;

        let final_text = match outcome.status {
            LoopStatus::Completed => outcome.text.clone(),
            LoopStatus::MaxIterations => MAX_ITERATIONS_SENTINEL.to_string(),
            LoopStatus::Cancelled => CANCELLED_MARKER.to_string(),
            LoopStatus::BudgetExceeded => outcome.text.clone(),
        };
        self.db
            .append_message(conversation_id, ROLE_ASSISTANT, &final_text, None, None)
            .map_err(GatewayError::Internal)?;

        Ok(RunOutcome {
            text: final_text,
            ..outcome
        })
    }

    /// Base prompt + persona + temporal context (+ role prompt for
    /// sub-agents).
    pub(crate) fn compose_system_prompt(
        &self,
        config: &EffectiveConfig,
        user_message: &str,
        role_prompt: Option<&str>,
    ) -> String {
        let now = Utc::now().with_timezone(&self.tz);
        let today_events = self.today_events();

        let mut prompt = config.system_prompt.clone();
        prompt.push_str("\n\n");
        prompt.push_str(&persona::persona_block(&config.persona, user_message));
        prompt.push_str("\n\n");
        prompt.push_str(&temporal::temporal_block(now, &today_events));
        if let Some(role_prompt) = role_prompt {
            prompt.push_str("\n\n");
            prompt.push_str(role_prompt);
        }
        prompt
    }

    fn today_events(&self) -> Vec<crate::store::calendar::CalendarEvent> {
        let local = Utc::now().with_timezone(&self.tz);
        let Some(start_local) = local.date_naive().and_hms_opt(0, 0, 0) else {
            return Vec::new();
        };
        let Some(start) = self.tz.from_local_datetime(&start_local).earliest() else {
            return Vec::new();
        };
        let start = start.with_timezone(&Utc);
        let end = start + chrono::Duration::days(1);
        self.db.events_in_window(start, end).unwrap_or_default()
    }

    pub(crate) fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub(crate) fn ledger(&self) -> &Arc<UsageLedger> {
        &self.ledger
    }

    pub(crate) fn registry(&self) -> &Arc<Mutex<ToolRegistry>> {
        &self.registry
    }

    pub(crate) fn factory(&self) -> &Arc<dyn ProviderFactory> {
        &self.factory
    }

    pub(crate) fn bus(&self) -> &Arc<AgentBus> {
        &self.bus
    }
}

pub(crate) struct LoopParams<'a> {
    pub chain: &'a FallbackChain,
    pub registry: &'a Mutex<ToolRegistry>,
    pub allow_list: Option<&'a [String]>,
    pub mandatory: &'a [&'a str],
    pub system: &'a str,
    pub messages: Vec<ChatMessage>,
    pub max_iterations: usize,
    pub max_tokens: u32,
    pub ctx: &'a ToolContext,
    pub ledger: &'a UsageLedger,
    pub isolated: bool,
    /// When set, assistant tool calls and tool results are appended to
    /// the conversation as they happen.
    pub persist: Option<(&'a Database, i64)>,
}

/// The iteration loop proper. Cancellation is observed between provider
/// calls and between tool executions; partial usage is already recorded
/// by the time a cancellation is noticed.
pub(crate) async fn run_tool_loop(params: LoopParams<'_>) -> Result<RunOutcome, GatewayError> {
    let LoopParams {
        chain,
        registry,
        allow_list,
        mandatory,
        system,
        mut messages,
        max_iterations,
        max_tokens,
        ctx,
        ledger,
        isolated,
        persist,
    } = params;

    let mut input_tokens = 0i64;
    let mut output_tokens = 0i64;

    let tool_defs = registry.lock().await.definitions(allow_list, mandatory);
    let exposed: Vec<String> = tool_defs.iter().map(|d| d.name.clone()).collect();

    for iteration in 1..=max_iterations {
        if ctx.cancel.is_cancelled() {
            return Ok(RunOutcome {
                text: String::new(),
                status: LoopStatus::Cancelled,
                input_tokens,
                output_tokens,
            });
        }

        let request = CompletionRequest {
            system,
            messages: &messages,
            tools: &tool_defs,
            max_tokens,
        };
        let started = Instant::now();
        let completion = tokio::select! {
            result = chain.complete(request) => result?,
            () = ctx.cancel.cancelled() => {
                return Ok(RunOutcome {
                    text: String::new(),
                    status: LoopStatus::Cancelled,
                    input_tokens,
                    output_tokens,
                });
            }
        };
        let duration_ms = started.elapsed().as_millis() as i64;

        ledger.record_usage(&UsageRecord {
            tenant_id: ctx.tenant_id.clone(),
            model: chain.primary_model().to_string(),
            input_tokens: completion.input_tokens,
            output_tokens: completion.output_tokens,
            duration_ms,
            isolated,
        });
        input_tokens += completion.input_tokens;
        output_tokens += completion.output_tokens;

        if completion.stop_reason != StopReason::ToolUse && !completion.has_tool_calls() {
            return Ok(RunOutcome {
                text: completion.content.unwrap_or_default(),
                status: LoopStatus::Completed,
                input_tokens,
                output_tokens,
            });
        }

        debug!(
            "iteration {}/{}: {} tool call(s)",
            iteration,
            max_iterations,
            completion.tool_calls.len()
        );

        let assistant_text = completion.content.clone().unwrap_or_default();
        if let Some((db, conversation_id)) = persist {
            db.append_message(
                conversation_id,
                ROLE_ASSISTANT,
                &assistant_text,
                Some(&serde_json::to_value(&completion.tool_calls).map_err(anyhow::Error::from)?),
                None,
            )
            .map_err(GatewayError::Internal)?;
        }
        messages.push(ChatMessage::assistant(
            assistant_text,
            Some(completion.tool_calls.clone()),
        ));

        for call in &completion.tool_calls {
            if ctx.cancel.is_cancelled() {
                return Ok(RunOutcome {
                    text: String::new(),
                    status: LoopStatus::Cancelled,
                    input_tokens,
                    output_tokens,
                });
            }
            let result = if exposed.iter().any(|name| name == &call.name) {
                // Prepare under a short lock, run without it: delegate_task
                // re-enters the registry from its sub-loop.
                let prepared = {
                    let registry = registry.lock().await;
                    registry.prepare(&call.name, &call.arguments)
                };
                match prepared {
                    Ok((tool, broker)) => {
                        ToolRegistry::run_prepared(tool, broker, call.arguments.clone(), ctx)
                            .await
                            .map_err(GatewayError::Internal)?
                    }
                    Err(result) => result,
                }
            } else {
                warn!("model called unexposed tool '{}'", call.name);
                ToolResult::error(format!("Tool '{}' is not available", call.name))
            };

            if let Some((db, conversation_id)) = persist {
                let stored = if result.is_error {
                    format!("{ERROR_RESULT_PREFIX}{}", result.content)
                } else {
                    result.content.clone()
                };
                db.append_message(
                    conversation_id,
                    ROLE_TOOL_RESULT,
                    &stored,
                    None,
                    Some(&call.id),
                )
                .map_err(GatewayError::Internal)?;
            }
            messages.push(ChatMessage::tool_result(
                call.id.clone(),
                result.content,
                result.is_error,
            ));
        }
    }

    info!("iteration cap {} reached", max_iterations);
    Ok(RunOutcome {
        text: MAX_ITERATIONS_SENTINEL.to_string(),
        status: LoopStatus::MaxIterations,
        input_tokens,
        output_tokens,
    })
}

/// Replay persisted rows as provider messages.
pub(crate) fn stored_to_chat(history: &[StoredMessage]) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len());
    for row in history {
        match row.role.as_str() {
            ROLE_ASSISTANT => {
                let calls: Option<Vec<ToolCallRequest>> = row
                    .tool_calls
                    .as_ref()
                    .and_then(|v| serde_json::from_value(v.clone()).ok());
                messages.push(ChatMessage::assistant(row.content.clone(), calls));
            }
            ROLE_TOOL_RESULT => {
                let is_error = row.content.starts_with(ERROR_RESULT_PREFIX);
                let content = row
                    .content
                    .strip_prefix(ERROR_RESULT_PREFIX)
                    .unwrap_or(&row.content)
                    .to_string();
                messages.push(ChatMessage::tool_result(
                    row.tool_use_id.clone().unwrap_or_default(),
                    content,
                    is_error,
                ));
            }
            _ => messages.push(ChatMessage::user(row.content.clone())),
        }
    }
    messages
}
