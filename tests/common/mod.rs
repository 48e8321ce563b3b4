// Shared test helpers — not all items used by every test binary.
#![allow(unused)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use loopgate::agent::{AgentEngine, SubAgentSpawner};
use loopgate::approval::ApprovalBroker;
use loopgate::budget::UsageLedger;
use loopgate::bus::AgentBus;
use loopgate::config::AgentConfig;
use loopgate::events::EventBus;
use loopgate::providers::ProviderFactory;
use loopgate::providers::base::{
    Completion, CompletionRequest, Provider, StopReason, ToolCallRequest,
};
use loopgate::providers::errors::ProviderError;
use loopgate::providers::fallback::FallbackChain;
use loopgate::scheduler::Scheduler;
use loopgate::scheduler::output::{LoggingChannelSink, NoEmailSender, OutputRouter};
use loopgate::secrets::SecretStore;
use loopgate::store::Database;
use loopgate::tenants::{EffectiveConfig, TenantResolver};
use loopgate::tools::builtin::a2a::{BroadcastEventTool, DelegateTaskTool, QueryAgentsTool};
use loopgate::tools::builtin::shell::RunScriptTool;
use loopgate::tools::registry::ToolRegistry;
use loopgate::webhooks::WebhookState;

/// Plays back a fixed sequence of completions, one per `complete` call.
pub struct ScriptedProvider {
    script: std::sync::Mutex<VecDeque<Completion>>,
    pub calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Completion>) -> Arc<Self> {
        Arc::new(Self {
            script: std::sync::Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn default_model(&self) -> &str {
        "scripted-model"
    }

    async fn complete(&self, _req: CompletionRequest<'_>) -> Result<Completion, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ProviderError::Malformed("script exhausted".into()))
    }
}

pub struct FixedFactory {
    pub provider: Arc<ScriptedProvider>,
}

impl ProviderFactory for FixedFactory {
    fn chain_for(&self, _config: &EffectiveConfig) -> anyhow::Result<FallbackChain> {
        Ok(FallbackChain::single(self.provider.clone()))
    }
}

pub fn text_completion(text: &str) -> Completion {
    Completion {
        content: Some(text.to_string()),
        tool_calls: vec![],
        input_tokens: 10,
        output_tokens: 5,
        stop_reason: StopReason::End,
    }
}

pub fn tool_completion(name: &str, arguments: serde_json::Value) -> Completion {
    Completion {
        content: None,
        tool_calls: vec![ToolCallRequest {
            id: format!("tc-{name}"),
            name: name.to_string(),
            arguments,
        }],
        input_tokens: 10,
        output_tokens: 5,
        stop_reason: StopReason::ToolUse,
    }
}

/// Fully wired gateway core over an in-memory store and a scripted
/// provider, without the HTTP listener.
pub struct Harness {
    pub db: Arc<Database>,
    pub engine: Arc<AgentEngine>,
    pub scheduler: Arc<Scheduler>,
    pub broker: Arc<ApprovalBroker>,
    pub bus: Arc<AgentBus>,
    pub events: EventBus,
    pub provider: Arc<ScriptedProvider>,
    pub tmp: TempDir,
}

impl Harness {
    pub fn new(script: Vec<Completion>) -> Self {
        let tmp = TempDir::new().expect("temp dir");
        let db = Arc::new(Database::in_memory().expect("in-memory store"));
        let events = EventBus::default();
        let ledger = Arc::new(UsageLedger::new(db.clone(), chrono_tz::UTC, events.clone()));
        let resolver = Arc::new(TenantResolver::new(
            db.clone(),
            Arc::new(SecretStore::new(Some("test-key"))),
            ledger.clone(),
            AgentConfig::default(),
        ));
        let broker = Arc::new(ApprovalBroker::new(db.clone(), events.clone()));
        let bus = Arc::new(AgentBus::new(db.clone()));

        let mut registry = ToolRegistry::new(Some(broker.clone()));
        registry.register(Arc::new(RunScriptTool::new(
            Some(tmp.path().to_path_buf()),
            Some(10),
        )));
        let registry = Arc::new(Mutex::new(registry));

        let provider = ScriptedProvider::new(script);
        let engine = Arc::new(AgentEngine::new(
            db.clone(),
            resolver,
            ledger,
            registry.clone(),
            Arc::new(FixedFactory {
                provider: provider.clone(),
            }),
            bus.clone(),
            events.clone(),
            chrono_tz::UTC,
        ));

        // A2A tools, wired exactly like the service container.
        let spawner = Arc::new(SubAgentSpawner::new(engine.clone()));
        {
            let mut guard = registry.try_lock().expect("fresh registry");
            guard.register(Arc::new(DelegateTaskTool::new(spawner)));
            guard.register(Arc::new(BroadcastEventTool::new(bus.clone())));
            guard.register(Arc::new(QueryAgentsTool::new(bus.clone())));
        }

        let router = Arc::new(OutputRouter::new(
            Arc::new(LoggingChannelSink),
            Arc::new(NoEmailSender),
            tmp.path().join("outputs"),
        ));
        let scheduler = Arc::new(Scheduler::new(
            db.clone(),
            engine.clone(),
            router,
            events.clone(),
            chrono_tz::UTC,
        ));

        Self {
            db,
            engine,
            scheduler,
            broker,
            bus,
            events,
            provider,
            tmp,
        }
    }

    pub fn webhook_state(&self) -> WebhookState {
        WebhookState {
            db: self.db.clone(),
            engine: self.engine.clone(),
            scheduler: self.scheduler.clone(),
            broker: self.broker.clone(),
            events: self.events.clone(),
            admin_token: Some("admin-secret".into()),
            cancel: CancellationToken::new(),
        }
    }
}
