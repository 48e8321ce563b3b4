//! Service container: builds every subsystem from the configuration and
//! owns their start/stop lifecycle.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{AgentEngine, SubAgentSpawner};
use crate::approval::ApprovalBroker;
use crate::budget::UsageLedger;
use crate::bus::AgentBus;
use crate::calendar::CalendarSync;
use crate::config::Config;
use crate::events::EventBus;
use crate::providers::ConfigProviderFactory;
use crate::scheduler::output::{LoggingChannelSink, NoEmailSender, OutputRouter, SmtpEmailSender};
use crate::scheduler::{ChannelSink, EmailSender, Scheduler};
use crate::secrets::SecretStore;
use crate::store::Database;
use crate::tenants::TenantResolver;
use crate::tools::builtin::a2a::{BroadcastEventTool, DelegateTaskTool, QueryAgentsTool};
use crate::tools::builtin::git::{GitCloneTool, GitCommitPushTool, GitReadFileTool, GitWriteFileTool};
use crate::tools::builtin::http::HttpRequestTool;
use crate::tools::builtin::shell::RunScriptTool;
use crate::tools::builtin::web::WebBrowseTool;
use crate::tools::registry::ToolRegistry;
use crate::tools::skills;
use crate::webhooks::dispatch::WebhookDispatcher;
use crate::webhooks::{WebhookState, router};

pub struct Gateway {
    pub db: Arc<Database>,
    pub engine: Arc<AgentEngine>,
    pub scheduler: Arc<Scheduler>,
    pub calendar: Arc<CalendarSync>,
    pub broker: Arc<ApprovalBroker>,
    pub events: EventBus,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Gateway {
    pub async fn start(config: Config) -> Result<Self> {
        let data_dir = crate::utils::ensure_dir(config.resolved_data_dir()?)?;
        let tz = config.effective_timezone();
        info!(
            "starting loopgate (data dir {}, timezone {})",
            data_dir.display(),
            tz
        );

        let db = Arc::new(Database::open(&data_dir.join("loopgate.db"))?);
        let secrets = Arc::new(SecretStore::new(config.encryption_key.as_deref()));
        let events = EventBus::default();
        let ledger = Arc::new(UsageLedger::new(db.clone(), tz, events.clone()));
        let resolver = Arc::new(TenantResolver::new(
            db.clone(),
            secrets,
            ledger.clone(),
            config.agent.clone(),
        ));
        let broker = Arc::new(ApprovalBroker::new(db.clone(), events.clone()));
        broker.expire_stale()?;
        let bus = Arc::new(AgentBus::new(db.clone()));

        // Built-in tools.
        let workspace = data_dir.join("workspace");
        let mut registry = ToolRegistry::new(Some(broker.clone()));
        registry.register(Arc::new(WebBrowseTool::new()));
        registry.register(Arc::new(HttpRequestTool::new()));
        registry.register(Arc::new(RunScriptTool::new(Some(workspace.clone()), None)));
        registry.register(Arc::new(GitCloneTool::new(workspace.clone())));
        registry.register(Arc::new(GitReadFileTool::new(workspace.clone())));
        registry.register(Arc::new(GitWriteFileTool::new(workspace.clone())));
        registry.register(Arc::new(GitCommitPushTool::new(workspace)));
        let registry = Arc::new(Mutex::new(registry));

        // Skills: initial load plus hot reload.
        let skills_dir = data_dir.join("skills");
        let loaded = skills::reload_into(&registry, &skills_dir).await;
        info!("loaded {loaded} skill(s) from {}", skills_dir.display());
        let mut handles = Vec::new();
        match skills::start_watcher(skills_dir, registry.clone()) {
            Ok(handle) => handles.push(handle),
            Err(e) => warn!("skills watcher unavailable: {e:#}"),
        }

        let factory = Arc::new(ConfigProviderFactory::new(config.providers.clone()));
        let engine = Arc::new(AgentEngine::new(
            db.clone(),
            resolver,
            ledger,
            registry.clone(),
            factory,
            bus.clone(),
            events.clone(),
            tz,
        ));

        // A2A tools need the engine in place first.
        let spawner = Arc::new(SubAgentSpawner::new(engine.clone()));
        {
            let mut registry = registry.lock().await;
            registry.register(Arc::new(DelegateTaskTool::new(spawner)));
            registry.register(Arc::new(BroadcastEventTool::new(bus.clone())));
            registry.register(Arc::new(QueryAgentsTool::new(bus.clone())));
        }

        let cancel = CancellationToken::new();

        // TTL sweep for undelivered A2A messages.
        let sweep_bus = bus;
        let sweep_cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = sweep_cancel.cancelled() => break,
                    () = tokio::time::sleep(std::time::Duration::from_secs(60)) => {}
                }
                match sweep_bus.expire_overdue() {
                    Ok(0) => {}
                    Ok(expired) => info!("expired {expired} undelivered A2A message(s)"),
                    Err(e) => warn!("A2A TTL sweep failed: {e:#}"),
                }
            }
        }));

        let email: Arc<dyn EmailSender> = match config.smtp {
            Some(ref smtp) => Arc::new(
                SmtpEmailSender::new(smtp).context("building SMTP transport")?,
            ),
            None => Arc::new(NoEmailSender),
        };
        let channels: Arc<dyn ChannelSink> = Arc::new(LoggingChannelSink);
        let output_router = Arc::new(OutputRouter::new(
            channels,
            email,
            data_dir.join("outputs"),
        ));
        let scheduler = Arc::new(Scheduler::new(
            db.clone(),
            engine.clone(),
            output_router,
            events.clone(),
            tz,
        ));
        scheduler.recompute_all()?;
        handles.push(scheduler.start());

        let calendar = Arc::new(CalendarSync::new(db.clone()));
        handles.push(calendar.start());

        let dispatcher = Arc::new(WebhookDispatcher::new(db.clone()));
        handles.push(dispatcher.start_forwarder(&events, cancel.clone()));

        if config.http.enabled {
            let state = WebhookState {
                db: db.clone(),
                engine: engine.clone(),
                scheduler: scheduler.clone(),
                broker: broker.clone(),
                events: events.clone(),
                admin_token: config.http.admin_token.clone(),
                cancel: cancel.clone(),
            };
            let app = router(state);
            let addr = format!("{}:{}", config.http.host, config.http.port);
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("binding {addr}"))?;
            info!("HTTP surface listening on {addr}");
            let http_cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let serve = axum::serve(listener, app)
                    .with_graceful_shutdown(async move { http_cancel.cancelled().await });
                if let Err(e) = serve.await {
                    warn!("HTTP server exited with error: {e}");
                }
            }));
        }

        Ok(Self {
            db,
            engine,
            scheduler,
            calendar,
            broker,
            events,
            cancel,
            handles,
        })
    }

    pub async fn stop(self) {
        info!("shutting down");
        self.cancel.cancel();
        self.scheduler.stop();
        self.calendar.stop();
        for handle in self.handles {
            handle.abort();
            let _ = handle.await;
        }
        info!("shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gateway_starts_and_stops() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config {
            data_dir: Some(tmp.path().to_path_buf()),
            http: crate::config::HttpConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let gateway = Gateway::start(config).await.unwrap();
        // The store came up with the schema in place.
        assert!(gateway.db.list_tenants().unwrap().is_empty());
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_gateway_serves_http() {
        let tmp = tempfile::TempDir::new().unwrap();
        // Port 0: the OS picks a free port; we only check startup works.
        let config = Config {
            data_dir: Some(tmp.path().to_path_buf()),
            http: crate::config::HttpConfig {
                enabled: true,
                host: "127.0.0.1".into(),
                port: 0,
                admin_token: None,
            },
            ..Default::default()
        };
        let gateway = Gateway::start(config).await.unwrap();
        gateway.stop().await;
    }
}
