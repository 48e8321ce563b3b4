//! Token-authenticated inbound surface: agent invocation (sync/async),
//! task creation, health, and the operator approval routes.

pub mod dispatch;

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::agent::AgentEngine;
use crate::approval::ApprovalBroker;
use crate::errors::GatewayError;
use crate::events::{EventBus, names};
use crate::scheduler::types::{JobAction, Output, ScheduledJob, Trigger};
use crate::scheduler::Scheduler;
use crate::store::Database;
use crate::store::webhooks::WebhookRegistration;

#[derive(Clone)]
pub struct WebhookState {
    pub db: Arc<Database>,
    pub engine: Arc<AgentEngine>,
    pub scheduler: Arc<Scheduler>,
    pub broker: Arc<ApprovalBroker>,
    pub events: EventBus,
    pub admin_token: Option<String>,
    pub cancel: CancellationToken,
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/webhook/invoke/{token}", post(invoke_handler))
        .route("/webhook/task/{token}", post(task_handler))
        .route("/webhook/health/{token}", get(health_handler))
        .route("/approvals/{id}/approve", post(approve_handler))
        .route("/approvals/{id}/reject", post(reject_handler))
        .with_state(state)
}

fn failure(status: StatusCode, error: &str) -> (StatusCode, Json<Value>) {
    (status, Json(json!({"success": false, "error": error})))
}

fn authenticate(state: &WebhookState, token: &str) -> Result<WebhookRegistration, (StatusCode, Json<Value>)> {
    match state.db.find_webhook_by_token(token) {
        Ok(Some(webhook)) => Ok(webhook),
        Ok(None) => Err(failure(StatusCode::UNAUTHORIZED, "invalid token")),
        Err(e) => {
            error!("webhook token lookup failed: {e:#}");
            Err(failure(StatusCode::INTERNAL_SERVER_ERROR, "internal error"))
        }
    }
}

fn channel_for(webhook: &WebhookRegistration) -> String {
    format!("webhook-{}", webhook.id)
}

#[derive(Debug, Deserialize)]
struct InvokeRequest {
    message: Option<String>,
    #[serde(rename = "agentGroupId")]
    agent_group_id: Option<String>,
    #[serde(rename = "conversationId")]
    conversation_id: Option<String>,
    sync: Option<bool>,
    #[serde(default)]
    #[allow(dead_code)]
    metadata: Option<Value>,
}

/// POST /webhook/invoke/{token} — run the agent loop for one message.
async fn invoke_handler(
    State(state): State<WebhookState>,
    Path(token): Path<String>,
    Json(body): Json<InvokeRequest>,
) -> impl IntoResponse {
    let webhook = match authenticate(&state, &token) {
        Ok(webhook) => webhook,
        Err(response) => return response,
    };
    let Some(message) = body.message.filter(|m| !m.trim().is_empty()) else {
        return failure(StatusCode::BAD_REQUEST, "missing field 'message'");
    };

    // Body override beats the webhook's own tenant binding.
    let tenant_id = body.agent_group_id.or_else(|| webhook.tenant_id.clone());
    let config = match state.engine.resolver().resolve(tenant_id.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("tenant resolution failed: {e:#}");
            return failure(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    };

    let external_id = body
        .conversation_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let conversation = match state
        .db
        .get_or_create_conversation(&channel_for(&webhook), &external_id, None)
    {
        Ok(conversation) => conversation,
        Err(e) => {
            error!("conversation lookup failed: {e:#}");
            return failure(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    };
    let _ = state.db.record_webhook_trigger(&webhook.id);

    state.events.emit(
        names::MESSAGE_INCOMING,
        json!({"channel": channel_for(&webhook), "conversationId": external_id}),
        config.tenant_id.clone(),
    );
    debug!(
        "webhook '{}' invoke: conversation={}, sync={:?}",
        webhook.name, external_id, body.sync
    );

    if body.sync.unwrap_or(true) {
        match state
            .engine
            .run(conversation.id, &message, &config, state.cancel.child_token())
            .await
        {
            Ok(outcome) => {
                state.events.emit(
                    names::MESSAGE_REPLY,
                    json!({"channel": channel_for(&webhook), "conversationId": external_id}),
                    config.tenant_id.clone(),
                );
                (
                    StatusCode::OK,
                    Json(json!({
                        "success": true,
                        "response": outcome.text,
                        "conversationId": external_id,
                    })),
                )
            }
            Err(e) => {
                error!("webhook invoke failed: {e}");
                failure(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
            }
        }
    } else {
        let engine = state.engine.clone();
        let cancel = state.cancel.child_token();
        let conversation_id = conversation.id;
        tokio::spawn(async move {
            if let Err(e) = engine.run(conversation_id, &message, &config, cancel).await {
                error!("async webhook invoke failed: {e}");
            }
        });
        (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "status": "scheduled",
                "conversationId": external_id,
            })),
        )
    }
}

#[derive(Debug, Deserialize)]
struct TaskRequest {
    name: Option<String>,
    prompt: Option<String>,
    #[serde(rename = "maxIterations")]
    max_iterations: Option<usize>,
}

/// POST /webhook/task/{token} — create and start an autonomous task job.
async fn task_handler(
    State(state): State<WebhookState>,
    Path(token): Path<String>,
    Json(body): Json<TaskRequest>,
) -> impl IntoResponse {
    let webhook = match authenticate(&state, &token) {
        Ok(webhook) => webhook,
        Err(response) => return response,
    };
    let (Some(name), Some(prompt)) = (
        body.name.filter(|n| !n.trim().is_empty()),
        body.prompt.filter(|p| !p.trim().is_empty()),
    ) else {
        return failure(StatusCode::BAD_REQUEST, "missing field 'name' or 'prompt'");
    };

    let job = ScheduledJob::new(
        name,
        Trigger::Once {
            run_at: chrono::Utc::now(),
        },
        JobAction {
            prompt,
            tenant_id: webhook.tenant_id.clone(),
            max_iterations: body.max_iterations,
        },
        Output::Channel {
            channel_id: channel_for(&webhook),
        },
    );
    let job = match state.scheduler.create_job(job) {
        Ok(job) => job,
        Err(e) => {
            error!("task job creation failed: {e}");
            return failure(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
        }
    };
    let _ = state.db.record_webhook_trigger(&webhook.id);

    state.events.emit(
        names::TASK_START,
        json!({"taskId": job.id, "name": job.name}),
        webhook.tenant_id.clone(),
    );
    info!("webhook '{}' started task '{}'", webhook.name, job.name);

    let scheduler = state.scheduler.clone();
    let job_id = job.id.clone();
    tokio::spawn(async move {
        scheduler.execute_job(job_id).await;
    });

    (
        StatusCode::OK,
        Json(json!({"success": true, "taskId": job.id, "status": "started"})),
    )
}

/// GET /webhook/health/{token} — registration metadata when valid.
async fn health_handler(
    State(state): State<WebhookState>,
    Path(token): Path<String>,
) -> impl IntoResponse {
    match authenticate(&state, &token) {
        Ok(webhook) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "webhook": {
                    "id": webhook.id,
                    "name": webhook.name,
                    "platform": "webhook",
                    "events": webhook.subscribed_events,
                }
            })),
        ),
        Err(response) => response,
    }
}

fn check_admin(state: &WebhookState, headers: &HeaderMap) -> Result<(), (StatusCode, Json<Value>)> {
    let Some(ref expected) = state.admin_token else {
        return Err(failure(
            StatusCode::UNAUTHORIZED,
            "operator routes are disabled",
        ));
    };
    let provided = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .unwrap_or_default();
    let matches: bool = provided.as_bytes().ct_eq(expected.as_bytes()).into();
    if matches {
        Ok(())
    } else {
        Err(failure(StatusCode::UNAUTHORIZED, "invalid token"))
    }
}

fn resolution_response(
    result: Result<crate::store::approvals::ApprovalStatus, GatewayError>,
) -> (StatusCode, Json<Value>) {
    match result {
        Ok(status) => (
            StatusCode::OK,
            Json(json!({"success": true, "status": status.as_str()})),
        ),
        Err(GatewayError::Internal(e)) if e.to_string().contains("unknown approval") => {
            failure(StatusCode::NOT_FOUND, "unknown approval")
        }
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

/// POST /approvals/{id}/approve — operator resolution.
async fn approve_handler(
    State(state): State<WebhookState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(response) = check_admin(&state, &headers) {
        return response;
    }
    resolution_response(state.broker.approve(&id))
}

/// POST /approvals/{id}/reject — operator resolution.
async fn reject_handler(
    State(state): State<WebhookState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(response) = check_admin(&state, &headers) {
        return response;
    }
    resolution_response(state.broker.reject(&id))
}
