//! Inbound webhook invocation flows, including the budget gate.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use common::{Harness, text_completion};
use loopgate::store::tenants::Tenant;
use loopgate::store::usage::UsageRecord;
use loopgate::store::webhooks::WebhookRegistration;
use loopgate::webhooks::router;

async fn post_invoke(harness: &Harness, token: &str, body: Value) -> (StatusCode, Value) {
    let app = router(harness.webhook_state());
    let request = Request::builder()
        .method("POST")
        .uri(format!("/webhook/invoke/{token}"))
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn budget_exhausted_tenant_gets_visible_message_and_no_usage_row() {
    let harness = Harness::new(vec![text_completion("must not be called")]);

    // Tenant T1 with a 100-token daily budget, fully used.
    let mut tenant = Tenant::new("T1", "Capped");
    tenant.budget_daily_tokens = 100;
    harness.db.upsert_tenant(&tenant).unwrap();
    harness
        .db
        .record_usage(&UsageRecord {
            tenant_id: Some("T1".into()),
            model: "m".into(),
            input_tokens: 60,
            output_tokens: 40,
            duration_ms: 5,
            isolated: false,
        })
        .unwrap();

    let webhook = WebhookRegistration::new("inbound", vec!["*".into()]);
    harness.db.upsert_webhook(&webhook).unwrap();

    let (status, body) = post_invoke(
        &harness,
        &webhook.token,
        json!({"message": "hi", "agentGroupId": "T1"}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    let response = body["response"].as_str().unwrap().to_lowercase();
    assert!(response.contains("budget"));
    assert!(response.contains("exceeded"));

    // No provider call happened and no usage row was appended.
    assert_eq!(harness.provider.call_count(), 0);
    assert_eq!(harness.db.usage_record_count("T1").unwrap(), 1);
}

#[tokio::test]
async fn sync_invoke_round_trip() {
    let harness = Harness::new(vec![text_completion("pong")]);
    let webhook = WebhookRegistration::new("inbound", vec!["*".into()]);
    harness.db.upsert_webhook(&webhook).unwrap();

    let (status, body) = post_invoke(
        &harness,
        &webhook.token,
        json!({"message": "ping", "conversationId": "c-1"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["response"], "pong");
    assert_eq!(body["conversationId"], "c-1");

    // A second call on the same conversation id reuses it (idempotent
    // upsert by (channel, externalId)).
    let harness_conv = harness
        .db
        .get_or_create_conversation(&format!("webhook-{}", webhook.id), "c-1", None)
        .unwrap();
    let messages = harness.db.conversation_messages(harness_conv.id, 10).unwrap();
    assert_eq!(messages.len(), 2);
}

#[tokio::test]
async fn invalid_token_is_401() {
    let harness = Harness::new(vec![]);
    let (status, body) = post_invoke(&harness, "not-a-token", json!({"message": "hi"})).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn body_tenant_overrides_webhook_tenant() {
    let harness = Harness::new(vec![text_completion("ok")]);
    let mut bound = Tenant::new("T-bound", "Bound");
    bound.budget_daily_tokens = 0;
    harness.db.upsert_tenant(&bound).unwrap();
    let mut override_tenant = Tenant::new("T-override", "Override");
    override_tenant.budget_daily_tokens = 1; // will trip the gate
    harness.db.upsert_tenant(&override_tenant).unwrap();
    harness
        .db
        .record_usage(&UsageRecord {
            tenant_id: Some("T-override".into()),
            model: "m".into(),
            input_tokens: 5,
            output_tokens: 0,
            duration_ms: 1,
            isolated: false,
        })
        .unwrap();

    let mut webhook = WebhookRegistration::new("inbound", vec!["*".into()]);
    webhook.tenant_id = Some("T-bound".into());
    harness.db.upsert_webhook(&webhook).unwrap();

    // The body's agentGroupId wins, so the budget gate of the override
    // tenant applies.
    let (_status, body) = post_invoke(
        &harness,
        &webhook.token,
        json!({"message": "hi", "agentGroupId": "T-override"}),
    )
    .await;
    assert!(
        body["response"]
            .as_str()
            .unwrap()
            .to_lowercase()
            .contains("budget")
    );
}
