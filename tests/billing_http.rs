use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::Mutex;
use tower::util::ServiceExt;

use tollgate::billing::stripe::{CHECKOUT_SESSION_COMPLETED, signature_header};
use tollgate::{AdminGateway, BillingError, BillingHttpState, KeyRequest, UsagePool};

const WEBHOOK_SECRET: &str = "whsec_test";

#[derive(Default)]
struct RecordingGateway {
    budgets: Mutex<Vec<(String, Decimal)>>,
    keys: Mutex<Vec<KeyRequest>>,
}

#[async_trait]
impl AdminGateway for RecordingGateway {
    async fn push_budget(
        &self,
        tenant_id: &str,
        max_budget_usd: Decimal,
    ) -> Result<(), BillingError> {
        self.budgets
            .lock()
            .await
            .push((tenant_id.to_string(), max_budget_usd));
        Ok(())
    }

    async fn generate_key(&self, request: &KeyRequest) -> Result<String, BillingError> {
        self.keys.lock().await.push(request.clone());
        Ok("sk-test-123".to_string())
    }
}

fn state_without_database(gateway: Arc<RecordingGateway>) -> BillingHttpState {
    BillingHttpState::new(Arc::new(UsagePool::unconfigured()), gateway)
        .with_webhook_secret(WEBHOOK_SECRET)
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

fn signed_webhook_request(payload: &str) -> Request<Body> {
    let header = signature_header(payload, WEBHOOK_SECRET, now_epoch()).expect("sign");
    Request::builder()
        .method("POST")
        .uri("/webhook/stripe")
        .header("stripe-signature", header)
        .body(Body::from(payload.to_string()))
        .unwrap()
}

fn checkout_payload(email: Option<&str>, amount_total: i64) -> String {
    let mut object = json!({
        "amount_total": amount_total,
        "payment_intent": "pi_1"
    });
    if let Some(email) = email {
        object["customer_details"] = json!({"email": email});
    }
    json!({
        "id": "evt_1",
        "type": CHECKOUT_SESSION_COMPLETED,
        "data": {"object": object}
    })
    .to_string()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_responds_ok() {
    let app = tollgate::billing::http::router(state_without_database(Arc::default()));
    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");
}

#[tokio::test]
async fn signup_requires_email() {
    let app = tollgate::billing::http::router(state_without_database(Arc::default()));
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/user/signup")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"email": "  "}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let value = body_json(response).await;
    assert_eq!(value["error"]["code"], "invalid_request");
}

#[tokio::test]
async fn signup_without_database_is_server_error() {
    let gateway = Arc::new(RecordingGateway::default());
    let app = tollgate::billing::http::router(state_without_database(gateway.clone()));
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/user/signup")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"email": "a@example.com"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(gateway.keys.lock().await.is_empty());
}

#[tokio::test]
async fn telemetry_event_without_database_still_acks() {
    let app = tollgate::billing::http::router(state_without_database(Arc::default()));
    let body = json!({
        "request": {"model": "gpt-4o", "metadata": {"tenant_id": "t1"}},
        "response": {"id": "req-1", "usage": {"prompt_tokens": 10}},
        "start_time": 100.0,
        "end_time": 100.15
    });
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/telemetry/event")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");
}

#[tokio::test]
async fn telemetry_event_tolerates_empty_body() {
    let app = tollgate::billing::http::router(state_without_database(Arc::default()));
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/telemetry/event")
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn webhook_rejects_bad_signature() {
    let gateway = Arc::new(RecordingGateway::default());
    let app = tollgate::billing::http::router(state_without_database(gateway.clone()));
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook/stripe")
                .header("stripe-signature", "t=1,v1=00")
                .body(Body::from(checkout_payload(Some("a@example.com"), 1000)))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let value = body_json(response).await;
    assert_eq!(value["error"]["message"], "invalid signature");
    assert!(gateway.budgets.lock().await.is_empty());
}

#[tokio::test]
async fn webhook_rejects_garbage_payload_with_valid_signature() {
    let app = tollgate::billing::http::router(state_without_database(Arc::default()));
    let response = app
        .oneshot(signed_webhook_request("not json"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let value = body_json(response).await;
    assert_eq!(value["error"]["message"], "invalid payload");
}

#[tokio::test]
async fn webhook_acks_unhandled_event_types_without_side_effects() {
    let gateway = Arc::new(RecordingGateway::default());
    let app = tollgate::billing::http::router(state_without_database(gateway.clone()));
    let payload = json!({
        "id": "evt_9",
        "type": "invoice.paid",
        "data": {"object": {}}
    })
    .to_string();
    let response = app.oneshot(signed_webhook_request(&payload)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "success");
    assert!(gateway.budgets.lock().await.is_empty());
}

#[tokio::test]
async fn webhook_acks_checkout_without_email() {
    let gateway = Arc::new(RecordingGateway::default());
    let app = tollgate::billing::http::router(state_without_database(gateway.clone()));
    let response = app
        .oneshot(signed_webhook_request(&checkout_payload(None, 1000)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(gateway.budgets.lock().await.is_empty());
}

#[tokio::test]
async fn webhook_acks_checkout_when_database_is_down() {
    let gateway = Arc::new(RecordingGateway::default());
    let app = tollgate::billing::http::router(state_without_database(gateway.clone()));
    let response = app
        .oneshot(signed_webhook_request(&checkout_payload(
            Some("a@example.com"),
            1000,
        )))
        .await
        .unwrap();
    // The provider only needs the delivery acknowledged; the dropped credit
    // is an internal failure.
    assert_eq!(response.status(), StatusCode::OK);
    assert!(gateway.budgets.lock().await.is_empty());
}

#[tokio::test]
async fn webhook_without_configured_secret_is_server_error() {
    let gateway: Arc<RecordingGateway> = Arc::default();
    let state = BillingHttpState::new(Arc::new(UsagePool::unconfigured()), gateway);
    let app = tollgate::billing::http::router(state);
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook/stripe")
                .header("stripe-signature", "t=1,v1=00")
                .body(Body::from(checkout_payload(Some("a@example.com"), 1000)))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}
