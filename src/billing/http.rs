use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::config::{StripeSettings, default_free_tier_usd};
use super::gateway_admin::{AdminGateway, KeyRequest};
use super::ledger::Ledger;
use super::pool::UsagePool;
use super::stripe::{self, CHECKOUT_SESSION_COMPLETED, DEFAULT_TOLERANCE_SECS};
use super::telemetry::{EventInstant, RequestContext, ResponseContext, TelemetrySink};
use crate::error::BillingError;

const DEFAULT_SIGNUP_MODELS: &[&str] = &["gpt-4o", "gpt-4o-mini"];
const DEFAULT_KEY_DURATION: &str = "30d";

#[derive(Clone)]
pub struct BillingHttpState {
    pool: Arc<UsagePool>,
    telemetry: TelemetrySink,
    gateway: Arc<dyn AdminGateway>,
    webhook_secret: Option<String>,
    webhook_tolerance_secs: u64,
    free_tier_usd: Decimal,
    dedup_charges: bool,
    signup_models: Vec<String>,
    key_duration: String,
    api_base: Option<String>,
}

impl BillingHttpState {
    pub fn new(pool: Arc<UsagePool>, gateway: Arc<dyn AdminGateway>) -> Self {
        Self {
            telemetry: TelemetrySink::new(pool.clone()),
            pool,
            gateway,
            webhook_secret: None,
            webhook_tolerance_secs: DEFAULT_TOLERANCE_SECS,
            free_tier_usd: default_free_tier_usd(),
            dedup_charges: false,
            signup_models: DEFAULT_SIGNUP_MODELS
                .iter()
                .map(|model| model.to_string())
                .collect(),
            key_duration: DEFAULT_KEY_DURATION.to_string(),
            api_base: None,
        }
    }

    pub fn with_stripe_settings(mut self, settings: StripeSettings) -> Self {
        self.webhook_secret = settings.webhook_secret;
        self
    }

    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.webhook_secret = Some(secret.into());
        self
    }

    pub fn with_webhook_tolerance_secs(mut self, tolerance_secs: u64) -> Self {
        self.webhook_tolerance_secs = tolerance_secs;
        self
    }

    pub fn with_free_tier(mut self, amount_usd: Decimal) -> Self {
        self.free_tier_usd = amount_usd;
        self
    }

    pub fn with_charge_dedup(mut self, enabled: bool) -> Self {
        self.dedup_charges = enabled;
        self
    }

    pub fn with_signup_models(mut self, models: Vec<String>) -> Self {
        self.signup_models = models;
        self
    }

    pub fn with_key_duration(mut self, duration: impl Into<String>) -> Self {
        self.key_duration = duration.into();
        self
    }

    /// Base URL handed to new tenants in the signup response.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = Some(api_base.into());
        self
    }

    fn ledger(&self, pool: sqlx::PgPool) -> Ledger {
        Ledger::new(pool)
            .with_free_tier(self.free_tier_usd)
            .with_charge_dedup(self.dedup_charges)
    }
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

fn error_response(
    status: StatusCode,
    code: &str,
    message: &str,
) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                code: code.to_string(),
                message: message.to_string(),
            },
        }),
    )
}

#[derive(Debug, Serialize)]
struct AckResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub fn router(state: BillingHttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/user/signup", post(signup))
        .route("/webhook/stripe", post(stripe_webhook))
        .route("/telemetry/event", post(telemetry_event))
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Tenant identity is the customer email, normalized.
fn normalize_tenant(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Default, Deserialize)]
struct SignupRequest {
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Serialize)]
struct SignupResponse {
    status: &'static str,
    message: String,
    api_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_base: Option<String>,
}

async fn signup(
    State(state): State<BillingHttpState>,
    Json(payload): Json<SignupRequest>,
) -> Result<(StatusCode, Json<SignupResponse>), (StatusCode, Json<ErrorResponse>)> {
    let email = payload
        .email
        .as_deref()
        .map(str::trim)
        .filter(|email| !email.is_empty())
        .ok_or_else(|| {
            error_response(StatusCode::BAD_REQUEST, "invalid_request", "email required")
        })?;
    let tenant_id = normalize_tenant(email);

    let Some(pool) = state.pool.acquire().await else {
        return Err(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "unavailable",
            "database unavailable",
        ));
    };
    let ledger = state.ledger(pool);

    let created = ledger.create_customer(&tenant_id, email).await.map_err(|err| {
        tracing::error!(error = %err, "signup insert failed");
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "internal error",
        )
    })?;
    if !created {
        return Err(error_response(
            StatusCode::CONFLICT,
            "conflict",
            "user already exists",
        ));
    }

    let request = KeyRequest {
        user_id: tenant_id.clone(),
        models: state.signup_models.clone(),
        max_budget_usd: state.free_tier_usd,
        duration: state.key_duration.clone(),
    };
    // The customer row is not rolled back on issuance failure; a retried
    // signup then reports a conflict even though no key exists yet.
    let api_key = state.gateway.generate_key(&request).await.map_err(|err| {
        tracing::error!(error = %err, tenant_id = %tenant_id, "key issuance failed");
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "provisioning_failed",
            "failed to provision API key",
        )
    })?;

    tracing::info!(tenant_id = %tenant_id, "tenant created");
    Ok((
        StatusCode::CREATED,
        Json(SignupResponse {
            status: "success",
            message: format!("Account created with ${} free credit", state.free_tier_usd),
            api_key,
            api_base: state.api_base.clone(),
        }),
    ))
}

/// One webhook delivery: verify, then either ignore (always 200, providers
/// redeliver anything else) or apply the credit and sync the budget.
/// Internal failures after verification are logged, never surfaced, so the
/// provider does not retry into a double credit.
async fn stripe_webhook(
    State(state): State<BillingHttpState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<AckResponse>, (StatusCode, Json<ErrorResponse>)> {
    let Some(secret) = state.webhook_secret.as_deref() else {
        return Err(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "not_configured",
            "webhook secret not configured",
        ));
    };

    let signature = headers
        .get("stripe-signature")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    let event = match stripe::construct_event(
        &body,
        signature,
        secret,
        state.webhook_tolerance_secs,
        now_epoch(),
    ) {
        Ok(event) => event,
        Err(BillingError::InvalidPayload(reason)) => {
            tracing::warn!(reason = %reason, "webhook payload rejected");
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                "invalid_payload",
                "invalid payload",
            ));
        }
        Err(err) => {
            tracing::warn!(error = %err, "webhook signature rejected");
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                "invalid_signature",
                "invalid signature",
            ));
        }
    };

    let ack = Json(AckResponse { status: "success" });

    if event.kind != CHECKOUT_SESSION_COMPLETED {
        return Ok(ack);
    }
    let session = event.data.object;
    let Some(email) = session.customer_email() else {
        return Ok(ack);
    };
    let tenant_id = normalize_tenant(email);
    let amount_usd = stripe::minor_units_to_usd(session.amount_total.unwrap_or(0));

    tracing::info!(
        tenant_id = %tenant_id,
        amount_usd = %amount_usd,
        charge_id = ?session.payment_intent,
        "payment received"
    );

    let Some(pool) = state.pool.acquire().await else {
        tracing::warn!(tenant_id = %tenant_id, "database unavailable; credit dropped");
        return Ok(ack);
    };
    let ledger = state.ledger(pool);

    match ledger
        .credit_with_transaction(
            &tenant_id,
            email,
            amount_usd,
            session.payment_intent.as_deref(),
            "Stripe Checkout",
        )
        .await
    {
        Ok(outcome) if outcome.duplicate => {
            tracing::info!(
                tenant_id = %tenant_id,
                charge_id = ?session.payment_intent,
                "duplicate charge ignored"
            );
        }
        Ok(outcome) => {
            let total_budget = ledger.total_budget(outcome.new_balance);
            if let Err(err) = state.gateway.push_budget(&tenant_id, total_budget).await {
                // Ledger already committed; the gateway catches up on the
                // next successful sync for this tenant.
                tracing::warn!(error = %err, tenant_id = %tenant_id, "budget sync failed");
            }
        }
        Err(err) => {
            tracing::error!(error = %err, tenant_id = %tenant_id, "credit failed");
        }
    }

    Ok(ack)
}

#[derive(Debug, Default, Deserialize)]
struct TelemetryEventBody {
    #[serde(default)]
    request: Option<RequestContext>,
    #[serde(default)]
    response: Option<ResponseContext>,
    #[serde(default)]
    start_time: Option<EventInstant>,
    #[serde(default)]
    end_time: Option<EventInstant>,
}

/// Ingest surface for the gateway's request-completion callback.
/// Fire-and-forget: the response never depends on persistence succeeding.
async fn telemetry_event(
    State(state): State<BillingHttpState>,
    Json(body): Json<TelemetryEventBody>,
) -> Json<AckResponse> {
    state
        .telemetry
        .log_event(
            body.request.as_ref(),
            body.response.as_ref(),
            body.start_time,
            body.end_time,
        )
        .await;
    Json(AckResponse { status: "ok" })
}
