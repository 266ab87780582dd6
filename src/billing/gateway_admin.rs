use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

use super::config::GatewaySettings;
use crate::error::BillingError;

/// Parameters for a scoped credential issued by the external gateway.
#[derive(Clone, Debug)]
pub struct KeyRequest {
    pub user_id: String,
    pub models: Vec<String>,
    pub max_budget_usd: Decimal,
    pub duration: String,
}

/// Admin surface of the external gateway. The HTTP implementation below is
/// the production one; tests substitute a recording fake.
#[async_trait]
pub trait AdminGateway: Send + Sync {
    /// Sets the spend ceiling the gateway enforces for a tenant's
    /// credentials. Best-effort from the caller's point of view: the ledger
    /// write has already succeeded and remains the source of truth.
    async fn push_budget(&self, tenant_id: &str, max_budget_usd: Decimal)
    -> Result<(), BillingError>;

    /// Issues a new scoped credential and returns its token.
    async fn generate_key(&self, request: &KeyRequest) -> Result<String, BillingError>;
}

#[derive(Debug, Serialize)]
struct UserUpdateBody<'a> {
    user_id: &'a str,
    max_budget: f64,
}

#[derive(Debug, Serialize)]
struct KeyGenerateBody<'a> {
    user_id: &'a str,
    models: &'a [String],
    max_budget: f64,
    duration: &'a str,
}

#[derive(Debug, Deserialize)]
struct KeyGenerateResponse {
    key: String,
}

#[derive(Clone)]
pub struct HttpAdminGateway {
    client: reqwest::Client,
    base_url: String,
    master_key: String,
}

impl std::fmt::Debug for HttpAdminGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAdminGateway")
            .field("base_url", &self.base_url)
            .field("master_key", &"<redacted>")
            .finish()
    }
}

impl HttpAdminGateway {
    pub fn new(settings: GatewaySettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            master_key: settings.master_key,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn rejection(response: reqwest::Response) -> BillingError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        BillingError::Gateway { status, body }
    }
}

/// The gateway's admin API speaks plain JSON floats for budgets.
fn budget_as_float(amount_usd: Decimal) -> f64 {
    amount_usd.to_f64().unwrap_or_default()
}

#[async_trait]
impl AdminGateway for HttpAdminGateway {
    async fn push_budget(
        &self,
        tenant_id: &str,
        max_budget_usd: Decimal,
    ) -> Result<(), BillingError> {
        let response = self
            .client
            .post(format!("{}/user/update", self.base_url))
            .bearer_auth(&self.master_key)
            .json(&UserUpdateBody {
                user_id: tenant_id,
                max_budget: budget_as_float(max_budget_usd),
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::rejection(response).await);
        }
        Ok(())
    }

    async fn generate_key(&self, request: &KeyRequest) -> Result<String, BillingError> {
        let response = self
            .client
            .post(format!("{}/key/generate", self.base_url))
            .bearer_auth(&self.master_key)
            .json(&KeyGenerateBody {
                user_id: &request.user_id,
                models: &request.models,
                max_budget: budget_as_float(request.max_budget_usd),
                duration: &request.duration,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::rejection(response).await);
        }
        let body: KeyGenerateResponse = response.json().await?;
        Ok(body.key)
    }
}
