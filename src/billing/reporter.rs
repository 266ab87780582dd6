use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::BillingError;

/// Aggregated token volume for one tenant over a reporting window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TenantUsage {
    pub tenant_id: String,
    pub total_tokens: i64,
}

/// Sums attributable usage per tenant since the given cursor. Rows without a
/// tenant cannot be billed and are excluded.
pub async fn aggregate_tokens_since(
    pool: &PgPool,
    since: DateTime<Utc>,
) -> Result<Vec<TenantUsage>, sqlx::Error> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT tenant_id, COALESCE(SUM(total_tokens), 0)::BIGINT
         FROM llm_usage
         WHERE created_at >= $1 AND tenant_id IS NOT NULL
         GROUP BY tenant_id
         ORDER BY tenant_id",
    )
    .bind(since)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(tenant_id, total_tokens)| TenantUsage {
            tenant_id,
            total_tokens,
        })
        .collect())
}

/// Resolves aggregated usage against the tenant → subscription-item mapping.
/// Tenants without a mapping or without positive volume produce nothing.
pub fn to_report(
    usage: &[TenantUsage],
    subscription_items: &HashMap<String, String>,
) -> Vec<(String, i64)> {
    usage
        .iter()
        .filter(|entry| entry.total_tokens > 0)
        .filter_map(|entry| {
            subscription_items
                .get(&entry.tenant_id)
                .map(|item| (item.clone(), entry.total_tokens))
        })
        .collect()
}

/// Posts metered-usage quantities to the payment provider's
/// subscription-item endpoint.
#[derive(Clone)]
pub struct UsageReporter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl std::fmt::Debug for UsageReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageReporter")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl UsageReporter {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: "https://api.stripe.com".to_string(),
            api_key: api_key.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub async fn report_usage(
        &self,
        subscription_item_id: &str,
        quantity: i64,
        timestamp_epoch: i64,
    ) -> Result<(), BillingError> {
        let response = self
            .client
            .post(format!(
                "{}/v1/subscription_items/{}/usage_records",
                self.base_url, subscription_item_id
            ))
            .bearer_auth(&self.api_key)
            .form(&[
                ("quantity", quantity.to_string()),
                ("timestamp", timestamp_epoch.to_string()),
                ("action", "increment".to_string()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BillingError::Gateway { status, body });
        }
        Ok(())
    }

    /// Reports every positive quantity, logging and skipping failures.
    /// Returns how many items were accepted.
    pub async fn report_batch(&self, batch: &[(String, i64)], timestamp_epoch: i64) -> usize {
        let mut reported = 0;
        for (subscription_item_id, quantity) in batch {
            if *quantity <= 0 {
                continue;
            }
            match self
                .report_usage(subscription_item_id, *quantity, timestamp_epoch)
                .await
            {
                Ok(()) => reported += 1,
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        subscription_item_id = %subscription_item_id,
                        "usage report failed"
                    );
                }
            }
        }
        reported
    }
}
