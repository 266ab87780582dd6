use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

/// One row per completed gateway request. `created_at` is assigned by the
/// database at insert time; rows are never updated or deleted.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub tenant_id: Option<String>,
    pub model: Option<String>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub latency_ms: i64,
    pub status: Option<String>,
    pub cost_usd: Option<Decimal>,
    pub request_id: Option<String>,
}

pub async fn init_usage_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS llm_usage (
            id BIGSERIAL PRIMARY KEY,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            tenant_id TEXT,
            model TEXT,
            prompt_tokens BIGINT,
            completion_tokens BIGINT,
            total_tokens BIGINT,
            latency_ms BIGINT NOT NULL DEFAULT 0,
            status TEXT,
            cost_usd NUMERIC,
            request_id TEXT
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_llm_usage_tenant_created
            ON llm_usage (tenant_id, created_at)",
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Unconditional append; no upsert semantics. The caller decides what a
/// failure means.
pub async fn insert_usage(pool: &PgPool, record: &UsageRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO llm_usage (
            created_at,
            tenant_id,
            model,
            prompt_tokens,
            completion_tokens,
            total_tokens,
            latency_ms,
            status,
            cost_usd,
            request_id
        ) VALUES (NOW(), $1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(record.tenant_id.as_deref())
    .bind(record.model.as_deref())
    .bind(record.prompt_tokens)
    .bind(record.completion_tokens)
    .bind(record.total_tokens)
    .bind(record.latency_ms)
    .bind(record.status.as_deref())
    .bind(record.cost_usd)
    .bind(record.request_id.as_deref())
    .execute(pool)
    .await?;
    Ok(())
}
