use rust_decimal::Decimal;
use sqlx::PgPool;

use super::config::default_free_tier_usd;

/// Budget enforced by the external gateway: free tier plus purchased balance.
pub fn derive_total_budget(free_tier_usd: Decimal, balance_usd: Decimal) -> Decimal {
    free_tier_usd + balance_usd
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CreditOutcome {
    pub new_balance: Decimal,
    /// True when the charge id was already recorded and no credit was applied.
    pub duplicate: bool,
}

/// Tenant balance table plus the append-only transaction log that justifies
/// it. Balances are only ever mutated through the atomic upsert below.
#[derive(Clone, Debug)]
pub struct Ledger {
    pool: PgPool,
    free_tier_usd: Decimal,
    dedup_charges: bool,
}

impl Ledger {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            free_tier_usd: default_free_tier_usd(),
            dedup_charges: false,
        }
    }

    pub fn with_free_tier(mut self, amount_usd: Decimal) -> Self {
        self.free_tier_usd = amount_usd;
        self
    }

    /// Reject payment-confirmation events whose charge id was already
    /// credited. Off by default: replayed webhooks then credit again, which
    /// matches the provider's at-least-once delivery contract.
    pub fn with_charge_dedup(mut self, enabled: bool) -> Self {
        self.dedup_charges = enabled;
        self
    }

    pub fn total_budget(&self, balance_usd: Decimal) -> Decimal {
        derive_total_budget(self.free_tier_usd, balance_usd)
    }

    pub async fn init_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS customers (
                tenant_id TEXT PRIMARY KEY,
                email TEXT,
                balance_usd NUMERIC NOT NULL DEFAULT 0
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS transactions (
                id BIGSERIAL PRIMARY KEY,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                tenant_id TEXT NOT NULL,
                stripe_charge_id TEXT,
                amount_usd NUMERIC NOT NULL,
                type TEXT NOT NULL,
                description TEXT
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_transactions_tenant_created
                ON transactions (tenant_id, created_at)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomic insert-or-add returning the resulting balance in the same
    /// statement. Safe under concurrent calls for the same tenant.
    pub async fn apply_credit(
        &self,
        tenant_id: &str,
        email: &str,
        amount_usd: Decimal,
    ) -> Result<Decimal, sqlx::Error> {
        sqlx::query_scalar::<_, Decimal>(
            "INSERT INTO customers (tenant_id, email, balance_usd)
             VALUES ($1, $2, $3)
             ON CONFLICT (tenant_id)
             DO UPDATE SET balance_usd = customers.balance_usd + EXCLUDED.balance_usd
             RETURNING balance_usd",
        )
        .bind(tenant_id)
        .bind(email)
        .bind(amount_usd)
        .fetch_one(&self.pool)
        .await
    }

    /// Applies a credit and appends the matching transaction row in a single
    /// database transaction, so a crash cannot leave the balance updated
    /// without its audit entry.
    pub async fn credit_with_transaction(
        &self,
        tenant_id: &str,
        email: &str,
        amount_usd: Decimal,
        charge_id: Option<&str>,
        description: &str,
    ) -> Result<CreditOutcome, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        if self.dedup_charges {
            if let Some(charge_id) = charge_id {
                let seen: Option<i32> = sqlx::query_scalar(
                    "SELECT 1 FROM transactions WHERE stripe_charge_id = $1 LIMIT 1",
                )
                .bind(charge_id)
                .fetch_optional(&mut *tx)
                .await?;
                if seen.is_some() {
                    let balance: Option<Decimal> = sqlx::query_scalar(
                        "SELECT balance_usd FROM customers WHERE tenant_id = $1",
                    )
                    .bind(tenant_id)
                    .fetch_optional(&mut *tx)
                    .await?;
                    return Ok(CreditOutcome {
                        new_balance: balance.unwrap_or(Decimal::ZERO),
                        duplicate: true,
                    });
                }
            }
        }

        let new_balance: Decimal = sqlx::query_scalar(
            "INSERT INTO customers (tenant_id, email, balance_usd)
             VALUES ($1, $2, $3)
             ON CONFLICT (tenant_id)
             DO UPDATE SET balance_usd = customers.balance_usd + EXCLUDED.balance_usd
             RETURNING balance_usd",
        )
        .bind(tenant_id)
        .bind(email)
        .bind(amount_usd)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO transactions (tenant_id, stripe_charge_id, amount_usd, type, description)
             VALUES ($1, $2, $3, 'credit', $4)",
        )
        .bind(tenant_id)
        .bind(charge_id)
        .bind(amount_usd)
        .bind(description)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(CreditOutcome {
            new_balance,
            duplicate: false,
        })
    }

    /// Signup path: inserts a zero-balance customer, or reports a conflict
    /// when the tenant already exists.
    pub async fn create_customer(&self, tenant_id: &str, email: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO customers (tenant_id, email, balance_usd)
             VALUES ($1, $2, 0)
             ON CONFLICT (tenant_id) DO NOTHING",
        )
        .bind(tenant_id)
        .bind(email)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn balance(&self, tenant_id: &str) -> Result<Option<Decimal>, sqlx::Error> {
        sqlx::query_scalar("SELECT balance_usd FROM customers WHERE tenant_id = $1")
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn transaction_count(&self, tenant_id: &str) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM transactions WHERE tenant_id = $1")
            .bind(tenant_id)
            .fetch_one(&self.pool)
            .await
    }
}
