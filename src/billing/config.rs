use std::collections::BTreeMap;
use std::str::FromStr;

use rust_decimal::Decimal;
use sqlx::postgres::{PgConnectOptions, PgSslMode};

/// Lookup for environment-sourced configuration. Entries in the overlay map
/// win over process environment variables, which keeps config parsing
/// deterministic in tests.
#[derive(Clone, Default)]
pub struct Env {
    overrides: BTreeMap<String, String>,
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<&str> = self.overrides.keys().map(|key| key.as_str()).collect();
        f.debug_struct("Env").field("override_keys", &keys).finish()
    }
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(overrides: BTreeMap<String, String>) -> Self {
        Self { overrides }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(value) = self.overrides.get(key) {
            return Some(value.clone()).filter(|value| !value.trim().is_empty());
        }
        std::env::var(key)
            .ok()
            .filter(|value| !value.trim().is_empty())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SslRequirement {
    #[default]
    Require,
    Disable,
}

/// Connection settings for the usage/billing database.
///
/// Recognized variables: `PGHOST`, `PGPORT` (default 5432), `PGUSER`,
/// `PGPASSWORD`, `PGDATABASE`, `PGSSL` (`require` by default, `disable`
/// skips TLS entirely).
#[derive(Clone)]
pub struct PgSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub ssl: SslRequirement,
}

impl std::fmt::Debug for PgSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("ssl", &self.ssl)
            .finish()
    }
}

impl PgSettings {
    /// Returns `None` when any required variable is absent; the caller treats
    /// that as "persistence disabled", not as an error.
    pub fn from_env(env: &Env) -> Option<Self> {
        let host = env.get("PGHOST")?;
        let user = env.get("PGUSER")?;
        let password = env.get("PGPASSWORD")?;
        let database = env.get("PGDATABASE")?;
        let port = env
            .get("PGPORT")
            .and_then(|raw| raw.trim().parse::<u16>().ok())
            .unwrap_or(5432);
        let ssl = match env.get("PGSSL").as_deref() {
            Some(mode) if mode.eq_ignore_ascii_case("disable") => SslRequirement::Disable,
            _ => SslRequirement::Require,
        };
        Some(Self {
            host,
            port,
            user,
            password,
            database,
            ssl,
        })
    }

    pub fn connect_options(&self) -> PgConnectOptions {
        let ssl_mode = match self.ssl {
            SslRequirement::Require => PgSslMode::Require,
            SslRequirement::Disable => PgSslMode::Disable,
        };
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
            .ssl_mode(ssl_mode)
    }
}

/// Admin surface of the external gateway.
#[derive(Clone)]
pub struct GatewaySettings {
    pub base_url: String,
    pub master_key: String,
}

impl std::fmt::Debug for GatewaySettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewaySettings")
            .field("base_url", &self.base_url)
            .field("master_key", &"<redacted>")
            .finish()
    }
}

impl GatewaySettings {
    pub fn from_env(env: &Env) -> Self {
        Self {
            base_url: env
                .get("GATEWAY_URL")
                .unwrap_or_else(|| "http://127.0.0.1:4000".to_string()),
            master_key: env.get("GATEWAY_MASTER_KEY").unwrap_or_default(),
        }
    }
}

#[derive(Clone, Default)]
pub struct StripeSettings {
    pub webhook_secret: Option<String>,
    pub api_key: Option<String>,
}

impl std::fmt::Debug for StripeSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeSettings")
            .field("webhook_secret", &self.webhook_secret.as_ref().map(|_| "<redacted>"))
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl StripeSettings {
    pub fn from_env(env: &Env) -> Self {
        Self {
            webhook_secret: env.get("STRIPE_WEBHOOK_SECRET"),
            api_key: env.get("STRIPE_API_KEY"),
        }
    }
}

pub fn default_free_tier_usd() -> Decimal {
    Decimal::new(50, 2)
}

/// Initial budget granted to every tenant, additive to purchased balance.
/// `FREE_TIER_USD` overrides the 0.50 default; unparsable values fall back.
pub fn free_tier_usd(env: &Env) -> Decimal {
    env.get("FREE_TIER_USD")
        .and_then(|raw| Decimal::from_str(raw.trim()).ok())
        .filter(|amount| !amount.is_sign_negative())
        .unwrap_or_else(default_free_tier_usd)
}
