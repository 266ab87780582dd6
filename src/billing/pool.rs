use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use super::config::{Env, PgSettings};

const MIN_CONNECTIONS: u32 = 1;
const MAX_CONNECTIONS: u32 = 5;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
trait PoolOpener: Send + Sync {
    async fn open(&self, settings: &PgSettings) -> Result<PgPool, sqlx::Error>;
}

struct SqlxOpener;

#[async_trait]
impl PoolOpener for SqlxOpener {
    async fn open(&self, settings: &PgSettings) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .min_connections(MIN_CONNECTIONS)
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(CONNECT_TIMEOUT)
            .connect_with(settings.connect_options())
            .await
    }
}

enum SettingsSource {
    /// Re-read from the process environment on every creation attempt.
    Env,
    Fixed(Option<PgSettings>),
}

/// Shared database pool with lazy, once-only creation.
///
/// `acquire` never returns an error: missing configuration and connection
/// failures both degrade to `None` so the telemetry path can skip persistence
/// without affecting the gateway's request handling. Concurrent first callers
/// observe exactly one underlying pool creation; a failed attempt leaves the
/// slot empty so a later call may try again.
pub struct UsagePool {
    created: RwLock<Option<PgPool>>,
    create_lock: tokio::sync::Mutex<()>,
    source: SettingsSource,
    opener: Arc<dyn PoolOpener>,
}

impl std::fmt::Debug for UsagePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let created = self.cached().is_some();
        f.debug_struct("UsagePool").field("created", &created).finish()
    }
}

impl UsagePool {
    pub fn from_env() -> Self {
        Self::with_source(SettingsSource::Env)
    }

    pub fn with_settings(settings: PgSettings) -> Self {
        Self::with_source(SettingsSource::Fixed(Some(settings)))
    }

    /// A pool that always reports unavailable. Useful for wiring the HTTP
    /// surface without a database.
    pub fn unconfigured() -> Self {
        Self::with_source(SettingsSource::Fixed(None))
    }

    /// Wraps an already-created pool, for deployments that connect eagerly
    /// at process start.
    pub fn with_pool(pool: PgPool) -> Self {
        let wrapped = Self::with_source(SettingsSource::Fixed(None));
        if let Ok(mut slot) = wrapped.created.write() {
            *slot = Some(pool);
        }
        wrapped
    }

    fn with_source(source: SettingsSource) -> Self {
        Self {
            created: RwLock::new(None),
            create_lock: tokio::sync::Mutex::new(()),
            source,
            opener: Arc::new(SqlxOpener),
        }
    }

    #[cfg(test)]
    fn with_opener(mut self, opener: Arc<dyn PoolOpener>) -> Self {
        self.opener = opener;
        self
    }

    fn cached(&self) -> Option<PgPool> {
        self.created.read().ok().and_then(|slot| slot.clone())
    }

    fn resolve_settings(&self) -> Option<PgSettings> {
        match &self.source {
            SettingsSource::Env => PgSettings::from_env(&Env::new()),
            SettingsSource::Fixed(settings) => settings.clone(),
        }
    }

    pub async fn acquire(&self) -> Option<PgPool> {
        if let Some(pool) = self.cached() {
            return Some(pool);
        }

        let _guard = self.create_lock.lock().await;
        if let Some(pool) = self.cached() {
            return Some(pool);
        }

        let Some(settings) = self.resolve_settings() else {
            tracing::warn!("database configuration incomplete; skipping usage persistence");
            return None;
        };

        match self.opener.open(&settings).await {
            Ok(pool) => {
                if let Ok(mut slot) = self.created.write() {
                    *slot = Some(pool.clone());
                }
                tracing::info!(
                    host = %settings.host,
                    database = %settings.database,
                    "created database pool"
                );
                Some(pool)
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to create database pool");
                None
            }
        }
    }
}
