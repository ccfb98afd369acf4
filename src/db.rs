use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::{postgres::PgPoolOptions, Executor, PgPool};

use crate::audit::PgAuditLog;
use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::reset::PgResetTokenStore;
use crate::services::IdentityService;
use crate::users::PgUserStore;

/// The schema script, also embedded by the sqlx migrator.
pub const SCHEMA: &str = include_str!("../migrations/20240601000000_users_audit_reset_tokens.sql");

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub config: Arc<AppConfig>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = Arc::new(AppConfig::from_env()?);
        let db = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.storage_timeout)
            .connect(&config.database_url)
            .await
            .context("connect to database")?;
        tracing::info!(max_connections = config.max_connections, "postgres connected");
        Ok(Self {
            db,
            config,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn users(&self) -> PgUserStore {
        PgUserStore::new(self.db.clone(), self.clock.clone(), self.config.storage_timeout)
    }

    pub fn audit(&self) -> PgAuditLog {
        PgAuditLog::new(self.db.clone(), self.clock.clone(), self.config.storage_timeout)
    }

    pub fn reset_tokens(&self) -> PgResetTokenStore {
        PgResetTokenStore::new(self.db.clone(), self.clock.clone(), self.config.storage_timeout)
    }

    pub fn identity(&self) -> IdentityService {
        IdentityService::new(
            Arc::new(self.users()),
            Arc::new(self.audit()),
            Arc::new(self.reset_tokens()),
        )
        .with_reset_ttl(self.config.reset_token_ttl())
    }
}

/// Apply pending migrations through the sqlx migrator.
pub async fn migrate(db: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(db)
        .await
        .context("run migrations")?;
    Ok(())
}

/// Run the schema script directly inside one transaction. Safe against a
/// database that already holds some or all of the objects.
pub async fn apply_schema(db: &PgPool) -> anyhow::Result<()> {
    let mut tx = db.begin().await.context("begin tx")?;
    (&mut *tx).execute(SCHEMA).await.context("apply schema")?;
    tx.commit().await.context("commit schema")?;
    Ok(())
}

/// Await a storage call, failing with [`Error::StorageUnavailable`] once
/// `limit` elapses.
pub(crate) async fn bounded<T, F>(limit: Duration, call: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(res) => res.map_err(Error::from),
        Err(_) => Err(Error::timed_out(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bounded_passes_results_through() {
        let ok = bounded(Duration::from_secs(1), async { Ok::<_, sqlx::Error>(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let missing = bounded(Duration::from_secs(1), async {
            Err::<(), _>(sqlx::Error::RowNotFound)
        })
        .await;
        assert!(matches!(missing, Err(Error::NotFound)));
    }

    #[tokio::test]
    async fn bounded_times_out() {
        let res = bounded(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, sqlx::Error>(())
        })
        .await;
        assert!(matches!(res, Err(Error::StorageUnavailable(_))));
    }

    #[test]
    fn schema_is_guarded() {
        for stmt in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let code: String = stmt
                .lines()
                .filter(|l| !l.trim_start().starts_with("--"))
                .collect::<Vec<_>>()
                .join(" ");
            if code.trim().is_empty() {
                continue;
            }
            assert!(code.contains("IF NOT EXISTS"), "unguarded statement: {code}");
        }
    }
}
