use std::str::FromStr;
use std::time::Duration;

use anyhow::{ensure, Context};
use serde::Deserialize;

/// One year.
pub const MAX_RESET_TOKEN_TTL_MINUTES: i64 = 365 * 24 * 60;
/// Ten years.
pub const MAX_RESET_TOKEN_RETENTION_HOURS: i64 = 10 * 365 * 24;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// Upper bound for every storage call.
    pub storage_timeout: Duration,
    pub reset_token_ttl_minutes: i64,
    /// How long expired reset tokens are kept before `purge-expired` drops them.
    pub reset_token_retention_hours: i64,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL").context("DATABASE_URL is not set")?;
        let timeout_secs: u64 = parse_or(&lookup, "DB_TIMEOUT_SECS", 5)?;
        let reset_token_ttl_minutes: i64 = parse_or(&lookup, "RESET_TOKEN_TTL_MINUTES", 60)?;
        ensure!(
            (1..=MAX_RESET_TOKEN_TTL_MINUTES).contains(&reset_token_ttl_minutes),
            "RESET_TOKEN_TTL_MINUTES must be between 1 and {MAX_RESET_TOKEN_TTL_MINUTES}"
        );
        let reset_token_retention_hours: i64 = parse_or(&lookup, "RESET_TOKEN_RETENTION_HOURS", 24)?;
        ensure!(
            (0..=MAX_RESET_TOKEN_RETENTION_HOURS).contains(&reset_token_retention_hours),
            "RESET_TOKEN_RETENTION_HOURS must be between 0 and {MAX_RESET_TOKEN_RETENTION_HOURS}"
        );
        Ok(Self {
            database_url,
            max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", 10)?,
            storage_timeout: Duration::from_secs(timeout_secs),
            reset_token_ttl_minutes,
            reset_token_retention_hours,
        })
    }

    pub fn reset_token_ttl(&self) -> time::Duration {
        time::Duration::seconds(self.reset_token_ttl_minutes.saturating_mul(60))
    }
}

/// Expiry cutoff for `purge-expired`: tokens that expired before it are dropped.
pub fn purge_cutoff(now: time::OffsetDateTime, retention_hours: i64) -> anyhow::Result<time::OffsetDateTime> {
    ensure!(
        (0..=MAX_RESET_TOKEN_RETENTION_HOURS).contains(&retention_hours),
        "retention must be between 0 and {MAX_RESET_TOKEN_RETENTION_HOURS} hours"
    );
    now.checked_sub(time::Duration::hours(retention_hours))
        .context("retention window reaches before the earliest representable time")
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        None => Ok(default),
    }
}
