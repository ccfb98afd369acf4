use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::instrument;

use super::repo_types::{AuditFilter, AuditLogEntry, AuditPage, NewAuditEntry, Pagination};
use super::{clamp_limit, AuditLog};
use crate::clock::Clock;
use crate::db::bounded;
use crate::error::Result;

/// Postgres-backed [`AuditLog`].
#[derive(Clone)]
pub struct PgAuditLog {
    db: PgPool,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl PgAuditLog {
    pub fn new(db: PgPool, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self { db, clock, timeout }
    }
}

/// Escape LIKE wildcards so the filter is matched literally.
fn like_pattern(needle: &str) -> String {
    let escaped = needle
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

#[async_trait]
impl AuditLog for PgAuditLog {
    #[instrument(skip(self, entry), fields(action = %entry.action, user_id = ?entry.user_id), err)]
    async fn append(&self, entry: NewAuditEntry) -> Result<AuditLogEntry> {
        bounded(
            self.timeout,
            sqlx::query_as::<_, AuditLogEntry>(
                r#"
                INSERT INTO audit_logs (user_id, action, metadata, ip_address, created_at)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING id, user_id, action, metadata, ip_address, created_at
                "#,
            )
            .bind(entry.user_id)
            .bind(&entry.action)
            .bind(&entry.metadata)
            .bind(&entry.ip_address)
            .bind(self.clock.now())
            .fetch_one(&self.db),
        )
        .await
    }

    #[instrument(skip(self, filter, page), fields(limit = page.limit), err)]
    async fn query(&self, filter: &AuditFilter, page: &Pagination) -> Result<AuditPage> {
        let limit = clamp_limit(page.limit);
        // Stored text never contains NUL, and Postgres rejects it as a parameter.
        if filter.action.as_deref().is_some_and(|a| a.contains('\0')) {
            return Ok(AuditPage::from_overfetch(Vec::new(), limit));
        }
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT id, user_id, action, metadata, ip_address, created_at FROM audit_logs WHERE TRUE",
        );
        if let Some(user_id) = filter.user_id {
            qb.push(" AND user_id = ").push_bind(user_id);
        }
        if let Some(action) = &filter.action {
            qb.push(" AND action ILIKE ").push_bind(like_pattern(action));
        }
        if let Some(from) = filter.from {
            qb.push(" AND created_at >= ").push_bind(from);
        }
        if let Some(until) = filter.until {
            qb.push(" AND created_at < ").push_bind(until);
        }
        if let Some(after) = page.after {
            qb.push(" AND (created_at, id) < (")
                .push_bind(after.created_at)
                .push(", ")
                .push_bind(after.id)
                .push(")");
        }
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(i64::from(limit) + 1);

        let rows = bounded(self.timeout, qb.build_query_as::<AuditLogEntry>().fetch_all(&self.db)).await?;
        Ok(AuditPage::from_overfetch(rows, limit))
    }

    #[instrument(skip(self), err)]
    async fn actions(&self) -> Result<Vec<String>> {
        bounded(
            self.timeout,
            sqlx::query_scalar::<_, String>("SELECT DISTINCT action FROM audit_logs ORDER BY action")
                .fetch_all(&self.db),
        )
        .await
    }
}
