//! Append-only audit trail of actions taken by or against users.

use async_trait::async_trait;

use crate::error::Result;

pub mod repo;
pub mod repo_types;
pub mod stream;

pub use repo::PgAuditLog;
pub use repo_types::{
    AuditCursor, AuditFilter, AuditId, AuditLogEntry, AuditPage, NewAuditEntry, Pagination,
};

/// Largest page a single query returns.
pub const MAX_PAGE_SIZE: u32 = 500;

/// Action names written by the identity service.
pub mod actions {
    pub const REGISTER: &str = "register";
    pub const LOGIN: &str = "login";
    pub const LOGIN_BLOCKED: &str = "login_blocked";
    pub const PASSWORD_RESET_REQUESTED: &str = "password_reset_requested";
    pub const PASSWORD_RESET_COMPLETED: &str = "password_reset_completed";
    pub const ADMIN_SUSPEND_USER: &str = "admin_suspend_user";
    pub const ADMIN_ACTIVATE_USER: &str = "admin_activate_user";
    pub const ADMIN_PROMOTE_USER: &str = "admin_promote_user";
    pub const ADMIN_DEMOTE_USER: &str = "admin_demote_user";
    pub const ADMIN_DELETE_USER: &str = "admin_delete_user";
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Insert an entry stamped with `created_at = now`.
    async fn append(&self, entry: NewAuditEntry) -> Result<AuditLogEntry>;

    /// One page of matching entries, most recent first (ties: higher id first).
    async fn query(&self, filter: &AuditFilter, page: &Pagination) -> Result<AuditPage>;

    /// Distinct action names, sorted.
    async fn actions(&self) -> Result<Vec<String>>;
}

pub(crate) fn clamp_limit(limit: u32) -> u32 {
    limit.clamp(1, MAX_PAGE_SIZE)
}
