use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use time::OffsetDateTime;

use crate::users::UserId;

pub type AuditId = i64;

/// One immutable row of the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct AuditLogEntry {
    pub id: AuditId,
    pub user_id: Option<UserId>, // cleared when the user is deleted
    pub action: String,
    pub metadata: Option<Value>,
    pub ip_address: Option<String>,
    pub created_at: OffsetDateTime,
}

impl AuditLogEntry {
    pub fn cursor(&self) -> AuditCursor {
        AuditCursor {
            created_at: self.created_at,
            id: self.id,
        }
    }
}

/// Entry to append.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditEntry {
    pub user_id: Option<UserId>,
    pub action: String,
    pub metadata: Option<Value>,
    pub ip_address: Option<String>,
}

impl NewAuditEntry {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            user_id: None,
            action: action.into(),
            metadata: None,
            ip_address: None,
        }
    }

    pub fn user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn ip(mut self, ip: Option<&str>) -> Self {
        self.ip_address = ip.map(str::to_owned);
        self
    }
}

/// Audit query filters. All present filters must match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditFilter {
    pub user_id: Option<UserId>,
    /// Case-insensitive substring of the action name.
    pub action: Option<String>,
    /// Inclusive lower bound on `created_at`.
    pub from: Option<OffsetDateTime>,
    /// Exclusive upper bound on `created_at`.
    pub until: Option<OffsetDateTime>,
}

impl AuditFilter {
    pub(crate) fn matches(&self, entry: &AuditLogEntry) -> bool {
        if let Some(user_id) = self.user_id {
            if entry.user_id != Some(user_id) {
                return false;
            }
        }
        if let Some(action) = &self.action {
            if !entry.action.to_lowercase().contains(&action.to_lowercase()) {
                return false;
            }
        }
        self.from.map_or(true, |from| entry.created_at >= from)
            && self.until.map_or(true, |until| entry.created_at < until)
    }
}

/// Position in the `(created_at DESC, id DESC)` ordering. Pages resume
/// strictly after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditCursor {
    pub created_at: OffsetDateTime,
    pub id: AuditId,
}

impl AuditCursor {
    /// Whether `entry` sorts after this cursor, i.e. belongs to a later page.
    pub(crate) fn precedes(&self, entry: &AuditLogEntry) -> bool {
        (entry.created_at, entry.id) < (self.created_at, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub after: Option<AuditCursor>,
    pub limit: u32,
}

impl Pagination {
    pub fn first(limit: u32) -> Self {
        Self { after: None, limit }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::first(50)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditPage {
    pub entries: Vec<AuditLogEntry>,
    /// Cursor for the next page; `None` once the sequence is exhausted.
    pub next: Option<AuditCursor>,
}

impl AuditPage {
    /// Build a page from up to `limit + 1` ordered rows.
    pub(crate) fn from_overfetch(mut rows: Vec<AuditLogEntry>, limit: u32) -> Self {
        let limit = limit as usize;
        let next = if rows.len() > limit {
            rows.truncate(limit);
            rows.last().map(AuditLogEntry::cursor)
        } else {
            None
        };
        Self { entries: rows, next }
    }
}
