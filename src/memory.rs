//! In-process backend for all three stores.
//!
//! Every table lives behind one mutex, so each operation is a single
//! critical section: uniqueness checks and token consumption are atomic, and
//! user deletion runs the `SET NULL` / `CASCADE` hooks Postgres would.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::audit::{
    clamp_limit, AuditFilter, AuditLog, AuditLogEntry, AuditPage, NewAuditEntry, Pagination,
};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::reset::{expiry, generate_token, PasswordResetToken, ResetTokenStore, ISSUE_ATTEMPTS};
use crate::users::{normalize_email, prepare, NewUser, User, UserFilter, UserId, UserStats, UserStore};

#[derive(Default)]
struct Tables {
    users: BTreeMap<UserId, User>,
    audit: Vec<AuditLogEntry>,
    tokens: BTreeMap<i64, PasswordResetToken>,
    last_user_id: UserId,
    last_audit_id: i64,
    last_token_id: i64,
}

impl Tables {
    fn email_taken(&self, email: &str) -> bool {
        self.users
            .values()
            .any(|u| u.email.as_deref() == Some(email))
    }

    fn user_mut(&mut self, id: UserId) -> Result<&mut User> {
        self.users.get_mut(&id).ok_or(Error::NotFound)
    }

    fn insert_token(
        &mut self,
        user_id: UserId,
        now: OffsetDateTime,
        ttl: Duration,
    ) -> Result<PasswordResetToken> {
        if !self.users.contains_key(&user_id) {
            return Err(Error::UserNotFound);
        }
        let expires_at = expiry(now, ttl)?;
        let secret = (0..ISSUE_ATTEMPTS)
            .map(|_| generate_token())
            .find(|candidate| !self.tokens.values().any(|t| &t.token == candidate))
            .ok_or(Error::Conflict {
                constraint: Some("password_reset_tokens_token_key".into()),
            })?;
        self.last_token_id += 1;
        let token = PasswordResetToken {
            id: self.last_token_id,
            user_id,
            token: secret,
            created_at: now,
            expires_at,
            used: false,
        };
        self.tokens.insert(token.id, token.clone());
        Ok(token)
    }

    fn revoke_unused(&mut self, user_id: UserId) -> u64 {
        let before = self.tokens.len();
        self.tokens.retain(|_, t| t.user_id != user_id || t.used);
        (before - self.tokens.len()) as u64
    }
}

pub struct MemoryStore {
    tables: Mutex<Tables>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            clock,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| Error::StorageUnavailable(anyhow::anyhow!("memory store poisoned")))
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn create(&self, new: NewUser) -> Result<User> {
        let new = prepare(new)?;
        let mut tables = self.lock()?;
        if let Some(email) = &new.email {
            if tables.email_taken(email) {
                return Err(Error::Conflict {
                    constraint: Some("ux_users_email".into()),
                });
            }
        }
        tables.last_user_id += 1;
        let user = User {
            id: tables.last_user_id,
            email: new.email,
            is_admin: new.is_admin,
            is_active: new.is_active,
            created_at: self.clock.now(),
            last_login_at: None,
        };
        tables.users.insert(user.id, user.clone());
        debug!(user_id = user.id, "user created");
        Ok(user)
    }

    async fn get(&self, id: UserId) -> Result<User> {
        self.lock()?.users.get(&id).cloned().ok_or(Error::NotFound)
    }

    async fn find_by_email(&self, email: &str) -> Result<User> {
        let email = normalize_email(email).map_err(|_| Error::NotFound)?;
        self.lock()?
            .users
            .values()
            .find(|u| u.email.as_deref() == Some(email.as_str()))
            .cloned()
            .ok_or(Error::NotFound)
    }

    async fn record_login(&self, id: UserId) -> Result<User> {
        let now = self.clock.now();
        let mut tables = self.lock()?;
        let user = tables.user_mut(id)?;
        if !user.is_active {
            return Err(Error::InactiveAccount);
        }
        user.last_login_at = Some(now);
        Ok(user.clone())
    }

    async fn set_active(&self, id: UserId, active: bool) -> Result<User> {
        let mut tables = self.lock()?;
        let user = tables.user_mut(id)?;
        user.is_active = active;
        Ok(user.clone())
    }

    async fn set_admin(&self, id: UserId, admin: bool) -> Result<User> {
        let mut tables = self.lock()?;
        let user = tables.user_mut(id)?;
        user.is_admin = admin;
        Ok(user.clone())
    }

    async fn delete(&self, id: UserId) -> Result<()> {
        let mut tables = self.lock()?;
        if tables.users.remove(&id).is_none() {
            return Err(Error::NotFound);
        }
        // audit_logs.user_id: ON DELETE SET NULL
        for entry in tables.audit.iter_mut().filter(|e| e.user_id == Some(id)) {
            entry.user_id = None;
        }
        // password_reset_tokens.user_id: ON DELETE CASCADE
        tables.tokens.retain(|_, t| t.user_id != id);
        Ok(())
    }

    async fn list(&self, filter: &UserFilter) -> Result<Vec<User>> {
        let tables = self.lock()?;
        let mut users: Vec<_> = tables.users.values().filter(|u| filter.matches(u)).cloned().collect();
        users.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(users
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect())
    }

    async fn stats(&self) -> Result<UserStats> {
        let tables = self.lock()?;
        Ok(tables.users.values().fold(UserStats::default(), |mut stats, user| {
            stats.total += 1;
            if user.is_active {
                stats.active += 1;
            } else {
                stats.suspended += 1;
            }
            if user.is_admin {
                stats.admins += 1;
            }
            stats
        }))
    }
}

#[async_trait]
impl AuditLog for MemoryStore {
    async fn append(&self, entry: NewAuditEntry) -> Result<AuditLogEntry> {
        let mut tables = self.lock()?;
        // Mirror the foreign key: unknown users are rejected.
        if let Some(user_id) = entry.user_id {
            if !tables.users.contains_key(&user_id) {
                return Err(Error::UserNotFound);
            }
        }
        tables.last_audit_id += 1;
        let row = AuditLogEntry {
            id: tables.last_audit_id,
            user_id: entry.user_id,
            action: entry.action,
            metadata: entry.metadata,
            ip_address: entry.ip_address,
            created_at: self.clock.now(),
        };
        tables.audit.push(row.clone());
        Ok(row)
    }

    async fn query(&self, filter: &AuditFilter, page: &Pagination) -> Result<AuditPage> {
        let limit = clamp_limit(page.limit);
        let tables = self.lock()?;
        let mut rows: Vec<_> = tables
            .audit
            .iter()
            .filter(|e| filter.matches(e))
            .filter(|e| page.after.map_or(true, |c| c.precedes(e)))
            .cloned()
            .collect();
        rows.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        rows.truncate(limit as usize + 1);
        Ok(AuditPage::from_overfetch(rows, limit))
    }

    async fn actions(&self) -> Result<Vec<String>> {
        let tables = self.lock()?;
        let mut actions: Vec<_> = tables.audit.iter().map(|e| e.action.clone()).collect();
        actions.sort();
        actions.dedup();
        Ok(actions)
    }
}

#[async_trait]
impl ResetTokenStore for MemoryStore {
    async fn issue(&self, user_id: UserId, ttl: Duration) -> Result<PasswordResetToken> {
        let now = self.clock.now();
        self.lock()?.insert_token(user_id, now, ttl)
    }

    async fn reissue(&self, user_id: UserId, ttl: Duration) -> Result<(PasswordResetToken, u64)> {
        let now = self.clock.now();
        let mut tables = self.lock()?;
        // Validate before revoking so a failed call changes nothing.
        if !tables.users.contains_key(&user_id) {
            return Err(Error::UserNotFound);
        }
        expiry(now, ttl)?;
        let revoked = tables.revoke_unused(user_id);
        let token = tables.insert_token(user_id, now, ttl)?;
        Ok((token, revoked))
    }

    async fn consume(&self, token: &str) -> Result<UserId> {
        let now = self.clock.now();
        let mut tables = self.lock()?;
        let row = tables
            .tokens
            .values_mut()
            .find(|t| t.token == token && t.is_consumable(now))
            .ok_or(Error::InvalidOrExpiredToken)?;
        row.used = true;
        Ok(row.user_id)
    }

    async fn find(&self, token: &str) -> Result<PasswordResetToken> {
        self.lock()?
            .tokens
            .values()
            .find(|t| t.token == token)
            .cloned()
            .ok_or(Error::NotFound)
    }

    async fn revoke_outstanding(&self, user_id: UserId) -> Result<u64> {
        Ok(self.lock()?.revoke_unused(user_id))
    }

    async fn purge_expired(&self, older_than: OffsetDateTime) -> Result<u64> {
        let mut tables = self.lock()?;
        let before = tables.tokens.len();
        tables.tokens.retain(|_, t| t.expires_at >= older_than);
        Ok((before - tables.tokens.len()) as u64)
    }
}
