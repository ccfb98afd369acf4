//! Account flows built on top of the three stores.

use std::sync::Arc;

use serde_json::json;
use time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::audit::{actions, AuditLog, NewAuditEntry};
use crate::error::{Error, Result};
use crate::reset::{PasswordResetToken, ResetTokenStore};
use crate::users::{NewUser, User, UserId, UserStore};

#[derive(Clone)]
pub struct IdentityService {
    users: Arc<dyn UserStore>,
    audit: Arc<dyn AuditLog>,
    tokens: Arc<dyn ResetTokenStore>,
    reset_ttl: Duration,
}

impl IdentityService {
    pub fn new(
        users: Arc<dyn UserStore>,
        audit: Arc<dyn AuditLog>,
        tokens: Arc<dyn ResetTokenStore>,
    ) -> Self {
        Self {
            users,
            audit,
            tokens,
            reset_ttl: Duration::hours(1),
        }
    }

    pub fn with_reset_ttl(mut self, ttl: Duration) -> Self {
        self.reset_ttl = ttl;
        self
    }

    /// Best-effort audit write. The flow that triggered it has already
    /// happened, so a failing audit store only gets logged.
    async fn record(&self, entry: NewAuditEntry) {
        let action = entry.action.clone();
        if let Err(e) = self.audit.append(entry).await {
            warn!(error = %e, %action, "audit write failed");
        }
    }

    #[instrument(skip(self, new), err)]
    pub async fn register(&self, new: NewUser, ip: Option<&str>) -> Result<User> {
        let user = self.users.create(new).await?;
        self.record(
            NewAuditEntry::new(actions::REGISTER)
                .user(user.id)
                .ip(ip)
                .metadata(json!({ "email": user.email })),
        )
        .await;
        info!(user_id = user.id, "user registered");
        Ok(user)
    }

    #[instrument(skip(self, email), err)]
    pub async fn login(&self, email: &str, ip: Option<&str>) -> Result<User> {
        let user = self.users.find_by_email(email).await?;
        match self.users.record_login(user.id).await {
            Ok(user) => {
                self.record(NewAuditEntry::new(actions::LOGIN).user(user.id).ip(ip)).await;
                Ok(user)
            }
            Err(Error::InactiveAccount) => {
                self.record(NewAuditEntry::new(actions::LOGIN_BLOCKED).user(user.id).ip(ip))
                    .await;
                Err(Error::InactiveAccount)
            }
            Err(e) => Err(e),
        }
    }

    /// Issue a fresh reset token for `email`, replacing any outstanding one.
    ///
    /// Unknown and suspended accounts yield `Ok(None)` so callers can answer
    /// identically whether or not the address exists.
    #[instrument(skip(self, email), err)]
    pub async fn request_password_reset(
        &self,
        email: &str,
        ip: Option<&str>,
    ) -> Result<Option<PasswordResetToken>> {
        let user = match self.users.find_by_email(email).await {
            Ok(user) => user,
            Err(Error::NotFound) => {
                debug!("password reset requested for unknown email");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if !user.is_active {
            debug!(user_id = user.id, "password reset requested for inactive user");
            return Ok(None);
        }

        let (token, revoked) = self.tokens.reissue(user.id, self.reset_ttl).await?;
        self.record(
            NewAuditEntry::new(actions::PASSWORD_RESET_REQUESTED)
                .user(user.id)
                .ip(ip)
                .metadata(json!({ "revoked": revoked })),
        )
        .await;
        Ok(Some(token))
    }

    #[instrument(skip(self, token), err)]
    pub async fn complete_password_reset(&self, token: &str, ip: Option<&str>) -> Result<UserId> {
        let user_id = self.tokens.consume(token).await?;
        self.record(
            NewAuditEntry::new(actions::PASSWORD_RESET_COMPLETED)
                .user(user_id)
                .ip(ip),
        )
        .await;
        Ok(user_id)
    }

    async fn require_admin(&self, actor: UserId) -> Result<()> {
        let actor = match self.users.get(actor).await {
            Ok(user) => user,
            Err(Error::NotFound) => return Err(Error::Forbidden("admin privileges required")),
            Err(e) => return Err(e),
        };
        if !(actor.is_admin && actor.is_active) {
            return Err(Error::Forbidden("admin privileges required"));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn suspend(&self, actor: UserId, target: UserId) -> Result<User> {
        self.require_admin(actor).await?;
        if actor == target {
            return Err(Error::Forbidden("cannot suspend yourself"));
        }
        let user = self.users.set_active(target, false).await?;
        self.admin_audit(actions::ADMIN_SUSPEND_USER, actor, &user).await;
        Ok(user)
    }

    #[instrument(skip(self), err)]
    pub async fn activate(&self, actor: UserId, target: UserId) -> Result<User> {
        self.require_admin(actor).await?;
        let user = self.users.set_active(target, true).await?;
        self.admin_audit(actions::ADMIN_ACTIVATE_USER, actor, &user).await;
        Ok(user)
    }

    #[instrument(skip(self), err)]
    pub async fn promote(&self, actor: UserId, target: UserId) -> Result<User> {
        self.require_admin(actor).await?;
        let user = self.users.set_admin(target, true).await?;
        self.admin_audit(actions::ADMIN_PROMOTE_USER, actor, &user).await;
        Ok(user)
    }

    #[instrument(skip(self), err)]
    pub async fn demote(&self, actor: UserId, target: UserId) -> Result<User> {
        self.require_admin(actor).await?;
        if actor == target {
            return Err(Error::Forbidden("cannot demote yourself"));
        }
        let user = self.users.set_admin(target, false).await?;
        self.admin_audit(actions::ADMIN_DEMOTE_USER, actor, &user).await;
        Ok(user)
    }

    #[instrument(skip(self), err)]
    pub async fn delete_user(&self, actor: UserId, target: UserId) -> Result<()> {
        self.require_admin(actor).await?;
        if actor == target {
            return Err(Error::Forbidden("cannot delete yourself"));
        }
        let user = self.users.get(target).await?;
        self.users.delete(target).await?;
        // Logged against the actor: the target row is gone.
        self.record(
            NewAuditEntry::new(actions::ADMIN_DELETE_USER)
                .user(actor)
                .metadata(json!({ "target_user_id": target, "email": user.email })),
        )
        .await;
        info!(target_user_id = target, "user deleted");
        Ok(())
    }

    async fn admin_audit(&self, action: &str, actor: UserId, target: &User) {
        self.record(
            NewAuditEntry::new(action)
                .user(actor)
                .metadata(json!({ "target_user_id": target.id, "email": target.email })),
        )
        .await;
    }
}
