use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use tracing::{debug, instrument, warn};

use super::repo_types::PasswordResetToken;
use super::{expiry, generate_token, storable, ResetTokenStore, ISSUE_ATTEMPTS};
use crate::clock::Clock;
use crate::db::bounded;
use crate::error::{Error, Result};
use crate::users::UserId;

/// Postgres-backed [`ResetTokenStore`].
#[derive(Clone)]
pub struct PgResetTokenStore {
    db: PgPool,
    clock: Arc<dyn Clock>,
    timeout: StdDuration,
}

impl PgResetTokenStore {
    pub fn new(db: PgPool, clock: Arc<dyn Clock>, timeout: StdDuration) -> Self {
        Self { db, clock, timeout }
    }

    async fn insert(&self, user_id: UserId, ttl: Duration) -> Result<PasswordResetToken> {
        let now = self.clock.now();
        let expires_at = expiry(now, ttl)?;
        bounded(
            self.timeout,
            sqlx::query_as::<_, PasswordResetToken>(
                r#"
                INSERT INTO password_reset_tokens (user_id, token, created_at, expires_at, used)
                VALUES ($1, $2, $3, $4, FALSE)
                RETURNING id, user_id, token, created_at, expires_at, used
                "#,
            )
            .bind(user_id)
            .bind(generate_token())
            .bind(now)
            .bind(expires_at)
            .fetch_one(&self.db),
        )
        .await
    }

    /// One revoke-and-insert transaction. `None` when the user does not exist.
    async fn replace(
        &self,
        user_id: UserId,
        ttl: Duration,
    ) -> Result<Option<(PasswordResetToken, u64)>> {
        let now = self.clock.now();
        let expires_at = expiry(now, ttl)?;
        bounded(self.timeout, self.replace_tx(user_id, now, expires_at)).await
    }

    async fn replace_tx(
        &self,
        user_id: UserId,
        now: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> std::result::Result<Option<(PasswordResetToken, u64)>, sqlx::Error> {
        let mut tx = self.db.begin().await?;
        // The row lock serialises concurrent reissues for the same user.
        let locked = sqlx::query_scalar::<_, UserId>("SELECT id FROM users WHERE id = $1 FOR UPDATE")
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?;
        if locked.is_none() {
            return Ok(None);
        }
        let revoked = sqlx::query("DELETE FROM password_reset_tokens WHERE user_id = $1 AND used = FALSE")
            .bind(user_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let token = sqlx::query_as::<_, PasswordResetToken>(
            r#"
            INSERT INTO password_reset_tokens (user_id, token, created_at, expires_at, used)
            VALUES ($1, $2, $3, $4, FALSE)
            RETURNING id, user_id, token, created_at, expires_at, used
            "#,
        )
        .bind(user_id)
        .bind(generate_token())
        .bind(now)
        .bind(expires_at)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Some((token, revoked)))
    }
}

#[async_trait]
impl ResetTokenStore for PgResetTokenStore {
    #[instrument(skip(self), err)]
    async fn issue(&self, user_id: UserId, ttl: Duration) -> Result<PasswordResetToken> {
        let mut attempt = 1;
        loop {
            match self.insert(user_id, ttl).await {
                Ok(token) => {
                    debug!(token_id = token.id, expires_at = %token.expires_at, "reset token issued");
                    return Ok(token);
                }
                Err(Error::Conflict { .. }) if attempt < ISSUE_ATTEMPTS => {
                    warn!(attempt, "reset token secret collided, drawing again");
                    attempt += 1;
                }
                // Unknown users surface here as UserNotFound via the foreign key.
                Err(err) => return Err(err),
            }
        }
    }

    #[instrument(skip(self), err)]
    async fn reissue(&self, user_id: UserId, ttl: Duration) -> Result<(PasswordResetToken, u64)> {
        let mut attempt = 1;
        loop {
            match self.replace(user_id, ttl).await {
                Ok(Some((token, revoked))) => {
                    debug!(token_id = token.id, revoked, "reset token reissued");
                    return Ok((token, revoked));
                }
                Ok(None) => return Err(Error::UserNotFound),
                Err(Error::Conflict { .. }) if attempt < ISSUE_ATTEMPTS => {
                    warn!(attempt, "reset token secret collided, drawing again");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    #[instrument(skip(self, token), err)]
    async fn consume(&self, token: &str) -> Result<UserId> {
        if !storable(token) {
            return Err(Error::InvalidOrExpiredToken);
        }
        // Single conditional UPDATE: concurrent consumers serialise on the row
        // lock and only the first still sees `used = FALSE`.
        bounded(
            self.timeout,
            sqlx::query_scalar::<_, UserId>(
                r#"
                UPDATE password_reset_tokens
                SET used = TRUE
                WHERE token = $1 AND used = FALSE AND expires_at > $2
                RETURNING user_id
                "#,
            )
            .bind(token)
            .bind(self.clock.now())
            .fetch_optional(&self.db),
        )
        .await?
        .ok_or(Error::InvalidOrExpiredToken)
    }

    #[instrument(skip(self, token), err)]
    async fn find(&self, token: &str) -> Result<PasswordResetToken> {
        if !storable(token) {
            return Err(Error::NotFound);
        }
        bounded(
            self.timeout,
            sqlx::query_as::<_, PasswordResetToken>(
                "SELECT id, user_id, token, created_at, expires_at, used \
                 FROM password_reset_tokens WHERE token = $1",
            )
            .bind(token)
            .fetch_optional(&self.db),
        )
        .await?
        .ok_or(Error::NotFound)
    }

    #[instrument(skip(self), err)]
    async fn revoke_outstanding(&self, user_id: UserId) -> Result<u64> {
        let res = bounded(
            self.timeout,
            sqlx::query("DELETE FROM password_reset_tokens WHERE user_id = $1 AND used = FALSE")
                .bind(user_id)
                .execute(&self.db),
        )
        .await?;
        Ok(res.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn purge_expired(&self, older_than: OffsetDateTime) -> Result<u64> {
        let res = bounded(
            self.timeout,
            sqlx::query("DELETE FROM password_reset_tokens WHERE expires_at < $1")
                .bind(older_than)
                .execute(&self.db),
        )
        .await?;
        Ok(res.rows_affected())
    }
}
