//! Reset Token Store: short-lived, single-use password reset tokens.

use async_trait::async_trait;
use rand::distributions::{Alphanumeric, DistString};
use rand::rngs::OsRng;
use time::{Duration, OffsetDateTime};

use crate::error::{Error, Result};
use crate::users::UserId;

pub mod repo;
pub mod repo_types;

pub use repo::PgResetTokenStore;
pub use repo_types::{PasswordResetToken, TokenState};

pub const TOKEN_LENGTH: usize = 64;

/// Attempts at drawing a secret that does not collide with a stored one.
pub(crate) const ISSUE_ATTEMPTS: usize = 3;

#[async_trait]
pub trait ResetTokenStore: Send + Sync {
    /// Store a fresh random token valid until `now + ttl`.
    /// Unknown users yield [`crate::Error::UserNotFound`].
    async fn issue(&self, user_id: UserId, ttl: Duration) -> Result<PasswordResetToken>;

    /// Revoke the user's unused tokens and issue a new one as a single step,
    /// so concurrent calls leave exactly one live token. Returns the new
    /// token and how many were revoked.
    async fn reissue(&self, user_id: UserId, ttl: Duration) -> Result<(PasswordResetToken, u64)>;

    /// Spend a token, returning its owner. At most one caller ever succeeds
    /// for a given token; every other outcome is
    /// [`crate::Error::InvalidOrExpiredToken`].
    async fn consume(&self, token: &str) -> Result<UserId>;

    /// Look a token up without spending it.
    async fn find(&self, token: &str) -> Result<PasswordResetToken>;

    /// Drop every unused token of a user. Returns how many were removed.
    async fn revoke_outstanding(&self, user_id: UserId) -> Result<u64>;

    /// Delete tokens that expired before `older_than`.
    async fn purge_expired(&self, older_than: OffsetDateTime) -> Result<u64>;
}

/// Expiry for a token issued at `now`.
pub(crate) fn expiry(now: OffsetDateTime, ttl: Duration) -> Result<OffsetDateTime> {
    now.checked_add(ttl).ok_or(Error::InvalidTtl)
}

/// Postgres text cannot hold NUL, so no stored secret contains one.
pub(crate) fn storable(token: &str) -> bool {
    !token.contains('\0')
}

/// Draw a token secret from the OS RNG.
pub fn generate_token() -> String {
    Alphanumeric.sample_string(&mut OsRng, TOKEN_LENGTH)
}
