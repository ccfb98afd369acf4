//! Error type shared by every store and the identity service.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced to callers of the stores.
#[derive(Debug, Error)]
pub enum Error {
    /// Unique constraint violation (duplicate email, colliding token secret).
    #[error("unique constraint violation")]
    Conflict { constraint: Option<String> },

    #[error("record not found")]
    NotFound,

    /// Login attempted on a suspended account.
    #[error("account is inactive")]
    InactiveAccount,

    /// A reference points at a user that does not exist.
    #[error("user not found")]
    UserNotFound,

    #[error("reset token is invalid or expired")]
    InvalidOrExpiredToken,

    #[error("invalid email address")]
    InvalidEmail,

    /// `now + ttl` does not fit in a timestamp.
    #[error("reset token ttl is out of range")]
    InvalidTtl,

    #[error("forbidden: {0}")]
    Forbidden(&'static str),

    /// Fatal storage failure. Callers may retry with backoff; nothing here does.
    #[error("storage unavailable")]
    StorageUnavailable(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Storage call that did not finish within its deadline.
    pub fn timed_out(limit: Duration) -> Self {
        Error::StorageUnavailable(anyhow::anyhow!("storage call exceeded {limit:?}"))
    }

    /// Whether the error is a transient/fatal storage failure rather than a domain outcome.
    pub fn is_storage(&self) -> bool {
        matches!(self, Error::StorageUnavailable(_))
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Error::NotFound,
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => Error::Conflict {
                constraint: db_err.constraint().map(str::to_owned),
            },
            // The only foreign keys in the schema point at users.
            sqlx::Error::Database(ref db_err) if db_err.is_foreign_key_violation() => {
                Error::UserNotFound
            }
            other => Error::StorageUnavailable(anyhow::Error::from(other)),
        }
    }
}
