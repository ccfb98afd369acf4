//! User Store: identity rows, email uniqueness and activation state.

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{Error, Result};

pub mod repo;
pub mod repo_types;

pub use repo::PgUserStore;
pub use repo_types::{NewUser, User, UserFilter, UserId, UserStats};

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Insert a user with `created_at = now`. A taken email yields [`Error::Conflict`].
    async fn create(&self, new: NewUser) -> Result<User>;

    async fn get(&self, id: UserId) -> Result<User>;

    async fn find_by_email(&self, email: &str) -> Result<User>;

    /// Stamp `last_login_at`. Inactive accounts are left untouched and
    /// reported as [`Error::InactiveAccount`].
    async fn record_login(&self, id: UserId) -> Result<User>;

    async fn set_active(&self, id: UserId, active: bool) -> Result<User>;

    async fn set_admin(&self, id: UserId, admin: bool) -> Result<User>;

    /// Remove a user. Audit entries keep their row with `user_id` cleared;
    /// reset tokens go with the user.
    async fn delete(&self, id: UserId) -> Result<()>;

    async fn list(&self, filter: &UserFilter) -> Result<Vec<User>>;

    async fn stats(&self) -> Result<UserStats>;
}

/// Trim and lower-case an email, rejecting anything that does not look like one.
pub fn normalize_email(raw: &str) -> Result<String> {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    let email = raw.trim().to_lowercase();
    if email.len() > 255 || email.contains('\0') || !EMAIL_RE.is_match(&email) {
        return Err(Error::InvalidEmail);
    }
    Ok(email)
}

/// Normalise the optional email of a new user.
pub(crate) fn prepare(mut new: NewUser) -> Result<NewUser> {
    new.email = new.email.as_deref().map(normalize_email).transpose()?;
    Ok(new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emails_are_trimmed_and_lowercased() {
        assert_eq!(normalize_email("  A@X.com ").unwrap(), "a@x.com");
    }

    #[test]
    fn malformed_emails_are_rejected() {
        for raw in ["", "plain", "a@b", "a b@x.com", "@x.com", "a\0b@x.com"] {
            assert!(matches!(normalize_email(raw), Err(Error::InvalidEmail)), "{raw}");
        }
    }

    #[test]
    fn prepare_keeps_missing_email() {
        let new = prepare(NewUser::default().admin(true)).unwrap();
        assert_eq!(new.email, None);
        assert!(new.is_admin);
        assert!(new.is_active);
    }
}
