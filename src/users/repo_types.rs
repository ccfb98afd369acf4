use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;

pub type UserId = i64;

/// User record in the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: UserId,
    pub email: Option<String>, // normalised, unique when present
    pub is_admin: bool,
    pub is_active: bool,
    pub created_at: OffsetDateTime,
    pub last_login_at: Option<OffsetDateTime>,
}

/// Fields accepted when creating a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub email: Option<String>,
    pub is_admin: bool,
    pub is_active: bool,
}

impl Default for NewUser {
    fn default() -> Self {
        Self {
            email: None,
            is_admin: false,
            is_active: true,
        }
    }
}

impl NewUser {
    pub fn with_email(email: impl Into<String>) -> Self {
        Self {
            email: Some(email.into()),
            ..Default::default()
        }
    }

    pub fn admin(mut self, is_admin: bool) -> Self {
        self.is_admin = is_admin;
        self
    }

    pub fn active(mut self, is_active: bool) -> Self {
        self.is_active = is_active;
        self
    }
}

/// Filter for listing users, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserFilter {
    pub is_active: Option<bool>,
    pub is_admin: Option<bool>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for UserFilter {
    fn default() -> Self {
        Self {
            is_active: None,
            is_admin: None,
            limit: 50,
            offset: 0,
        }
    }
}

impl UserFilter {
    pub(crate) fn matches(&self, user: &User) -> bool {
        self.is_active.map_or(true, |a| user.is_active == a)
            && self.is_admin.map_or(true, |a| user.is_admin == a)
    }
}

/// Head counts for the admin dashboard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, FromRow)]
pub struct UserStats {
    pub total: i64,
    pub active: i64,
    pub suspended: i64,
    pub admins: i64,
}
