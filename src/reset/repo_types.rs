use serde::Serialize;
use sqlx::FromRow;
use time::OffsetDateTime;

use crate::users::UserId;

/// Password reset token row.
///
/// The secret is never serialised; it only leaves the store through the
/// value returned by `issue`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct PasswordResetToken {
    pub id: i64,
    pub user_id: UserId,
    #[serde(skip)]
    pub token: String,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub used: bool,
}

/// Lifecycle of a token. `Consumed` and `Expired` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenState {
    Active,
    Consumed,
    Expired,
}

impl PasswordResetToken {
    pub fn state(&self, now: OffsetDateTime) -> TokenState {
        if self.used {
            TokenState::Consumed
        } else if now < self.expires_at {
            TokenState::Active
        } else {
            TokenState::Expired
        }
    }

    pub fn is_consumable(&self, now: OffsetDateTime) -> bool {
        self.state(now) == TokenState::Active
    }
}
