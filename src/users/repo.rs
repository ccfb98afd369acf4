use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, instrument};

use super::repo_types::{NewUser, User, UserFilter, UserId, UserStats};
use super::{normalize_email, prepare, UserStore};
use crate::clock::Clock;
use crate::db::bounded;
use crate::error::{Error, Result};

const USER_COLUMNS: &str = "id, email, is_admin, is_active, created_at, last_login_at";

/// Postgres-backed [`UserStore`].
#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl PgUserStore {
    pub fn new(db: PgPool, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self { db, clock, timeout }
    }

    async fn update_flag(&self, id: UserId, column: &str, value: bool) -> Result<User> {
        let sql = format!("UPDATE users SET {column} = $2 WHERE id = $1 RETURNING {USER_COLUMNS}");
        bounded(
            self.timeout,
            sqlx::query_as::<_, User>(&sql)
                .bind(id)
                .bind(value)
                .fetch_optional(&self.db),
        )
        .await?
        .ok_or(Error::NotFound)
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    #[instrument(skip(self, new), fields(admin = new.is_admin), err)]
    async fn create(&self, new: NewUser) -> Result<User> {
        let new = prepare(new)?;
        // The partial unique index on email arbitrates concurrent creates.
        let user = bounded(
            self.timeout,
            sqlx::query_as::<_, User>(&format!(
                "INSERT INTO users (email, is_admin, is_active, created_at) \
                 VALUES ($1, $2, $3, $4) RETURNING {USER_COLUMNS}"
            ))
            .bind(&new.email)
            .bind(new.is_admin)
            .bind(new.is_active)
            .bind(self.clock.now())
            .fetch_one(&self.db),
        )
        .await?;
        debug!(user_id = user.id, "user created");
        Ok(user)
    }

    #[instrument(skip(self), err)]
    async fn get(&self, id: UserId) -> Result<User> {
        bounded(
            self.timeout,
            sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.db),
        )
        .await?
        .ok_or(Error::NotFound)
    }

    #[instrument(skip(self, email), err)]
    async fn find_by_email(&self, email: &str) -> Result<User> {
        let email = normalize_email(email).map_err(|_| Error::NotFound)?;
        bounded(
            self.timeout,
            sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1"))
                .bind(&email)
                .fetch_optional(&self.db),
        )
        .await?
        .ok_or(Error::NotFound)
    }

    #[instrument(skip(self), err)]
    async fn record_login(&self, id: UserId) -> Result<User> {
        let updated = bounded(
            self.timeout,
            sqlx::query_as::<_, User>(&format!(
                "UPDATE users SET last_login_at = $2 WHERE id = $1 AND is_active \
                 RETURNING {USER_COLUMNS}"
            ))
            .bind(id)
            .bind(self.clock.now())
            .fetch_optional(&self.db),
        )
        .await?;

        if let Some(user) = updated {
            return Ok(user);
        }

        // Nothing matched: either the user is missing or suspended.
        let active = bounded(
            self.timeout,
            sqlx::query_scalar::<_, bool>("SELECT is_active FROM users WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.db),
        )
        .await?;
        match active {
            None => Err(Error::NotFound),
            Some(_) => Err(Error::InactiveAccount),
        }
    }

    #[instrument(skip(self), err)]
    async fn set_active(&self, id: UserId, active: bool) -> Result<User> {
        self.update_flag(id, "is_active", active).await
    }

    #[instrument(skip(self), err)]
    async fn set_admin(&self, id: UserId, admin: bool) -> Result<User> {
        self.update_flag(id, "is_admin", admin).await
    }

    #[instrument(skip(self), err)]
    async fn delete(&self, id: UserId) -> Result<()> {
        // ON DELETE SET NULL / CASCADE on the referencing tables do the rest.
        let res = bounded(
            self.timeout,
            sqlx::query("DELETE FROM users WHERE id = $1")
                .bind(id)
                .execute(&self.db),
        )
        .await?;
        if res.rows_affected() == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    #[instrument(skip(self, filter), fields(limit = filter.limit, offset = filter.offset), err)]
    async fn list(&self, filter: &UserFilter) -> Result<Vec<User>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {USER_COLUMNS} FROM users WHERE TRUE"));
        if let Some(active) = filter.is_active {
            qb.push(" AND is_active = ").push_bind(active);
        }
        if let Some(admin) = filter.is_admin {
            qb.push(" AND is_admin = ").push_bind(admin);
        }
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(filter.limit)
            .push(" OFFSET ")
            .push_bind(filter.offset);

        bounded(self.timeout, qb.build_query_as::<User>().fetch_all(&self.db)).await
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<UserStats> {
        bounded(
            self.timeout,
            sqlx::query_as::<_, UserStats>(
                r#"
                SELECT COUNT(*)                                   AS total,
                       COUNT(*) FILTER (WHERE is_active)          AS active,
                       COUNT(*) FILTER (WHERE NOT is_active)      AS suspended,
                       COUNT(*) FILTER (WHERE is_admin)           AS admins
                FROM users
                "#,
            )
            .fetch_one(&self.db),
        )
        .await
    }
}
