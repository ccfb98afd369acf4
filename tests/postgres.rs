//! Postgres backend suites. They need a reachable `DATABASE_URL`:
//!
//! ```sh
//! DATABASE_URL=postgres://localhost/identity cargo test -- --ignored
//! ```

use std::sync::Arc;
use std::time::Duration as StdDuration;

use serde_json::json;
use sqlx::PgPool;
use time::Duration;

use identity_store::audit::{AuditFilter, AuditLog, NewAuditEntry, Pagination, PgAuditLog};
use identity_store::clock::{Clock, SystemClock};
use identity_store::db;
use identity_store::reset::{PgResetTokenStore, ResetTokenStore, TokenState};
use identity_store::users::{NewUser, PgUserStore, UserFilter, UserStats, UserStore};
use identity_store::Error;

const TIMEOUT: StdDuration = StdDuration::from_secs(5);

fn stores(pool: &PgPool) -> (PgUserStore, PgAuditLog, PgResetTokenStore) {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    (
        PgUserStore::new(pool.clone(), clock.clone(), TIMEOUT),
        PgAuditLog::new(pool.clone(), clock.clone(), TIMEOUT),
        PgResetTokenStore::new(pool.clone(), clock, TIMEOUT),
    )
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn schema_script_is_rerunnable(pool: PgPool) {
    db::apply_schema(&pool).await.unwrap();
    db::apply_schema(&pool).await.unwrap();

    let (users, _, _) = stores(&pool);
    users.create(NewUser::with_email("a@x.com")).await.unwrap();
    db::apply_schema(&pool).await.unwrap();
    assert!(users.find_by_email("a@x.com").await.is_ok());
}

#[sqlx::test(migrations = false)]
#[ignore]
async fn schema_upgrades_a_legacy_users_table(pool: PgPool) {
    sqlx::query("CREATE TABLE users (id BIGSERIAL PRIMARY KEY)")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO users DEFAULT VALUES")
        .execute(&pool)
        .await
        .unwrap();

    db::apply_schema(&pool).await.unwrap();

    let (users, _, _) = stores(&pool);
    let legacy = users.get(1).await.unwrap();
    assert_eq!(legacy.email, None);
    assert!(legacy.is_active);
    assert!(!legacy.is_admin);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn duplicate_email_conflicts(pool: PgPool) {
    let (users, _, _) = stores(&pool);
    users.create(NewUser::with_email("a@x.com")).await.unwrap();
    let err = users.create(NewUser::with_email("A@X.com")).await.unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }));

    users.create(NewUser::default()).await.unwrap();
    users.create(NewUser::default()).await.unwrap();
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn inactive_login_leaves_timestamp(pool: PgPool) {
    let (users, _, _) = stores(&pool);
    let user = users.create(NewUser::with_email("a@x.com")).await.unwrap();
    users.set_active(user.id, false).await.unwrap();

    assert!(matches!(users.record_login(user.id).await, Err(Error::InactiveAccount)));
    assert!(matches!(users.record_login(user.id + 1).await, Err(Error::NotFound)));
    assert_eq!(users.get(user.id).await.unwrap().last_login_at, None);

    users.set_active(user.id, true).await.unwrap();
    assert!(users.record_login(user.id).await.unwrap().last_login_at.is_some());
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn concurrent_consume_has_one_winner(pool: PgPool) {
    let (users, _, tokens) = stores(&pool);
    let user = users.create(NewUser::with_email("a@x.com")).await.unwrap();
    let token = tokens.issue(user.id, Duration::hours(1)).await.unwrap();

    let tokens = Arc::new(tokens);
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let tokens = tokens.clone();
            let secret = token.token.clone();
            tokio::spawn(async move { tokens.consume(&secret).await })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(owner) => {
                assert_eq!(owner, user.id);
                winners += 1;
            }
            Err(Error::InvalidOrExpiredToken) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(winners, 1);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn expired_and_orphan_tokens(pool: PgPool) {
    let (users, _, tokens) = stores(&pool);
    let user = users.create(NewUser::default()).await.unwrap();

    let stale = tokens.issue(user.id, Duration::seconds(-1)).await.unwrap();
    assert!(matches!(tokens.consume(&stale.token).await, Err(Error::InvalidOrExpiredToken)));

    let err = tokens.issue(user.id + 1000, Duration::hours(1)).await.unwrap_err();
    assert!(matches!(err, Error::UserNotFound));

    let purged = tokens
        .purge_expired(time::OffsetDateTime::now_utc())
        .await
        .unwrap();
    assert_eq!(purged, 1);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn delete_nulls_audit_and_cascades_tokens(pool: PgPool) {
    let (users, audit, tokens) = stores(&pool);
    let user = users.create(NewUser::with_email("a@x.com")).await.unwrap();
    let entry = audit
        .append(
            NewAuditEntry::new("login")
                .user(user.id)
                .ip(Some("10.0.0.1"))
                .metadata(json!({ "ua": "test" })),
        )
        .await
        .unwrap();
    let token = tokens.issue(user.id, Duration::hours(1)).await.unwrap();

    users.delete(user.id).await.unwrap();

    let page = audit
        .query(&AuditFilter::default(), &Pagination::default())
        .await
        .unwrap();
    assert_eq!(page.entries.len(), 1);
    assert_eq!(page.entries[0].id, entry.id);
    assert_eq!(page.entries[0].user_id, None);
    assert_eq!(page.entries[0].metadata, Some(json!({ "ua": "test" })));
    assert!(matches!(tokens.find(&token.token).await, Err(Error::NotFound)));
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn audit_query_filters_and_pages(pool: PgPool) {
    let (users, audit, _) = stores(&pool);
    let user = users.create(NewUser::default()).await.unwrap();
    for action in ["login", "LOGIN_blocked", "register", "100%_done"] {
        audit
            .append(NewAuditEntry::new(action).user(user.id))
            .await
            .unwrap();
    }

    let logins = audit
        .query(
            &AuditFilter {
                action: Some("login".into()),
                ..Default::default()
            },
            &Pagination::default(),
        )
        .await
        .unwrap();
    assert_eq!(logins.entries.len(), 2);

    let literal = audit
        .query(
            &AuditFilter {
                action: Some("%_".into()),
                ..Default::default()
            },
            &Pagination::default(),
        )
        .await
        .unwrap();
    assert_eq!(literal.entries.len(), 1);

    let first = audit
        .query(&AuditFilter::default(), &Pagination::first(3))
        .await
        .unwrap();
    assert_eq!(first.entries.len(), 3);
    let rest = audit
        .query(
            &AuditFilter::default(),
            &Pagination {
                after: first.next,
                limit: 3,
            },
        )
        .await
        .unwrap();
    assert_eq!(rest.entries.len(), 1);
    assert_eq!(rest.next, None);
    assert!(rest.entries[0].id < first.entries[2].id);

    assert_eq!(audit.actions().await.unwrap().len(), 4);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn list_filters_pages_and_counts(pool: PgPool) {
    let (users, _, _) = stores(&pool);
    let admin = users.create(NewUser::with_email("root@x.com").admin(true)).await.unwrap();
    let suspended = users.create(NewUser::with_email("b@x.com").active(false)).await.unwrap();
    let plain = users.create(NewUser::default()).await.unwrap();

    let all = users.list(&UserFilter::default()).await.unwrap();
    let ids: Vec<_> = all.iter().map(|u| u.id).collect();
    assert_eq!(ids, [plain.id, suspended.id, admin.id]);

    let inactive = users
        .list(&UserFilter {
            is_active: Some(false),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(inactive, vec![suspended.clone()]);

    let admins = users
        .list(&UserFilter {
            is_admin: Some(true),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(admins.len(), 1);
    assert_eq!(admins[0].id, admin.id);

    let second = users
        .list(&UserFilter {
            limit: 1,
            offset: 1,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].id, suspended.id);

    assert_eq!(
        users.stats().await.unwrap(),
        UserStats {
            total: 3,
            active: 2,
            suspended: 1,
            admins: 1,
        }
    );
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn find_revoke_and_reissue(pool: PgPool) {
    let (users, _, tokens) = stores(&pool);
    let user = users.create(NewUser::default()).await.unwrap();

    let spent = tokens.issue(user.id, Duration::hours(1)).await.unwrap();
    tokens.consume(&spent.token).await.unwrap();
    let open = tokens.issue(user.id, Duration::hours(1)).await.unwrap();

    let peeked = tokens.find(&open.token).await.unwrap();
    assert_eq!(peeked.id, open.id);
    assert_eq!(peeked.state(time::OffsetDateTime::now_utc()), TokenState::Active);
    assert!(tokens.find(&spent.token).await.unwrap().used);
    assert!(matches!(tokens.find("missing").await, Err(Error::NotFound)));

    let (fresh, revoked) = tokens.reissue(user.id, Duration::hours(1)).await.unwrap();
    assert_eq!(revoked, 1);
    assert!(matches!(tokens.find(&open.token).await, Err(Error::NotFound)));

    assert_eq!(tokens.revoke_outstanding(user.id).await.unwrap(), 1);
    assert!(matches!(tokens.find(&fresh.token).await, Err(Error::NotFound)));
    assert!(tokens.find(&spent.token).await.is_ok());

    let err = tokens.reissue(user.id + 1000, Duration::hours(1)).await.unwrap_err();
    assert!(matches!(err, Error::UserNotFound));
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn concurrent_reissues_leave_one_live_token(pool: PgPool) {
    let (users, _, tokens) = stores(&pool);
    let user = users.create(NewUser::default()).await.unwrap();
    let user_id = user.id;

    let tokens = Arc::new(tokens);
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let tokens = tokens.clone();
            tokio::spawn(async move { tokens.reissue(user_id, Duration::hours(1)).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let live: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM password_reset_tokens WHERE user_id = $1 AND used = FALSE",
    )
    .bind(user.id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(live, 1);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn out_of_range_ttl_is_rejected_before_writing(pool: PgPool) {
    let (users, _, tokens) = stores(&pool);
    let user = users.create(NewUser::default()).await.unwrap();
    let kept = tokens.issue(user.id, Duration::hours(1)).await.unwrap();

    assert!(matches!(tokens.issue(user.id, Duration::MAX).await, Err(Error::InvalidTtl)));
    assert!(matches!(tokens.reissue(user.id, Duration::MAX).await, Err(Error::InvalidTtl)));
    assert!(tokens.find(&kept.token).await.is_ok());
}

#[sqlx::test(migrations = "./migrations")]
#[ignore]
async fn nul_bytes_map_to_domain_errors(pool: PgPool) {
    let (users, audit, tokens) = stores(&pool);

    assert!(matches!(tokens.consume("abc\0").await, Err(Error::InvalidOrExpiredToken)));
    assert!(matches!(tokens.find("abc\0").await, Err(Error::NotFound)));
    assert!(matches!(users.find_by_email("a\0@x.com").await, Err(Error::NotFound)));
    assert!(matches!(
        users.create(NewUser::with_email("a\0@x.com")).await,
        Err(Error::InvalidEmail)
    ));

    let page = audit
        .query(
            &AuditFilter {
                action: Some("log\0in".into()),
                ..Default::default()
            },
            &Pagination::default(),
        )
        .await
        .unwrap();
    assert!(page.entries.is_empty());
}
