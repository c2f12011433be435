//! Token store: issued-token registry, blacklist, revocation boundaries,
//! sessions and the audit trail.
//!
//! The blacklist lives in the primary Postgres store so a completed
//! revocation is visible to every subsequent validation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use uuid::Uuid;

use crate::models::{
    AuditEvent, BlacklistFilter, BlacklistStats, BlacklistedToken, IssuedToken, Page, PageRequest,
    Session,
};
use crate::services::error::StoreError;

#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Fails with `AlreadyExists` if the JTI was ever issued before.
    async fn record_issued_token(&self, token: &IssuedToken) -> Result<(), StoreError>;
    async fn find_issued_token(&self, jti: &str) -> Result<Option<IssuedToken>, StoreError>;

    /// Write-once insert. Returns `false` when an entry for the JTI exists;
    /// the existing entry is left untouched.
    async fn insert_blacklist_entry(&self, entry: &BlacklistedToken) -> Result<bool, StoreError>;
    async fn find_blacklist_entry(&self, jti: &str)
        -> Result<Option<BlacklistedToken>, StoreError>;
    async fn is_blacklisted(&self, jti: &str) -> Result<bool, StoreError>;
    /// Sorted by `revoked_at` descending.
    async fn list_blacklist(
        &self,
        filter: &BlacklistFilter,
        page: PageRequest,
    ) -> Result<Page<BlacklistedToken>, StoreError>;
    async fn count_blacklisted(&self) -> Result<i64, StoreError>;
    async fn blacklist_stats(
        &self,
        now: DateTime<Utc>,
        day_start: DateTime<Utc>,
    ) -> Result<BlacklistStats, StoreError>;

    /// Moves the user's boundary forward to `at` (never backwards) and
    /// returns the effective boundary.
    async fn advance_boundary(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
        reason: &str,
    ) -> Result<DateTime<Utc>, StoreError>;
    async fn get_boundary(&self, user_id: &str) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn create_session(&self, session: &Session) -> Result<(), StoreError>;
    async fn get_session(&self, session_id: Uuid) -> Result<Option<Session>, StoreError>;
    /// Compare-and-swap of the session's current refresh JTI. Returns `false`
    /// when the session is revoked or `expected_jti` is no longer current.
    async fn rotate_session_refresh(
        &self,
        session_id: Uuid,
        expected_jti: &str,
        new_jti: &str,
    ) -> Result<bool, StoreError>;
    /// Returns the session if this call closed it.
    async fn revoke_session(
        &self,
        session_id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Session>, StoreError>;
    /// Closes every open session of the user and returns them.
    async fn revoke_user_sessions(
        &self,
        user_id: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<Session>, StoreError>;

    /// Deletes rows whose natural expiry has passed.
    async fn prune_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn record_audit_event(&self, event: &AuditEvent) -> Result<(), StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

/// PostgreSQL-backed token store.
#[derive(Clone)]
pub struct PgTokenStore {
    pool: PgPool,
}

impl PgTokenStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const BLACKLIST_COLUMNS: &str = "jti, user_id, revoked_by, reason, revoked_at, expires_at";
const SESSION_COLUMNS: &str =
    "session_id, user_id, current_refresh_jti, created_at, expires_at, revoked_at, revoked_reason";

#[async_trait]
impl TokenStore for PgTokenStore {
    async fn record_issued_token(&self, token: &IssuedToken) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO issued_tokens (jti, user_id, session_id, token_type, issued_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&token.jti)
        .bind(&token.user_id)
        .bind(token.session_id)
        .bind(token.token_type.as_str())
        .bind(token.issued_at)
        .bind(token.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_issued_token(&self, jti: &str) -> Result<Option<IssuedToken>, StoreError> {
        let token = sqlx::query_as::<_, IssuedToken>(
            "SELECT jti, user_id, session_id, token_type, issued_at, expires_at \
             FROM issued_tokens WHERE jti = $1",
        )
        .bind(jti)
        .fetch_optional(&self.pool)
        .await?;
        Ok(token)
    }

    async fn insert_blacklist_entry(&self, entry: &BlacklistedToken) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO blacklisted_tokens (jti, user_id, revoked_by, reason, revoked_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (jti) DO NOTHING
            "#,
        )
        .bind(&entry.jti)
        .bind(&entry.user_id)
        .bind(&entry.revoked_by)
        .bind(entry.reason.as_str())
        .bind(entry.revoked_at)
        .bind(entry.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_blacklist_entry(
        &self,
        jti: &str,
    ) -> Result<Option<BlacklistedToken>, StoreError> {
        let entry = sqlx::query_as::<_, BlacklistedToken>(&format!(
            "SELECT {} FROM blacklisted_tokens WHERE jti = $1",
            BLACKLIST_COLUMNS
        ))
        .bind(jti)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    async fn is_blacklisted(&self, jti: &str) -> Result<bool, StoreError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM blacklisted_tokens WHERE jti = $1)")
                .bind(jti)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn list_blacklist(
        &self,
        filter: &BlacklistFilter,
        page: PageRequest,
    ) -> Result<Page<BlacklistedToken>, StoreError> {
        let reason = filter.reason.as_ref().map(|r| r.as_str().to_string());

        let items = sqlx::query_as::<_, BlacklistedToken>(&format!(
            r#"
            SELECT {} FROM blacklisted_tokens
            WHERE ($1::text IS NULL OR user_id = $1)
              AND ($2::text IS NULL OR reason = $2)
            ORDER BY revoked_at DESC, jti
            LIMIT $3 OFFSET $4
            "#,
            BLACKLIST_COLUMNS
        ))
        .bind(&filter.user_id)
        .bind(&reason)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM blacklisted_tokens
            WHERE ($1::text IS NULL OR user_id = $1)
              AND ($2::text IS NULL OR reason = $2)
            "#,
        )
        .bind(&filter.user_id)
        .bind(&reason)
        .fetch_one(&self.pool)
        .await?;

        Ok(Page {
            items,
            total,
            limit: page.limit,
            offset: page.offset,
        })
    }

    async fn count_blacklisted(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM blacklisted_tokens")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn blacklist_stats(
        &self,
        now: DateTime<Utc>,
        day_start: DateTime<Utc>,
    ) -> Result<BlacklistStats, StoreError> {
        let (total, active, revoked_today): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COUNT(*) FILTER (WHERE expires_at > $1),
                   COUNT(*) FILTER (WHERE revoked_at >= $2)
            FROM blacklisted_tokens
            "#,
        )
        .bind(now)
        .bind(day_start)
        .fetch_one(&self.pool)
        .await?;

        let by_reason: Vec<(String, i64)> = sqlx::query_as(
            "SELECT reason, COUNT(*) FROM blacklisted_tokens GROUP BY reason",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(BlacklistStats {
            total_blacklisted: total,
            active,
            revoked_today,
            by_reason: by_reason.into_iter().collect(),
        })
    }

    async fn advance_boundary(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
        reason: &str,
    ) -> Result<DateTime<Utc>, StoreError> {
        let effective: DateTime<Utc> = sqlx::query_scalar(
            r#"
            INSERT INTO user_token_boundaries (user_id, tokens_valid_since, reason, updated_at)
            VALUES ($1, $2, $3, $2)
            ON CONFLICT (user_id) DO UPDATE
            SET tokens_valid_since = GREATEST(user_token_boundaries.tokens_valid_since,
                                              EXCLUDED.tokens_valid_since),
                reason = EXCLUDED.reason,
                updated_at = EXCLUDED.updated_at
            RETURNING tokens_valid_since
            "#,
        )
        .bind(user_id)
        .bind(at)
        .bind(reason)
        .fetch_one(&self.pool)
        .await?;
        Ok(effective)
    }

    async fn get_boundary(&self, user_id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let boundary: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT tokens_valid_since FROM user_token_boundaries WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(boundary)
    }

    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, user_id, current_refresh_jti, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(session.session_id)
        .bind(&session.user_id)
        .bind(&session.current_refresh_jti)
        .bind(session.created_at)
        .bind(session.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, session_id: Uuid) -> Result<Option<Session>, StoreError> {
        let session = sqlx::query_as::<_, Session>(&format!(
            "SELECT {} FROM sessions WHERE session_id = $1",
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    async fn rotate_session_refresh(
        &self,
        session_id: Uuid,
        expected_jti: &str,
        new_jti: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sessions SET current_refresh_jti = $3
            WHERE session_id = $1 AND current_refresh_jti = $2 AND revoked_at IS NULL
            "#,
        )
        .bind(session_id)
        .bind(expected_jti)
        .bind(new_jti)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn revoke_session(
        &self,
        session_id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Session>, StoreError> {
        let session = sqlx::query_as::<_, Session>(&format!(
            r#"
            UPDATE sessions SET revoked_at = $2, revoked_reason = $3
            WHERE session_id = $1 AND revoked_at IS NULL
            RETURNING {}
            "#,
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .bind(at)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    async fn revoke_user_sessions(
        &self,
        user_id: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<Session>, StoreError> {
        let sessions = sqlx::query_as::<_, Session>(&format!(
            r#"
            UPDATE sessions SET revoked_at = $2, revoked_reason = $3
            WHERE user_id = $1 AND revoked_at IS NULL
            RETURNING {}
            "#,
            SESSION_COLUMNS
        ))
        .bind(user_id)
        .bind(at)
        .bind(reason)
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }

    async fn prune_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let blacklist = sqlx::query("DELETE FROM blacklisted_tokens WHERE expires_at < $1")
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let issued = sqlx::query("DELETE FROM issued_tokens WHERE expires_at < $1")
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let sessions = sqlx::query("DELETE FROM sessions WHERE expires_at < $1")
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(blacklist + issued + sessions)
    }

    async fn record_audit_event(&self, event: &AuditEvent) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO audit_events
                (event_id, event_type, actor_user_id, target_user_id, target_jti, details, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event.event_id)
        .bind(&event.event_type)
        .bind(&event.actor_user_id)
        .bind(&event.target_user_id)
        .bind(&event.target_jti)
        .bind(&event.details)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
