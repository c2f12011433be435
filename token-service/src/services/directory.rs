//! User directory: the account records the token core reads to resolve
//! identity and auth method.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{NewOAuthUser, Role, UserAccount};
use crate::services::error::{ServiceError, StoreError};

#[derive(Error, Debug)]
pub enum CreateUserError {
    #[error("an account with this email already exists")]
    EmailTaken,

    #[error("invitation is invalid or has expired")]
    InvitationInvalid,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<CreateUserError> for ServiceError {
    fn from(err: CreateUserError) -> Self {
        match err {
            CreateUserError::EmailTaken => {
                ServiceError::Conflict("An account with this email already exists".into())
            }
            CreateUserError::InvitationInvalid => ServiceError::InvitationInvalid,
            CreateUserError::Store(e) => e.into(),
        }
    }
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_user(&self, id: &str) -> Result<Option<UserAccount>, StoreError>;
    /// `email` must already be normalized.
    async fn get_user_by_email(&self, email: &str) -> Result<Option<UserAccount>, StoreError>;
    /// Creates an `oauth` account, consuming the invitation (if any) in the
    /// same transaction.
    async fn create_oauth_user(&self, user: NewOAuthUser) -> Result<UserAccount, CreateUserError>;
    async fn update_password_hash(&self, user_id: &str, hash: &str) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct PgUserDirectory {
    pool: PgPool,
}

impl PgUserDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const USER_COLUMNS: &str = "id, email, first_name, last_name, role, auth_method, password_hash, \
                            oauth_provider, oauth_provider_id, created_at";

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn get_user(&self, id: &str) -> Result<Option<UserAccount>, StoreError> {
        let user = sqlx::query_as::<_, UserAccount>(&format!(
            "SELECT {} FROM users WHERE id = $1",
            USER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<UserAccount>, StoreError> {
        let user = sqlx::query_as::<_, UserAccount>(&format!(
            "SELECT {} FROM users WHERE lower(email) = $1",
            USER_COLUMNS
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn create_oauth_user(&self, user: NewOAuthUser) -> Result<UserAccount, CreateUserError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;

        let role = match &user.invitation_token {
            Some(token) => {
                let role: Option<String> = sqlx::query_scalar(
                    r#"
                    UPDATE invitations SET consumed_at = now()
                    WHERE token = $1
                      AND consumed_at IS NULL
                      AND expires_at > now()
                      AND (email IS NULL OR lower(email) = $2)
                    RETURNING role
                    "#,
                )
                .bind(token)
                .bind(&user.email)
                .fetch_optional(&mut *tx)
                .await
                .map_err(StoreError::from)?;

                let role = role.ok_or(CreateUserError::InvitationInvalid)?;
                role.parse::<Role>()
                    .map_err(|e| StoreError::Backend(anyhow::anyhow!(e)))?
            }
            None => Role::Member,
        };

        let account = sqlx::query_as::<_, UserAccount>(&format!(
            r#"
            INSERT INTO users
                (id, email, first_name, last_name, role, auth_method, oauth_provider,
                 oauth_provider_id, created_at)
            VALUES ($1, $2, $3, $4, $5, 'oauth', $6, $7, $8)
            RETURNING {}
            "#,
            USER_COLUMNS
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(&user.email)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(role.as_str())
        .bind(&user.provider)
        .bind(&user.provider_id)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match StoreError::from(e) {
            StoreError::AlreadyExists => CreateUserError::EmailTaken,
            other => CreateUserError::Store(other),
        })?;

        tx.commit().await.map_err(StoreError::from)?;
        Ok(account)
    }

    async fn update_password_hash(&self, user_id: &str, hash: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE users SET password_hash = $2 WHERE id = $1 AND auth_method = 'password'",
        )
        .bind(user_id)
        .bind(hash)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}
