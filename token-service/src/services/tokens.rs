//! Token issuance and validation.
//!
//! A token moves `Issued -> Valid -> {Expired, Revoked}` and never comes
//! back. Validation checks the signature, then expiry, then type, then the
//! blacklist, the owner's revocation boundary and the session, all under one
//! deadline. Any doubt in the last step rejects the token.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::{
    normalize_email, AuditEvent, AuditEventType, AuthMethod, IssuedToken, RevocationReason, Role,
    Session, TokenType, UserAccount,
};
use crate::services::audit::AuditService;
use crate::services::blacklist::BlacklistEngine;
use crate::services::directory::UserDirectory;
use crate::services::error::{ServiceError, StoreError};
use crate::services::jwt::{Claims, JwtService, TokenError};
use crate::services::metrics::Metrics;
use crate::services::store::TokenStore;
use crate::utils::{hash_password, verify_password, Password};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    #[schema(example = "Bearer")]
    pub token_type: String,
    /// Access token lifetime in seconds
    #[schema(example = 900)]
    pub expires_in: i64,
    pub session_id: Uuid,
}

/// Identity established by a valid access token.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AuthContext {
    pub user_id: String,
    pub session_id: Uuid,
    pub jti: String,
    pub role: Role,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<&Claims> for AuthContext {
    fn from(claims: &Claims) -> Self {
        Self {
            user_id: claims.sub.clone(),
            session_id: claims.sid,
            jti: claims.jti.clone(),
            role: claims.role,
            issued_at: claims.issued_at(),
            expires_at: claims.expires_at(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct Introspection {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<TokenType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

impl Introspection {
    fn inactive() -> Self {
        Self {
            active: false,
            sub: None,
            token_type: None,
            exp: None,
        }
    }
}

#[derive(Clone)]
pub struct TokenService {
    jwt: JwtService,
    store: Arc<dyn TokenStore>,
    users: Arc<dyn UserDirectory>,
    blacklist: BlacklistEngine,
    audit: AuditService,
    metrics: Metrics,
    validation_timeout: Duration,
}

impl TokenService {
    pub fn new(
        jwt: JwtService,
        store: Arc<dyn TokenStore>,
        users: Arc<dyn UserDirectory>,
        blacklist: BlacklistEngine,
        audit: AuditService,
        metrics: Metrics,
        validation_timeout: Duration,
    ) -> Self {
        Self {
            jwt,
            store,
            users,
            blacklist,
            audit,
            metrics,
            validation_timeout,
        }
    }

    /// Opens a new session for `user` and returns its first token pair.
    #[tracing::instrument(skip(self, user), fields(user_id = %user.id))]
    pub async fn issue_session_tokens(&self, user: &UserAccount) -> Result<TokenPair, ServiceError> {
        self.issue_session_tokens_at(user, Utc::now()).await
    }

    async fn issue_session_tokens_at(
        &self,
        user: &UserAccount,
        now: DateTime<Utc>,
    ) -> Result<TokenPair, ServiceError> {
        let session_id = Uuid::new_v4();

        let (pair, refresh) = self.mint_pair(user, session_id, now).await?;

        let expires_at = refresh.expires_at();
        let session = Session::new(session_id, user.id.clone(), refresh.jti, now, expires_at);
        self.store.create_session(&session).await?;

        tracing::info!(%session_id, "Session opened");
        Ok(pair)
    }

    pub async fn generate_tokens_for_user(&self, user_id: &str) -> Result<TokenPair, ServiceError> {
        let user = self
            .users
            .get_user(user_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound("User not found".into()))?;
        self.issue_session_tokens(&user).await
    }

    /// Mints and registers an access and a refresh token for `session_id`.
    /// Returns the pair and the refresh claims.
    async fn mint_pair(
        &self,
        user: &UserAccount,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(TokenPair, Claims), ServiceError> {
        let (access_token, access) =
            self.jwt
                .mint(&user.id, user.role, session_id, TokenType::Access, now)?;
        let (refresh_token, refresh) =
            self.jwt
                .mint(&user.id, user.role, session_id, TokenType::Refresh, now)?;

        for claims in [&access, &refresh] {
            self.register(claims).await?;
        }

        Ok((
            TokenPair {
                access_token,
                refresh_token,
                token_type: "Bearer".to_string(),
                expires_in: self.jwt.access_token_expiry_seconds(),
                session_id,
            },
            refresh,
        ))
    }

    async fn register(&self, claims: &Claims) -> Result<(), ServiceError> {
        let record = IssuedToken {
            jti: claims.jti.clone(),
            user_id: claims.sub.clone(),
            session_id: claims.sid,
            token_type: claims.typ,
            issued_at: claims.issued_at(),
            expires_at: claims.expires_at(),
        };

        match self.store.record_issued_token(&record).await {
            Ok(()) => {
                self.metrics.token_issued(claims.typ.as_str());
                Ok(())
            }
            Err(StoreError::AlreadyExists) => {
                tracing::error!(jti = %claims.jti, "JTI collision on issuance, aborting");
                Err(ServiceError::JtiCollision)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Validates a bearer access token.
    ///
    /// Store failures and the deadline both reject the token; they are never
    /// surfaced as server errors.
    pub async fn validate_auth_token(&self, token: &str) -> Result<AuthContext, ServiceError> {
        let claims = match self.jwt.decode(token) {
            Ok(claims) => claims,
            Err(TokenError::Expired) => {
                self.metrics.validation("expired");
                return Err(ServiceError::TokenExpired);
            }
            Err(TokenError::Invalid) => {
                self.metrics.validation("invalid");
                return Err(ServiceError::InvalidToken);
            }
        };

        if claims.typ != TokenType::Access {
            self.metrics.validation("invalid");
            return Err(ServiceError::InvalidToken);
        }

        match self.check_not_revoked(&claims).await {
            Ok(()) => {
                self.metrics.validation("valid");
                Ok(AuthContext::from(&claims))
            }
            Err(e) => {
                let outcome = match e {
                    ServiceError::TokenRevoked => "revoked",
                    _ => "unavailable",
                };
                self.metrics.validation(outcome);
                Err(e)
            }
        }
    }

    /// Blacklist, boundary and session checks under the validation deadline.
    /// Anything other than a clean pass is `TokenRevoked` or `InvalidToken`.
    async fn check_not_revoked(&self, claims: &Claims) -> Result<(), ServiceError> {
        match tokio::time::timeout(self.validation_timeout, self.revocation_checks(claims)).await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(ServiceError::TokenRevoked)) => Err(ServiceError::TokenRevoked),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, jti = %claims.jti, "Revocation check failed, rejecting token");
                Err(ServiceError::InvalidToken)
            }
            Err(_) => {
                tracing::warn!(
                    jti = %claims.jti,
                    timeout_ms = self.validation_timeout.as_millis() as u64,
                    "Revocation check timed out, rejecting token"
                );
                Err(ServiceError::InvalidToken)
            }
        }
    }

    async fn revocation_checks(&self, claims: &Claims) -> Result<(), ServiceError> {
        let (revoked, boundary, session) = tokio::try_join!(
            self.blacklist.is_token_revoked(&claims.jti),
            self.blacklist.user_tokens_valid_since(&claims.sub),
            async {
                self.store
                    .get_session(claims.sid)
                    .await
                    .map_err(ServiceError::from)
            },
        )?;

        if revoked {
            return Err(ServiceError::TokenRevoked);
        }

        if issued_before(&claims, boundary) {
            return Err(ServiceError::TokenRevoked);
        }

        match session {
            Some(session) if session.user_id == claims.sub && session.is_open(Utc::now()) => Ok(()),
            _ => Err(ServiceError::TokenRevoked),
        }
    }

    /// Exchanges a refresh token for a new pair on the same session.
    ///
    /// Only the session's current refresh JTI is accepted, and it is swapped
    /// out atomically. A superseded refresh token means the chain leaked:
    /// the whole session is revoked.
    #[tracing::instrument(skip_all)]
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<TokenPair, ServiceError> {
        let claims = self.jwt.decode(refresh_token).map_err(|e| match e {
            TokenError::Expired => ServiceError::TokenExpired,
            TokenError::Invalid => ServiceError::InvalidToken,
        })?;
        if claims.typ != TokenType::Refresh {
            return Err(ServiceError::InvalidToken);
        }

        let lookup = async {
            tokio::try_join!(
                self.blacklist.revocation_entry(&claims.jti),
                self.blacklist.user_tokens_valid_since(&claims.sub),
                async {
                    self.store
                        .get_session(claims.sid)
                        .await
                        .map_err(ServiceError::from)
                },
            )
        };
        let (entry, boundary, session) =
            match tokio::time::timeout(self.validation_timeout, lookup).await {
                Ok(Ok(found)) => found,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Refresh lookup failed, rejecting token");
                    return Err(ServiceError::InvalidToken);
                }
                Err(_) => {
                    tracing::warn!("Refresh lookup timed out, rejecting token");
                    return Err(ServiceError::InvalidToken);
                }
            };

        if let Some(entry) = entry {
            if entry.reason == RevocationReason::TokenRotation {
                self.handle_refresh_reuse(&claims).await;
            }
            return Err(ServiceError::TokenRevoked);
        }

        if issued_before(&claims, boundary) {
            return Err(ServiceError::TokenRevoked);
        }

        let now = Utc::now();
        let session = session.ok_or(ServiceError::InvalidToken)?;
        if session.user_id != claims.sub || !session.is_open(now) {
            return Err(ServiceError::TokenRevoked);
        }
        if session.current_refresh_jti != claims.jti {
            self.handle_refresh_reuse(&claims).await;
            return Err(ServiceError::TokenRevoked);
        }

        let user = self
            .users
            .get_user(&claims.sub)
            .await?
            .ok_or(ServiceError::InvalidToken)?;

        let (pair, next_refresh) = self.mint_pair(&user, session.session_id, now).await?;

        let rotated = self
            .store
            .rotate_session_refresh(session.session_id, &claims.jti, &next_refresh.jti)
            .await?;
        if !rotated {
            // Another exchange of the same token won the swap.
            self.handle_refresh_reuse(&claims).await;
            return Err(ServiceError::TokenRevoked);
        }

        match self
            .blacklist
            .revoke_token(&claims.jti, &claims.sub, RevocationReason::TokenRotation)
            .await
        {
            Ok(_) | Err(ServiceError::AlreadyRevoked) => {}
            Err(e) => {
                // The session no longer points at the old JTI, so a replay is
                // still caught as reuse.
                tracing::warn!(error = %e, jti = %claims.jti, "Failed to blacklist rotated refresh token");
            }
        }

        self.audit
            .record(
                AuditEvent::new(AuditEventType::TokenRefreshed)
                    .actor(claims.sub.clone())
                    .target_user(Some(claims.sub.clone()))
                    .target_jti(claims.jti.clone())
                    .details(serde_json::json!({
                        "session_id": session.session_id,
                        "new_refresh_jti": next_refresh.jti,
                    })),
            )
            .await;

        tracing::info!(session_id = %session.session_id, "Refresh token rotated");
        Ok(pair)
    }

    async fn handle_refresh_reuse(&self, claims: &Claims) {
        self.metrics.refresh_reuse_detected();
        tracing::warn!(
            user_id = %claims.sub,
            session_id = %claims.sid,
            jti = %claims.jti,
            "Refresh token reuse detected, revoking session"
        );

        if let Err(e) = self
            .close_session(claims.sid, RevocationReason::RefreshReuse, &claims.sub)
            .await
        {
            tracing::error!(error = %e, session_id = %claims.sid, "Failed to revoke session after refresh reuse");
        }

        self.audit
            .record(
                AuditEvent::new(AuditEventType::RefreshReuseDetected)
                    .actor(claims.sub.clone())
                    .target_user(Some(claims.sub.clone()))
                    .target_jti(claims.jti.clone())
                    .details(serde_json::json!({ "session_id": claims.sid })),
            )
            .await;
    }

    /// Closes the session and blacklists the refresh JTI it was holding.
    pub(crate) async fn close_session(
        &self,
        session_id: Uuid,
        reason: RevocationReason,
        actor: &str,
    ) -> Result<(), ServiceError> {
        let closed = self
            .store
            .revoke_session(session_id, reason.as_str(), Utc::now())
            .await?;

        let Some(session) = closed else {
            return Ok(());
        };

        match self
            .blacklist
            .revoke_token(&session.current_refresh_jti, actor, reason.clone())
            .await
        {
            Ok(_) | Err(ServiceError::AlreadyRevoked) => {}
            Err(e) => return Err(e),
        }

        self.audit
            .record(
                AuditEvent::new(AuditEventType::SessionRevoked)
                    .actor(actor)
                    .target_user(Some(session.user_id.clone()))
                    .target_jti(session.current_refresh_jti.clone())
                    .details(serde_json::json!({
                        "session_id": session_id,
                        "reason": reason.as_str(),
                    })),
            )
            .await;
        Ok(())
    }

    /// Ends the caller's session: the presented access token and the
    /// session's refresh token are both blacklisted.
    #[tracing::instrument(skip(self, ctx), fields(user_id = %ctx.user_id, session_id = %ctx.session_id))]
    pub async fn logout(&self, ctx: &AuthContext) -> Result<(), ServiceError> {
        match self
            .blacklist
            .revoke_token(&ctx.jti, &ctx.user_id, RevocationReason::Logout)
            .await
        {
            Ok(_) | Err(ServiceError::AlreadyRevoked) => {}
            Err(e) => return Err(e),
        }

        self.close_session(ctx.session_id, RevocationReason::Logout, &ctx.user_id)
            .await?;

        self.audit
            .record(
                AuditEvent::new(AuditEventType::UserLogout)
                    .actor(ctx.user_id.clone())
                    .target_user(Some(ctx.user_id.clone()))
                    .target_jti(ctx.jti.clone()),
            )
            .await;
        Ok(())
    }

    pub async fn logout_all(&self, ctx: &AuthContext) -> Result<DateTime<Utc>, ServiceError> {
        self.blacklist
            .revoke_all_user_tokens(&ctx.user_id, &ctx.user_id, RevocationReason::LogoutAll)
            .await
    }

    /// Replaces the password, revokes every token of the user and returns a
    /// pair for a fresh session.
    #[tracing::instrument(skip_all, fields(user_id = %ctx.user_id))]
    pub async fn change_password(
        &self,
        ctx: &AuthContext,
        current_password: Password,
        new_password: Password,
    ) -> Result<TokenPair, ServiceError> {
        let user = self
            .users
            .get_user(&ctx.user_id)
            .await?
            .ok_or(ServiceError::InvalidToken)?;

        if user.auth_method != AuthMethod::Password {
            return Err(ServiceError::Validation(
                "Password change is not available for this account".into(),
            ));
        }
        let stored_hash = user
            .password_hash
            .clone()
            .ok_or(ServiceError::InvalidCredentials)?;

        if !check_password(current_password, stored_hash).await? {
            return Err(ServiceError::InvalidCredentials);
        }

        let new_hash = tokio::task::spawn_blocking(move || hash_password(&new_password))
            .await
            .map_err(|e| anyhow::anyhow!("Password hashing task failed: {}", e))??;
        self.users.update_password_hash(&user.id, &new_hash).await?;

        let boundary = self
            .blacklist
            .revoke_all_user_tokens(&user.id, &user.id, RevocationReason::PasswordChange)
            .await?;

        self.audit
            .record(
                AuditEvent::new(AuditEventType::PasswordChanged)
                    .actor(user.id.clone())
                    .target_user(Some(user.id.clone())),
            )
            .await;

        // The replacement pair must not fall behind the boundary just set.
        self.issue_session_tokens_at(&user, Utc::now().max(boundary))
            .await
    }

    /// Password sign-in. Unknown emails, OAuth accounts and wrong passwords
    /// are indistinguishable to the caller.
    #[tracing::instrument(skip_all)]
    pub async fn login_with_password(
        &self,
        email: &str,
        password: Password,
    ) -> Result<TokenPair, ServiceError> {
        let email = normalize_email(email);
        let user = self.users.get_user_by_email(&email).await?;

        let Some(user) = user.filter(|u| u.auth_method == AuthMethod::Password) else {
            tracing::info!("Password login rejected");
            return Err(ServiceError::InvalidCredentials);
        };
        let Some(stored_hash) = user.password_hash.clone() else {
            return Err(ServiceError::InvalidCredentials);
        };

        if !check_password(password, stored_hash).await? {
            tracing::info!(user_id = %user.id, "Password login rejected");
            return Err(ServiceError::InvalidCredentials);
        }

        let pair = self.issue_session_tokens(&user).await?;

        self.audit
            .record(
                AuditEvent::new(AuditEventType::UserLogin)
                    .actor(user.id.clone())
                    .target_user(Some(user.id.clone()))
                    .details(serde_json::json!({
                        "method": "password",
                        "session_id": pair.session_id,
                    })),
            )
            .await;
        Ok(pair)
    }

    /// Reports whether a token of either type would currently be accepted.
    pub async fn introspect(&self, token: &str) -> Introspection {
        let Ok(claims) = self.jwt.decode(token) else {
            return Introspection::inactive();
        };

        match self.check_not_revoked(&claims).await {
            Ok(()) => Introspection {
                active: true,
                sub: Some(claims.sub),
                token_type: Some(claims.typ),
                exp: Some(claims.exp),
            },
            Err(_) => Introspection::inactive(),
        }
    }
}

/// True when the token predates the user's revocation boundary. Both sides
/// are compared in microseconds.
fn issued_before(claims: &Claims, boundary: Option<DateTime<Utc>>) -> bool {
    boundary.is_some_and(|boundary| claims.iat_us < boundary.timestamp_micros())
}

async fn check_password(password: Password, stored_hash: String) -> Result<bool, ServiceError> {
    let matched = tokio::task::spawn_blocking(move || verify_password(&password, &stored_hash))
        .await
        .map_err(|e| anyhow::anyhow!("Password verification task failed: {}", e))??;
    Ok(matched)
}
