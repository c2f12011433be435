//! Reconciles identities asserted by OAuth providers with local accounts.
//!
//! The callback runs `state -> code exchange -> profile -> gates`, then
//! either issues tokens for an existing account or parks the verified
//! profile as a pending signup. Every failure ends in a redirect to the
//! frontend error page with a stable error code.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use rand::Rng;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::models::{
    normalize_email, AuditEvent, AuditEventType, AuthMethod, ExternalProfile, NewOAuthUser,
    OAuthLoginGrant, OAuthSession, OAuthState, ProviderKind, RevocationReason, UserAccount,
};
use crate::services::audit::AuditService;
use crate::services::directory::UserDirectory;
use crate::services::error::ServiceError;
use crate::services::metrics::Metrics;
use crate::services::oauth::provider::OAuthProvider;
use crate::services::redis::EphemeralStore;
use crate::services::tokens::{TokenPair, TokenService};

const STATE_PREFIX: &str = "oauth_state:";
const SESSION_PREFIX: &str = "oauth_session:";
const GRANT_PREFIX: &str = "oauth_grant:";
const MAX_OPAQUE_ID_LEN: usize = 256;

/// Codes appended to `{frontend}/auth/error?error=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    OAuthFailed,
    InvalidState,
    TokenExchangeFailed,
    ProfileFetchFailed,
    AccountExistsUsePassword,
    UseProvider(ProviderKind),
    AuthenticationFailed,
    LoginFailed,
    SessionFailed,
    SessionCreationFailed,
}

impl LinkError {
    pub fn code(&self) -> String {
        match self {
            LinkError::OAuthFailed => "oauth_failed".into(),
            LinkError::InvalidState => "invalid_state".into(),
            LinkError::TokenExchangeFailed => "token_exchange_failed".into(),
            LinkError::ProfileFetchFailed => "profile_fetch_failed".into(),
            LinkError::AccountExistsUsePassword => "account_exists_use_password".into(),
            LinkError::UseProvider(provider) => format!("use_{}", provider.as_str()),
            LinkError::AuthenticationFailed => "authentication_failed".into(),
            LinkError::LoginFailed => "login_failed".into(),
            LinkError::SessionFailed => "session_failed".into(),
            LinkError::SessionCreationFailed => "session_creation_failed".into(),
        }
    }
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code())
    }
}

/// Query string the provider sends back to the callback.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct OAuthTtls {
    pub state_seconds: u64,
    pub session_seconds: u64,
    pub login_grant_seconds: u64,
}

impl Default for OAuthTtls {
    fn default() -> Self {
        Self {
            state_seconds: 600,
            session_seconds: 600,
            login_grant_seconds: 120,
        }
    }
}

#[derive(Clone)]
pub struct OAuthLinker {
    providers: Arc<HashMap<ProviderKind, Arc<dyn OAuthProvider>>>,
    ephemeral: Arc<dyn EphemeralStore>,
    users: Arc<dyn UserDirectory>,
    tokens: TokenService,
    audit: AuditService,
    metrics: Metrics,
    frontend_url: String,
    ttls: OAuthTtls,
}

impl OAuthLinker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        providers: HashMap<ProviderKind, Arc<dyn OAuthProvider>>,
        ephemeral: Arc<dyn EphemeralStore>,
        users: Arc<dyn UserDirectory>,
        tokens: TokenService,
        audit: AuditService,
        metrics: Metrics,
        frontend_url: &str,
        ttls: OAuthTtls,
    ) -> Self {
        Self {
            providers: Arc::new(providers),
            ephemeral,
            users,
            tokens,
            audit,
            metrics,
            frontend_url: frontend_url.trim_end_matches('/').to_string(),
            ttls,
        }
    }

    fn provider(&self, kind: ProviderKind) -> Result<&Arc<dyn OAuthProvider>, ServiceError> {
        self.providers
            .get(&kind)
            .ok_or_else(|| ServiceError::NotFound("Unknown OAuth provider".into()))
    }

    /// Stores a fresh state and PKCE verifier and returns the provider's
    /// authorization URL.
    #[tracing::instrument(skip(self, invitation_token), fields(provider = %kind))]
    pub async fn initiate(
        &self,
        kind: ProviderKind,
        invitation_token: Option<String>,
    ) -> Result<String, ServiceError> {
        let provider = self.provider(kind)?;

        let invitation_token = invitation_token.filter(|t| !t.is_empty());
        if invitation_token
            .as_ref()
            .is_some_and(|t| t.len() > MAX_OPAQUE_ID_LEN)
        {
            return Err(ServiceError::Validation("Invitation token is too long".into()));
        }

        let state = random_urlsafe();
        let code_verifier = random_urlsafe();
        let code_challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(code_verifier.as_bytes()));

        let record = OAuthState {
            provider: kind,
            invitation_token,
            code_verifier,
            created_at: Utc::now(),
        };
        let value = serde_json::to_string(&record)
            .map_err(|e| anyhow::anyhow!("Failed to encode OAuth state: {}", e))?;
        self.ephemeral
            .put(
                &format!("{}{}", STATE_PREFIX, state),
                &value,
                self.ttls.state_seconds,
            )
            .await?;

        Ok(provider.authorization_url(&state, &code_challenge))
    }

    /// Runs the callback and returns where to redirect the browser. Only an
    /// unconfigured provider is an error; everything else is a redirect.
    #[tracing::instrument(skip(self, params), fields(provider = %kind))]
    pub async fn handle_callback(
        &self,
        kind: ProviderKind,
        params: CallbackParams,
    ) -> Result<String, ServiceError> {
        let provider = self.provider(kind)?.clone();

        match self.callback_flow(provider.as_ref(), params).await {
            Ok((url, outcome)) => {
                self.metrics.oauth_callback(kind.as_str(), outcome);
                Ok(url)
            }
            Err(err) => {
                let code = err.code();
                self.metrics.oauth_callback(kind.as_str(), &code);
                tracing::warn!(error_code = %code, "OAuth callback failed");
                Ok(format!(
                    "{}/auth/error?error={}",
                    self.frontend_url,
                    urlencoding::encode(&code)
                ))
            }
        }
    }

    async fn callback_flow(
        &self,
        provider: &dyn OAuthProvider,
        params: CallbackParams,
    ) -> Result<(String, &'static str), LinkError> {
        if let Some(error) = params.error {
            tracing::warn!(provider_error = %error, "Provider returned an error");
            return Err(LinkError::OAuthFailed);
        }
        let code = params
            .code
            .filter(|c| !c.is_empty())
            .ok_or(LinkError::OAuthFailed)?;
        let state = params
            .state
            .filter(|s| !s.is_empty() && s.len() <= MAX_OPAQUE_ID_LEN)
            .ok_or(LinkError::InvalidState)?;

        let raw = self
            .ephemeral
            .take(&format!("{}{}", STATE_PREFIX, state))
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to load OAuth state");
                LinkError::InvalidState
            })?
            .ok_or(LinkError::InvalidState)?;
        let stored: OAuthState =
            serde_json::from_str(&raw).map_err(|_| LinkError::InvalidState)?;
        if stored.provider != provider.kind() {
            return Err(LinkError::InvalidState);
        }

        let access_token = provider
            .exchange_code(&code, &stored.code_verifier)
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "OAuth code exchange failed");
                LinkError::TokenExchangeFailed
            })?;
        let profile = provider.fetch_profile(&access_token).await.map_err(|e| {
            tracing::warn!(error = %e, "OAuth profile fetch failed");
            LinkError::ProfileFetchFailed
        })?;

        let email = normalize_email(&profile.email);
        let existing = self.users.get_user_by_email(&email).await.map_err(|e| {
            tracing::error!(error = %e, "User lookup failed during OAuth callback");
            LinkError::OAuthFailed
        })?;

        match existing {
            Some(user) => {
                let url = self.login_existing(provider.kind(), &profile, user).await?;
                Ok((url, "login"))
            }
            None => {
                require_verified_email(&profile)?;
                let url = self
                    .start_signup(provider.kind(), profile, email, stored.invitation_token)
                    .await?;
                Ok((url, "signup"))
            }
        }
    }

    /// Gates for an existing account, in order: auth method, provider,
    /// provider subject id. Email verification is only checked once all
    /// three have passed.
    async fn login_existing(
        &self,
        kind: ProviderKind,
        profile: &ExternalProfile,
        user: UserAccount,
    ) -> Result<String, LinkError> {
        if user.auth_method != AuthMethod::OAuth {
            return Err(LinkError::AccountExistsUsePassword);
        }

        let stored_provider = user
            .oauth_provider
            .as_deref()
            .and_then(|p| p.parse::<ProviderKind>().ok());
        let Some(stored_provider) = stored_provider else {
            tracing::error!(user_id = %user.id, "OAuth account has no usable provider on record");
            return Err(LinkError::AuthenticationFailed);
        };
        if stored_provider != kind {
            return Err(LinkError::UseProvider(stored_provider));
        }

        let stored_id = user.oauth_provider_id.as_deref().unwrap_or_default();
        let same_subject: bool = stored_id
            .as_bytes()
            .ct_eq(profile.provider_id.as_bytes())
            .into();
        if stored_id.is_empty() || !same_subject {
            tracing::error!(
                user_id = %user.id,
                provider = %kind,
                "OAuth provider id does not match the account on record"
            );
            self.audit
                .record(
                    AuditEvent::new(AuditEventType::OAuthIdentityMismatch)
                        .target_user(Some(user.id.clone()))
                        .details(serde_json::json!({ "provider": kind.as_str() })),
                )
                .await;
            return Err(LinkError::AuthenticationFailed);
        }
        require_verified_email(profile)?;

        let tokens = self.tokens.issue_session_tokens(&user).await.map_err(|e| {
            tracing::error!(error = %e, user_id = %user.id, "Token issuance failed after OAuth login");
            LinkError::LoginFailed
        })?;

        let grant_id = random_urlsafe();
        let session_id = tokens.session_id;
        let grant = OAuthLoginGrant {
            user_id: user.id.clone(),
            tokens,
        };
        let stored = self
            .store_json(GRANT_PREFIX, &grant_id, &grant, self.ttls.login_grant_seconds)
            .await;
        if let Err(e) = stored {
            tracing::error!(error = %e, user_id = %user.id, "Failed to store OAuth login grant");
            if let Err(e) = self
                .tokens
                .close_session(session_id, RevocationReason::SessionRevoked, &user.id)
                .await
            {
                tracing::error!(error = %e, %session_id, "Failed to close undelivered session");
            }
            return Err(LinkError::SessionFailed);
        }

        self.audit
            .record(
                AuditEvent::new(AuditEventType::OAuthLogin)
                    .actor(user.id.clone())
                    .target_user(Some(user.id.clone()))
                    .details(serde_json::json!({
                        "provider": kind.as_str(),
                        "session_id": session_id,
                    })),
            )
            .await;

        Ok(format!(
            "{}/auth/callback?session={}&type=login",
            self.frontend_url, grant_id
        ))
    }

    async fn start_signup(
        &self,
        kind: ProviderKind,
        profile: ExternalProfile,
        email: String,
        invitation_token: Option<String>,
    ) -> Result<String, LinkError> {
        let pending = OAuthSession {
            email,
            first_name: profile.first_name,
            last_name: profile.last_name,
            provider: kind,
            provider_id: profile.provider_id,
            invitation_token,
            created_at: Utc::now(),
        };

        let session_id = random_urlsafe();
        self.store_json(SESSION_PREFIX, &session_id, &pending, self.ttls.session_seconds)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to store pending OAuth signup");
                LinkError::SessionCreationFailed
            })?;

        Ok(format!(
            "{}/auth/callback?session={}&type=signup",
            self.frontend_url, session_id
        ))
    }

    /// Hands out the tokens minted by a login callback. Single use.
    pub async fn redeem_login_grant(&self, session_id: &str) -> Result<TokenPair, ServiceError> {
        let grant: OAuthLoginGrant = self.take_json(GRANT_PREFIX, session_id).await?;
        Ok(grant.tokens)
    }

    /// Creates the account for a pending signup and signs it in. The pending
    /// record is consumed whether or not creation succeeds.
    #[tracing::instrument(skip_all)]
    pub async fn complete_signup(
        &self,
        session_id: &str,
        first_name: Option<String>,
        last_name: Option<String>,
    ) -> Result<TokenPair, ServiceError> {
        let pending: OAuthSession = self.take_json(SESSION_PREFIX, session_id).await?;

        let pick = |given: Option<String>, asserted: String| {
            given
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .unwrap_or(asserted)
        };

        let user = self
            .users
            .create_oauth_user(NewOAuthUser {
                email: pending.email,
                first_name: pick(first_name, pending.first_name),
                last_name: pick(last_name, pending.last_name),
                provider: pending.provider.as_str().to_string(),
                provider_id: pending.provider_id,
                invitation_token: pending.invitation_token,
            })
            .await?;

        tracing::info!(user_id = %user.id, provider = %pending.provider, "OAuth account created");
        let tokens = self.tokens.issue_session_tokens(&user).await?;

        self.audit
            .record(
                AuditEvent::new(AuditEventType::OAuthSignupCompleted)
                    .actor(user.id.clone())
                    .target_user(Some(user.id.clone()))
                    .details(serde_json::json!({
                        "provider": pending.provider.as_str(),
                        "role": user.role.as_str(),
                    })),
            )
            .await;

        Ok(tokens)
    }

    async fn store_json<T: serde::Serialize>(
        &self,
        prefix: &str,
        id: &str,
        value: &T,
        ttl_seconds: u64,
    ) -> Result<(), ServiceError> {
        let encoded = serde_json::to_string(value)
            .map_err(|e| anyhow::anyhow!("Failed to encode {}: {}", prefix, e))?;
        self.ephemeral
            .put(&format!("{}{}", prefix, id), &encoded, ttl_seconds)
            .await?;
        Ok(())
    }

    async fn take_json<T: serde::de::DeserializeOwned>(
        &self,
        prefix: &str,
        id: &str,
    ) -> Result<T, ServiceError> {
        let invalid = || ServiceError::Validation("Invalid or expired session".into());

        if id.is_empty() || id.len() > MAX_OPAQUE_ID_LEN {
            return Err(invalid());
        }
        let raw = self
            .ephemeral
            .take(&format!("{}{}", prefix, id))
            .await?
            .ok_or_else(invalid)?;
        serde_json::from_str(&raw).map_err(|e| {
            tracing::error!(error = %e, "Unreadable ephemeral OAuth record");
            invalid()
        })
    }
}

fn require_verified_email(profile: &ExternalProfile) -> Result<(), LinkError> {
    if profile.email_verified {
        return Ok(());
    }
    tracing::warn!(provider_id = %profile.provider_id, "Provider email is not verified");
    Err(LinkError::AuthenticationFailed)
}

/// 32 random bytes, base64url without padding.
fn random_urlsafe() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
