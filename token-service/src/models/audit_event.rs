//! Audit event model - revocation and sign-in trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    TokenRevoked,
    UserTokensRevoked,
    SessionRevoked,
    TokenRefreshed,
    RefreshReuseDetected,
    OAuthLogin,
    OAuthIdentityMismatch,
    OAuthSignupCompleted,
    UserLogin,
    UserLogout,
    PasswordChanged,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::TokenRevoked => "token_revoked",
            AuditEventType::UserTokensRevoked => "user_tokens_revoked",
            AuditEventType::SessionRevoked => "session_revoked",
            AuditEventType::TokenRefreshed => "token_refreshed",
            AuditEventType::RefreshReuseDetected => "refresh_reuse_detected",
            AuditEventType::OAuthLogin => "oauth_login",
            AuditEventType::OAuthIdentityMismatch => "oauth_identity_mismatch",
            AuditEventType::OAuthSignupCompleted => "oauth_signup_completed",
            AuditEventType::UserLogin => "user_login",
            AuditEventType::UserLogout => "user_logout",
            AuditEventType::PasswordChanged => "password_changed",
        }
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub actor_user_id: Option<String>,
    pub target_user_id: Option<String>,
    pub target_jti: Option<String>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.as_str().to_string(),
            actor_user_id: None,
            target_user_id: None,
            target_jti: None,
            details: serde_json::Value::Object(Default::default()),
            created_at: Utc::now(),
        }
    }

    pub fn actor(mut self, user_id: impl Into<String>) -> Self {
        self.actor_user_id = Some(user_id.into());
        self
    }

    pub fn target_user(mut self, user_id: Option<impl Into<String>>) -> Self {
        self.target_user_id = user_id.map(Into::into);
        self
    }

    pub fn target_jti(mut self, jti: impl Into<String>) -> Self {
        self.target_jti = Some(jti.into());
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}
