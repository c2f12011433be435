//! Blacklist entries and the revocation reason taxonomy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;

const MAX_REASON_LEN: usize = 64;
const MAX_JTI_LEN: usize = 128;

/// Why a token (or every token of a user) was revoked.
///
/// Well-known categories get their own variant. Any other lowercase
/// `[a-z0-9_]{1,64}` category is kept verbatim as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RevocationReason {
    Logout,
    LogoutAll,
    PasswordChange,
    SecurityIncident,
    AdminAction,
    TokenRotation,
    RefreshReuse,
    SessionRevoked,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid revocation reason: must be 1-64 characters of a-z, 0-9 or _")]
pub struct InvalidReason;

impl RevocationReason {
    pub fn as_str(&self) -> &str {
        match self {
            RevocationReason::Logout => "logout",
            RevocationReason::LogoutAll => "logout_all",
            RevocationReason::PasswordChange => "password_change",
            RevocationReason::SecurityIncident => "security_incident",
            RevocationReason::AdminAction => "admin_action",
            RevocationReason::TokenRotation => "token_rotation",
            RevocationReason::RefreshReuse => "refresh_reuse",
            RevocationReason::SessionRevoked => "session_revoked",
            RevocationReason::Other(other) => other,
        }
    }
}

impl FromStr for RevocationReason {
    type Err = InvalidReason;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let reason = match s {
            "logout" => RevocationReason::Logout,
            "logout_all" => RevocationReason::LogoutAll,
            "password_change" => RevocationReason::PasswordChange,
            "security_incident" => RevocationReason::SecurityIncident,
            "admin_action" => RevocationReason::AdminAction,
            "token_rotation" => RevocationReason::TokenRotation,
            "refresh_reuse" => RevocationReason::RefreshReuse,
            "session_revoked" => RevocationReason::SessionRevoked,
            other if is_reason_token(other) => RevocationReason::Other(other.to_string()),
            _ => return Err(InvalidReason),
        };
        Ok(reason)
    }
}

impl TryFrom<String> for RevocationReason {
    type Error = InvalidReason;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RevocationReason> for String {
    fn from(reason: RevocationReason) -> Self {
        reason.as_str().to_string()
    }
}

impl fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_reason_token(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_REASON_LEN
        && s
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

/// JTIs are opaque, but must be short printable identifiers.
pub fn is_well_formed_jti(jti: &str) -> bool {
    !jti.is_empty()
        && jti.len() <= MAX_JTI_LEN
        && jti
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// A revoked token. Write-once: the first revocation of a JTI is kept.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct BlacklistedToken {
    #[schema(example = "01K4FHGHT3XX9WFM293QPZ5G9V")]
    pub jti: String,
    /// Owning user. `None` when the JTI was never issued by this service.
    pub user_id: Option<String>,
    pub revoked_by: String,
    #[sqlx(try_from = "String")]
    #[schema(value_type = String, example = "security_incident")]
    pub reason: RevocationReason,
    pub revoked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Offset pagination, already clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub limit: i64,
    pub offset: i64,
}

impl PageRequest {
    pub const DEFAULT_LIMIT: i64 = 50;
    pub const MAX_LIMIT: i64 = 200;

    pub fn clamped(limit: Option<i64>, offset: Option<i64>) -> Self {
        Self {
            limit: limit
                .unwrap_or(Self::DEFAULT_LIMIT)
                .clamp(1, Self::MAX_LIMIT),
            offset: offset.unwrap_or(0).max(0),
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::clamped(None, None)
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[aliases(BlacklistPage = Page<BlacklistedToken>)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Filter for blacklist listings. At least one field is expected to be set.
#[derive(Debug, Clone, Default)]
pub struct BlacklistFilter {
    pub user_id: Option<String>,
    pub reason: Option<RevocationReason>,
}

impl BlacklistFilter {
    pub fn matches(&self, entry: &BlacklistedToken) -> bool {
        self.user_id
            .as_deref()
            .map_or(true, |u| entry.user_id.as_deref() == Some(u))
            && self.reason.as_ref().map_or(true, |r| &entry.reason == r)
    }
}

#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct BlacklistStats {
    pub total_blacklisted: i64,
    /// Entries whose original token has not yet expired.
    pub active: i64,
    /// Entries revoked since UTC midnight.
    pub revoked_today: i64,
    pub by_reason: BTreeMap<String, i64>,
}
