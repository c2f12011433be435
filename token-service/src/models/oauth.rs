//! Ephemeral OAuth records. All of them live in the ephemeral store under a
//! random key, with a TTL, and are consumed with an atomic delete-on-read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::services::TokenPair;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Google,
    Github,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Google => "google",
            ProviderKind::Github => "github",
        }
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "google" => Ok(ProviderKind::Google),
            "github" => Ok(ProviderKind::Github),
            _ => Err(format!("Unknown OAuth provider: {}", s)),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CSRF state plus PKCE verifier, keyed by the `state` query value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthState {
    pub provider: ProviderKind,
    pub invitation_token: Option<String>,
    pub code_verifier: String,
    pub created_at: DateTime<Utc>,
}

/// A verified external identity with no matching account yet, waiting for
/// the signup step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthSession {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub provider: ProviderKind,
    pub provider_id: String,
    pub invitation_token: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Tokens minted for an existing account by the callback, handed to the
/// frontend through a one-time id instead of the redirect URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthLoginGrant {
    pub user_id: String,
    pub tokens: TokenPair,
}

/// Profile asserted by a provider after the code exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalProfile {
    pub provider_id: String,
    pub email: String,
    pub email_verified: bool,
    pub first_name: String,
    pub last_name: String,
}
