//! OAuth 2.0 authorization-code clients (PKCE S256) for the supported
//! identity providers.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::{OAuthClientConfig, OAuthConfig};
use crate::models::{ExternalProfile, ProviderKind};

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("profile fetch failed: {0}")]
    ProfileFetch(String),
}

#[async_trait]
pub trait OAuthProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;
    /// Where to send the browser. `code_challenge` is the S256 PKCE challenge.
    fn authorization_url(&self, state: &str, code_challenge: &str) -> String;
    /// Trades the authorization code for a provider access token.
    async fn exchange_code(&self, code: &str, code_verifier: &str)
        -> Result<String, ProviderError>;
    async fn fetch_profile(&self, access_token: &str) -> Result<ExternalProfile, ProviderError>;
}

const USER_AGENT: &str = concat!("token-service/", env!("CARGO_PKG_VERSION"));

fn http_client() -> Result<reqwest::Client, anyhow::Error> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build OAuth HTTP client: {}", e))
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    error: Option<String>,
}

/// Shared by both providers; GitHub reports failures as a 200 with an
/// `error` field, so both are checked.
async fn exchange(
    client: &reqwest::Client,
    config: &OAuthClientConfig,
    code: &str,
    code_verifier: &str,
) -> Result<String, ProviderError> {
    let response = client
        .post(&config.token_url)
        .header(reqwest::header::ACCEPT, "application/json")
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", config.redirect_uri.as_str()),
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.expose_secret().as_str()),
            ("code_verifier", code_verifier),
        ])
        .send()
        .await
        .map_err(|e| ProviderError::TokenExchange(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        tracing::error!(%status, body = %body, "OAuth token endpoint returned an error");
        return Err(ProviderError::TokenExchange(format!("status {}", status)));
    }

    let token: TokenResponse = response
        .json()
        .await
        .map_err(|e| ProviderError::TokenExchange(e.to_string()))?;

    match (token.access_token, token.error) {
        (Some(access_token), None) => Ok(access_token),
        (_, Some(error)) => Err(ProviderError::TokenExchange(error)),
        (None, None) => Err(ProviderError::TokenExchange(
            "response carried no access token".into(),
        )),
    }
}

fn authorization_url(
    config: &OAuthClientConfig,
    scope: &str,
    state: &str,
    code_challenge: &str,
) -> String {
    format!(
        "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&state={}&code_challenge={}&code_challenge_method=S256",
        config.authorize_url,
        urlencoding::encode(&config.client_id),
        urlencoding::encode(&config.redirect_uri),
        urlencoding::encode(scope),
        urlencoding::encode(state),
        urlencoding::encode(code_challenge),
    )
}

async fn get_json<T: serde::de::DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    access_token: &str,
) -> Result<T, ProviderError> {
    let response = client
        .get(url)
        .bearer_auth(access_token)
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await
        .map_err(|e| ProviderError::ProfileFetch(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ProviderError::ProfileFetch(format!(
            "{} returned {}",
            url, status
        )));
    }

    response
        .json()
        .await
        .map_err(|e| ProviderError::ProfileFetch(e.to_string()))
}

pub struct GoogleProvider {
    client: reqwest::Client,
    config: OAuthClientConfig,
}

#[derive(Debug, Deserialize)]
struct GoogleUserInfo {
    sub: String,
    email: Option<String>,
    #[serde(default)]
    email_verified: bool,
    given_name: Option<String>,
    family_name: Option<String>,
}

impl GoogleProvider {
    pub fn new(config: OAuthClientConfig) -> Result<Self, anyhow::Error> {
        Ok(Self {
            client: http_client()?,
            config,
        })
    }
}

#[async_trait]
impl OAuthProvider for GoogleProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
    }

    fn authorization_url(&self, state: &str, code_challenge: &str) -> String {
        format!(
            "{}&access_type=online&prompt=select_account",
            authorization_url(&self.config, "openid email profile", state, code_challenge)
        )
    }

    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
    ) -> Result<String, ProviderError> {
        exchange(&self.client, &self.config, code, code_verifier).await
    }

    async fn fetch_profile(&self, access_token: &str) -> Result<ExternalProfile, ProviderError> {
        let info: GoogleUserInfo =
            get_json(&self.client, &self.config.userinfo_url, access_token).await?;

        let email = info
            .email
            .ok_or_else(|| ProviderError::ProfileFetch("profile has no email".into()))?;

        Ok(ExternalProfile {
            provider_id: info.sub,
            email,
            email_verified: info.email_verified,
            first_name: info.given_name.unwrap_or_default(),
            last_name: info.family_name.unwrap_or_default(),
        })
    }
}

pub struct GithubProvider {
    client: reqwest::Client,
    config: OAuthClientConfig,
}

#[derive(Debug, Deserialize)]
struct GithubUser {
    id: i64,
    login: String,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GithubEmail {
    email: String,
    primary: bool,
    verified: bool,
}

impl GithubProvider {
    pub fn new(config: OAuthClientConfig) -> Result<Self, anyhow::Error> {
        Ok(Self {
            client: http_client()?,
            config,
        })
    }
}

#[async_trait]
impl OAuthProvider for GithubProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Github
    }

    fn authorization_url(&self, state: &str, code_challenge: &str) -> String {
        authorization_url(&self.config, "read:user user:email", state, code_challenge)
    }

    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
    ) -> Result<String, ProviderError> {
        exchange(&self.client, &self.config, code, code_verifier).await
    }

    /// The public profile email is optional on GitHub, so the address comes
    /// from the emails endpoint: the primary one, with its verified flag.
    async fn fetch_profile(&self, access_token: &str) -> Result<ExternalProfile, ProviderError> {
        let user: GithubUser =
            get_json(&self.client, &self.config.userinfo_url, access_token).await?;

        let emails_url = self
            .config
            .emails_url
            .as_deref()
            .ok_or_else(|| ProviderError::ProfileFetch("emails endpoint not configured".into()))?;
        let emails: Vec<GithubEmail> = get_json(&self.client, emails_url, access_token).await?;

        let primary = emails
            .into_iter()
            .find(|e| e.primary)
            .ok_or_else(|| ProviderError::ProfileFetch("account has no primary email".into()))?;

        let display_name = user.name.unwrap_or_default();
        let (first_name, last_name) = match display_name.trim().split_once(char::is_whitespace) {
            Some((first, last)) => (first.to_string(), last.trim().to_string()),
            None if !display_name.trim().is_empty() => {
                (display_name.trim().to_string(), String::new())
            }
            None => (user.login, String::new()),
        };

        Ok(ExternalProfile {
            provider_id: user.id.to_string(),
            email: primary.email,
            email_verified: primary.verified,
            first_name,
            last_name,
        })
    }
}

/// Clients for every provider with credentials configured.
pub fn build_providers(
    config: &OAuthConfig,
) -> Result<HashMap<ProviderKind, Arc<dyn OAuthProvider>>, anyhow::Error> {
    let mut providers: HashMap<ProviderKind, Arc<dyn OAuthProvider>> = HashMap::new();

    if let Some(google) = &config.google {
        providers.insert(
            ProviderKind::Google,
            Arc::new(GoogleProvider::new(google.clone())?),
        );
    }
    if let Some(github) = &config.github {
        providers.insert(
            ProviderKind::Github,
            Arc::new(GithubProvider::new(github.clone())?),
        );
    }

    if providers.is_empty() {
        tracing::warn!("No OAuth providers configured");
    }
    Ok(providers)
}
