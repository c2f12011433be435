//! Test helpers for token-service integration tests.
//!
//! Builds the full router over in-memory stores with a scripted OAuth
//! provider, so tests run without Postgres, Redis or network access.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use chrono::{DateTime, Utc};
use secrecy::Secret;
use serde_json::Value;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use token_service::{
    build_router,
    config::{
        DatabaseConfig, Environment, JwtConfig, MaintenanceConfig, OAuthConfig, RateLimitConfig,
        RedisConfig, SecurityConfig, TokenServiceConfig,
    },
    models::{
        AuditEvent, AuthMethod, BlacklistFilter, BlacklistStats, BlacklistedToken,
        ExternalProfile, IssuedToken, Page, PageRequest, ProviderKind, Role, Session, UserAccount,
    },
    services::{
        InMemoryEphemeralStore, InMemoryTokenStore, InMemoryUserDirectory, Metrics,
        OAuthProvider, ProviderError, StoreError, TokenPair, TokenStore,
    },
    utils::{hash_password, Password},
    AppState, Backends,
};
use tower::util::ServiceExt;
use uuid::Uuid;

pub const TEST_JWT_SECRET: &str = "0123456789abcdef0123456789abcdef";
pub const FRONTEND_URL: &str = "https://app.example.test";

pub const ADMIN_ID: &str = "01K4ADMIN000000000000000";
pub const ADMIN_EMAIL: &str = "admin@example.test";
pub const MEMBER_ID: &str = "01K4MEMBER00000000000000";
pub const MEMBER_EMAIL: &str = "alice@example.test";
pub const PASSWORD: &str = "correct horse battery";
pub const OAUTH_USER_ID: &str = "01K4OAUTH000000000000000";
pub const OAUTH_EMAIL: &str = "bob@example.test";
pub const OAUTH_SUBJECT: &str = "google-sub-bob";

pub fn test_config() -> TokenServiceConfig {
    TokenServiceConfig {
        common: service_core::config::Config {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8080,
            shutdown_grace_seconds: 1,
        },
        environment: Environment::Dev,
        service_name: "token-service-test".to_string(),
        service_version: "0.0.0".to_string(),
        log_level: "error".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: Secret::new("postgres://unused".to_string()),
            max_connections: 1,
            min_connections: 0,
        },
        redis: RedisConfig {
            url: "redis://unused".to_string(),
        },
        jwt: JwtConfig {
            secret: Some(Secret::new(TEST_JWT_SECRET.to_string())),
            private_key_path: None,
            public_key_path: None,
            issuer: "token-service".to_string(),
            access_token_expiry_minutes: 15,
            refresh_token_expiry_days: 7,
        },
        oauth: OAuthConfig {
            frontend_url: format!("{}/", FRONTEND_URL),
            state_ttl_seconds: 600,
            session_ttl_seconds: 600,
            login_grant_ttl_seconds: 120,
            google: None,
            github: None,
        },
        security: SecurityConfig {
            allowed_origins: vec![FRONTEND_URL.to_string()],
            validation_timeout_ms: 300,
        },
        rate_limit: RateLimitConfig {
            login_attempts: 100,
            login_window_seconds: 60,
        },
        maintenance: MaintenanceConfig {
            prune_interval_seconds: 3600,
            store_retry_max_elapsed_ms: 50,
        },
    }
}

/// OAuth provider whose authorization codes map straight to canned profiles.
/// The code doubles as the provider access token.
pub struct ScriptedProvider {
    kind: ProviderKind,
    profiles: HashMap<String, ExternalProfile>,
}

impl ScriptedProvider {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            profiles: HashMap::new(),
        }
    }

    pub fn with_profile(mut self, code: &str, profile: ExternalProfile) -> Self {
        self.profiles.insert(code.to_string(), profile);
        self
    }
}

#[async_trait]
impl OAuthProvider for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn authorization_url(&self, state: &str, code_challenge: &str) -> String {
        format!(
            "https://{}.provider.test/authorize?state={}&code_challenge={}",
            self.kind, state, code_challenge
        )
    }

    async fn exchange_code(&self, code: &str, _verifier: &str) -> Result<String, ProviderError> {
        if self.profiles.contains_key(code) {
            Ok(code.to_string())
        } else {
            Err(ProviderError::TokenExchange("invalid_grant".to_string()))
        }
    }

    async fn fetch_profile(&self, access_token: &str) -> Result<ExternalProfile, ProviderError> {
        self.profiles
            .get(access_token)
            .cloned()
            .ok_or_else(|| ProviderError::ProfileFetch("unknown token".to_string()))
    }
}

pub fn profile(subject: &str, email: &str, verified: bool) -> ExternalProfile {
    ExternalProfile {
        provider_id: subject.to_string(),
        email: email.to_string(),
        email_verified: verified,
        first_name: "Ext".to_string(),
        last_name: "User".to_string(),
    }
}

/// Codes the default providers understand.
pub fn default_providers() -> HashMap<ProviderKind, Arc<dyn OAuthProvider>> {
    let google = ScriptedProvider::new(ProviderKind::Google)
        .with_profile("bob-code", profile(OAUTH_SUBJECT, "Bob@Example.test", true))
        .with_profile("bob-imposter", profile("google-sub-other", OAUTH_EMAIL, true))
        .with_profile("alice-code", profile("google-sub-alice", MEMBER_EMAIL, true))
        .with_profile("alice-unverified", profile("google-sub-alice", MEMBER_EMAIL, false))
        .with_profile("bob-unverified", profile(OAUTH_SUBJECT, OAUTH_EMAIL, false))
        .with_profile("new-code", profile("google-sub-new", "carol@example.test", true))
        .with_profile("unverified", profile("google-sub-eve", "eve@example.test", false));
    let github = ScriptedProvider::new(ProviderKind::Github)
        .with_profile("bob-gh", profile("4242", OAUTH_EMAIL, true))
        .with_profile("bob-gh-unverified", profile("4242", OAUTH_EMAIL, false))
        .with_profile("dave-gh", profile("5151", "dave@example.test", true));

    let mut providers: HashMap<ProviderKind, Arc<dyn OAuthProvider>> = HashMap::new();
    providers.insert(ProviderKind::Google, Arc::new(google));
    providers.insert(ProviderKind::Github, Arc::new(github));
    providers
}

fn user(id: &str, email: &str, role: Role, method: AuthMethod) -> UserAccount {
    UserAccount {
        id: id.to_string(),
        email: email.to_string(),
        first_name: "Test".to_string(),
        last_name: "User".to_string(),
        role,
        auth_method: method,
        password_hash: None,
        oauth_provider: None,
        oauth_provider_id: None,
        created_at: Utc::now(),
    }
}

pub fn seed_users(users: &InMemoryUserDirectory) {
    let hash = hash_password(&Password::new(PASSWORD)).expect("hash test password");

    let mut admin = user(ADMIN_ID, ADMIN_EMAIL, Role::Admin, AuthMethod::Password);
    admin.password_hash = Some(hash.clone());
    users.insert_user(admin);

    let mut member = user(MEMBER_ID, MEMBER_EMAIL, Role::Member, AuthMethod::Password);
    member.password_hash = Some(hash);
    users.insert_user(member);

    let mut oauth = user(OAUTH_USER_ID, OAUTH_EMAIL, Role::Member, AuthMethod::OAuth);
    oauth.oauth_provider = Some("google".to_string());
    oauth.oauth_provider_id = Some(OAUTH_SUBJECT.to_string());
    users.insert_user(oauth);
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub store: Arc<InMemoryTokenStore>,
    pub users: Arc<InMemoryUserDirectory>,
    pub ephemeral: Arc<InMemoryEphemeralStore>,
}

pub struct TestResponse {
    pub status: StatusCode,
    pub location: Option<String>,
    pub body: Value,
}

impl TestApp {
    pub async fn spawn() -> Self {
        let store = Arc::new(InMemoryTokenStore::new());
        Self::build(store.clone(), store, default_providers()).await
    }

    /// Same app, but every token store call goes through `store`.
    pub async fn with_store(store: Arc<dyn TokenStore>, inner: Arc<InMemoryTokenStore>) -> Self {
        Self::build(store, inner, default_providers()).await
    }

    pub async fn with_providers(providers: HashMap<ProviderKind, Arc<dyn OAuthProvider>>) -> Self {
        let store = Arc::new(InMemoryTokenStore::new());
        Self::build(store.clone(), store, providers).await
    }

    async fn build(
        store: Arc<dyn TokenStore>,
        inner: Arc<InMemoryTokenStore>,
        providers: HashMap<ProviderKind, Arc<dyn OAuthProvider>>,
    ) -> Self {
        let users = Arc::new(InMemoryUserDirectory::new());
        seed_users(&users);
        let ephemeral = Arc::new(InMemoryEphemeralStore::new());

        let backends = Backends {
            store,
            users: users.clone(),
            ephemeral: ephemeral.clone(),
            providers,
        };
        let metrics = Metrics::new().expect("metrics registry");
        let state = AppState::new(test_config(), backends, metrics).expect("app state");
        let router = build_router(state.clone()).await.expect("router");

        Self {
            router,
            state,
            store: inner,
            users,
            ephemeral,
        }
    }

    pub async fn send(
        &self,
        method: Method,
        uri: &str,
        bearer: Option<&str>,
        body: Option<Value>,
    ) -> TestResponse {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let location = response
            .headers()
            .get(header::LOCATION)
            .map(|v| v.to_str().unwrap().to_string());
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };

        TestResponse {
            status,
            location,
            body,
        }
    }

    pub async fn get(&self, uri: &str, bearer: Option<&str>) -> TestResponse {
        self.send(Method::GET, uri, bearer, None).await
    }

    pub async fn post(&self, uri: &str, bearer: Option<&str>, body: Value) -> TestResponse {
        self.send(Method::POST, uri, bearer, Some(body)).await
    }

    pub async fn tokens_for(&self, user_id: &str) -> TokenPair {
        self.state
            .token_service
            .generate_tokens_for_user(user_id)
            .await
            .expect("issue tokens")
    }

    pub async fn admin_token(&self) -> String {
        self.tokens_for(ADMIN_ID).await.access_token
    }

    pub async fn audit_types(&self) -> Vec<String> {
        self.store
            .audit_events()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }
}

/// Splits `…/auth/callback?session=<id>&type=<kind>` into `(id, kind)`.
pub fn callback_session(location: &str) -> (String, String) {
    let query = location
        .strip_prefix(&format!("{}/auth/callback?", FRONTEND_URL))
        .unwrap_or_else(|| panic!("unexpected redirect: {}", location));
    let mut session = None;
    let mut kind = None;
    for pair in query.split('&') {
        match pair.split_once('=') {
            Some(("session", v)) => session = Some(v.to_string()),
            Some(("type", v)) => kind = Some(v.to_string()),
            _ => {}
        }
    }
    (session.unwrap(), kind.unwrap())
}

pub fn error_redirect(code: &str) -> String {
    format!("{}/auth/error?error={}", FRONTEND_URL, code)
}

/// Extracts the `state` parameter from a provider authorization URL.
pub fn state_param(authorize_url: &str) -> String {
    authorize_url
        .split(['?', '&'])
        .find_map(|pair| pair.strip_prefix("state="))
        .map(str::to_string)
        .unwrap()
}

const UP: u8 = 0;
const DOWN: u8 = 1;
const SLOW: u8 = 2;

/// Token store that can be switched into an outage or a stall for the read
/// paths validation depends on. Writes always pass through.
pub struct FaultyStore {
    inner: Arc<InMemoryTokenStore>,
    mode: AtomicU8,
}

impl FaultyStore {
    pub fn new(inner: Arc<InMemoryTokenStore>) -> Self {
        Self {
            inner,
            mode: AtomicU8::new(UP),
        }
    }

    pub fn go_down(&self) {
        self.mode.store(DOWN, Ordering::SeqCst);
    }

    pub fn stall(&self) {
        self.mode.store(SLOW, Ordering::SeqCst);
    }

    pub fn recover(&self) {
        self.mode.store(UP, Ordering::SeqCst);
    }

    async fn gate(&self) -> Result<(), StoreError> {
        match self.mode.load(Ordering::SeqCst) {
            DOWN => Err(StoreError::Unavailable(anyhow::anyhow!("connection refused"))),
            SLOW => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl TokenStore for FaultyStore {
    async fn record_issued_token(&self, token: &IssuedToken) -> Result<(), StoreError> {
        self.inner.record_issued_token(token).await
    }
    async fn find_issued_token(&self, jti: &str) -> Result<Option<IssuedToken>, StoreError> {
        self.inner.find_issued_token(jti).await
    }
    async fn insert_blacklist_entry(&self, entry: &BlacklistedToken) -> Result<bool, StoreError> {
        self.inner.insert_blacklist_entry(entry).await
    }
    async fn find_blacklist_entry(
        &self,
        jti: &str,
    ) -> Result<Option<BlacklistedToken>, StoreError> {
        self.gate().await?;
        self.inner.find_blacklist_entry(jti).await
    }
    async fn is_blacklisted(&self, jti: &str) -> Result<bool, StoreError> {
        self.gate().await?;
        self.inner.is_blacklisted(jti).await
    }
    async fn list_blacklist(
        &self,
        filter: &BlacklistFilter,
        page: PageRequest,
    ) -> Result<Page<BlacklistedToken>, StoreError> {
        self.inner.list_blacklist(filter, page).await
    }
    async fn count_blacklisted(&self) -> Result<i64, StoreError> {
        self.inner.count_blacklisted().await
    }
    async fn blacklist_stats(
        &self,
        now: DateTime<Utc>,
        day_start: DateTime<Utc>,
    ) -> Result<BlacklistStats, StoreError> {
        self.inner.blacklist_stats(now, day_start).await
    }
    async fn advance_boundary(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
        reason: &str,
    ) -> Result<DateTime<Utc>, StoreError> {
        self.inner.advance_boundary(user_id, at, reason).await
    }
    async fn get_boundary(&self, user_id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.gate().await?;
        self.inner.get_boundary(user_id).await
    }
    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        self.inner.create_session(session).await
    }
    async fn get_session(&self, session_id: Uuid) -> Result<Option<Session>, StoreError> {
        self.gate().await?;
        self.inner.get_session(session_id).await
    }
    async fn rotate_session_refresh(
        &self,
        session_id: Uuid,
        expected_jti: &str,
        new_jti: &str,
    ) -> Result<bool, StoreError> {
        self.inner
            .rotate_session_refresh(session_id, expected_jti, new_jti)
            .await
    }
    async fn revoke_session(
        &self,
        session_id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Session>, StoreError> {
        self.inner.revoke_session(session_id, reason, at).await
    }
    async fn revoke_user_sessions(
        &self,
        user_id: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<Session>, StoreError> {
        self.inner.revoke_user_sessions(user_id, reason, at).await
    }
    async fn prune_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.inner.prune_expired(now).await
    }
    async fn record_audit_event(&self, event: &AuditEvent) -> Result<(), StoreError> {
        self.inner.record_audit_event(event).await
    }
    async fn health_check(&self) -> Result<(), StoreError> {
        match self.mode.load(Ordering::SeqCst) {
            DOWN => Err(StoreError::Unavailable(anyhow::anyhow!("connection refused"))),
            _ => Ok(()),
        }
    }
}
