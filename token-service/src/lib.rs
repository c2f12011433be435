pub mod config;
pub mod db;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod utils;

use service_core::axum::{
    extract::State,
    http::{header, HeaderValue, Method},
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Json, Router,
};
use service_core::error::AppError;
use service_core::middleware::{
    rate_limit::{create_ip_rate_limiter, ip_rate_limit_middleware, IpRateLimiter},
    security_headers::security_headers_middleware,
    tracing::request_id_middleware,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

use crate::config::{Environment, TokenServiceConfig};
use crate::models::{ProviderKind, TokenType};
use crate::services::{
    AuditService, BlacklistEngine, EphemeralStore, JwtService, Metrics, OAuthLinker,
    OAuthProvider, OAuthTtls, RetryPolicy, TokenService, TokenStore, UserDirectory,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check,
        handlers::admin_tokens::revoke_token,
        handlers::admin_tokens::revoke_user_tokens,
        handlers::admin_tokens::list_blacklisted_tokens,
        handlers::admin_tokens::token_stats,
        handlers::auth::login,
        handlers::auth::refresh,
        handlers::auth::logout,
        handlers::auth::logout_all,
        handlers::auth::change_password,
        handlers::auth::me,
        handlers::auth::introspect,
        handlers::oauth::oauth_initiate,
        handlers::oauth::oauth_callback,
        handlers::oauth::oauth_exchange,
        handlers::oauth::oauth_signup,
    ),
    components(
        schemas(
            dtos::ErrorResponse,
            dtos::MessageResponse,
            dtos::admin::RevokeTokenRequest,
            dtos::admin::RevokeTokenResponse,
            dtos::admin::RevokeUserTokensRequest,
            dtos::admin::RevokeUserTokensResponse,
            dtos::auth::LoginRequest,
            dtos::auth::RefreshRequest,
            dtos::auth::ChangePasswordRequest,
            dtos::auth::IntrospectRequest,
            dtos::auth::OAuthExchangeRequest,
            dtos::auth::OAuthSignupRequest,
            dtos::auth::LogoutAllResponse,
            models::BlacklistedToken,
            models::BlacklistPage,
            models::BlacklistStats,
            models::Role,
            models::TokenType,
            services::TokenPair,
            services::AuthContext,
            services::Introspection,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Admin", description = "Token revocation and blacklist inspection"),
        (name = "Authentication", description = "Session tokens: login, refresh, logout"),
        (name = "OAuth", description = "Sign-in through external identity providers"),
        (name = "Observability", description = "Service health and monitoring"),
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

/// Storage and identity collaborators. Postgres/Redis in production,
/// in-memory implementations in tests.
pub struct Backends {
    pub store: Arc<dyn TokenStore>,
    pub users: Arc<dyn UserDirectory>,
    pub ephemeral: Arc<dyn EphemeralStore>,
    pub providers: HashMap<ProviderKind, Arc<dyn OAuthProvider>>,
}

#[derive(Clone)]
pub struct AppState {
    pub config: TokenServiceConfig,
    pub metrics: Metrics,
    pub blacklist: BlacklistEngine,
    pub token_service: TokenService,
    pub oauth: OAuthLinker,
    pub store: Arc<dyn TokenStore>,
    pub ephemeral: Arc<dyn EphemeralStore>,
    pub login_rate_limiter: IpRateLimiter,
}

impl AppState {
    pub fn new(
        config: TokenServiceConfig,
        backends: Backends,
        metrics: Metrics,
    ) -> Result<Self, anyhow::Error> {
        let Backends {
            store,
            users,
            ephemeral,
            providers,
        } = backends;

        let jwt = JwtService::new(&config.jwt)?;
        let audit = AuditService::new(store.clone());

        let retry = RetryPolicy {
            max_elapsed: Duration::from_millis(config.maintenance.store_retry_max_elapsed_ms),
            ..RetryPolicy::default()
        };
        let blacklist = BlacklistEngine::new(
            store.clone(),
            audit.clone(),
            metrics.clone(),
            jwt.ttl(TokenType::Refresh),
            retry,
        );

        let token_service = TokenService::new(
            jwt,
            store.clone(),
            users.clone(),
            blacklist.clone(),
            audit.clone(),
            metrics.clone(),
            Duration::from_millis(config.security.validation_timeout_ms),
        );

        let oauth = OAuthLinker::new(
            providers,
            ephemeral.clone(),
            users,
            token_service.clone(),
            audit,
            metrics.clone(),
            &config.oauth.frontend_url,
            OAuthTtls {
                state_seconds: config.oauth.state_ttl_seconds,
                session_seconds: config.oauth.session_ttl_seconds,
                login_grant_seconds: config.oauth.login_grant_ttl_seconds,
            },
        );

        let login_rate_limiter = create_ip_rate_limiter(
            config.rate_limit.login_attempts,
            config.rate_limit.login_window_seconds,
        );

        Ok(Self {
            config,
            metrics,
            blacklist,
            token_service,
            oauth,
            store,
            ephemeral,
            login_rate_limiter,
        })
    }
}

pub async fn build_router(state: AppState) -> Result<Router, AppError> {
    let admin_routes = Router::new()
        .route(
            "/admin/tokens/revoke",
            post(handlers::admin_tokens::revoke_token),
        )
        .route(
            "/admin/users/:user_id/tokens/revoke",
            post(handlers::admin_tokens::revoke_user_tokens),
        )
        .route(
            "/admin/tokens/blacklisted",
            get(handlers::admin_tokens::list_blacklisted_tokens),
        )
        .route("/admin/tokens/stats", get(handlers::admin_tokens::token_stats))
        .layer(from_fn(middleware::require_admin))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ));

    let session_routes = Router::new()
        .route("/auth/logout", post(handlers::auth::logout))
        .route("/auth/logout-all", post(handlers::auth::logout_all))
        .route("/auth/password", post(handlers::auth::change_password))
        .route("/auth/me", get(handlers::auth::me))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ));

    let login_route = Router::new()
        .route("/auth/login", post(handlers::auth::login))
        .layer(from_fn_with_state(
            state.login_rate_limiter.clone(),
            ip_rate_limit_middleware,
        ));

    let mut app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(handlers::metrics::metrics));

    if state.config.environment == Environment::Dev {
        app = app.merge(SwaggerUi::new("/docs").url("/.well-known/openapi.json", ApiDoc::openapi()));
    } else {
        app = app.route(
            "/.well-known/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        );
    }

    let allowed_origins = state
        .config
        .security
        .allowed_origins
        .iter()
        .map(|o| {
            o.parse::<HeaderValue>().map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!("Invalid CORS origin '{}': {}", o, e))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let app = app
        .route("/auth/refresh", post(handlers::auth::refresh))
        .route("/auth/introspect", post(handlers::auth::introspect))
        .route("/auth/oauth/exchange", post(handlers::oauth::oauth_exchange))
        .route("/auth/oauth/signup", post(handlers::oauth::oauth_signup))
        .route("/auth/:provider", get(handlers::oauth::oauth_initiate))
        .route(
            "/auth/:provider/callback",
            get(handlers::oauth::oauth_callback),
        )
        .merge(login_route)
        .merge(session_routes)
        .merge(admin_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &service_core::axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    path = %request.uri().path(),
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(allowed_origins)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]),
        );

    Ok(app)
}

/// Service health check
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy"),
        (status = 503, description = "Token store or ephemeral store unreachable")
    ),
    tag = "Observability"
)]
pub async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Err(e) = state.store.health_check().await {
        tracing::error!(error = %e, "Token store health check failed");
        return Err(AppError::ServiceUnavailable);
    }
    if let Err(e) = state.ephemeral.health_check().await {
        tracing::error!(error = %e, "Ephemeral store health check failed");
        return Err(AppError::ServiceUnavailable);
    }

    Ok(Json(serde_json::json!({
        "status": "healthy",
        "service": state.config.service_name,
        "version": state.config.service_version,
    })))
}
