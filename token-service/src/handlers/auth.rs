use service_core::axum::{extract::State, Json};
use service_core::error::AppError;

use crate::dtos::auth::{
    ChangePasswordRequest, IntrospectRequest, LoginRequest, LogoutAllResponse, RefreshRequest,
};
use crate::dtos::MessageResponse;
use crate::middleware::AuthUser;
use crate::services::{AuthContext, Introspection, TokenPair};
use crate::utils::{Password, ValidatedJson};
use crate::AppState;

/// Login with email and password
#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = TokenPair),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 401, description = "Invalid credentials", body = ErrorResponse),
        (status = 429, description = "Too many attempts", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
#[tracing::instrument(skip_all)]
pub async fn login(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<LoginRequest>,
) -> Result<Json<TokenPair>, AppError> {
    let pair = state
        .token_service
        .login_with_password(&req.email, Password::new(req.password))
        .await?;
    Ok(Json(pair))
}

/// Exchange a refresh token for a new pair
#[utoipa::path(
    post,
    path = "/auth/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Tokens rotated", body = TokenPair),
        (status = 401, description = "Invalid, expired or revoked refresh token", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
#[tracing::instrument(skip_all)]
pub async fn refresh(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<RefreshRequest>,
) -> Result<Json<TokenPair>, AppError> {
    let pair = state.token_service.refresh_token(&req.refresh_token).await?;
    Ok(Json(pair))
}

/// End the current session
#[utoipa::path(
    post,
    path = "/auth/logout",
    responses(
        (status = 200, description = "Logged out", body = MessageResponse),
        (status = 401, description = "Invalid token", body = ErrorResponse)
    ),
    tag = "Authentication",
    security(("bearer_auth" = []))
)]
#[tracing::instrument(skip_all, fields(user_id = %user.0.user_id))]
pub async fn logout(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<MessageResponse>, AppError> {
    state.token_service.logout(&user.0).await?;
    Ok(Json(MessageResponse::new("Logged out successfully")))
}

/// End every session of the caller
#[utoipa::path(
    post,
    path = "/auth/logout-all",
    responses(
        (status = 200, description = "All sessions ended", body = LogoutAllResponse),
        (status = 401, description = "Invalid token", body = ErrorResponse)
    ),
    tag = "Authentication",
    security(("bearer_auth" = []))
)]
#[tracing::instrument(skip_all, fields(user_id = %user.0.user_id))]
pub async fn logout_all(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<LogoutAllResponse>, AppError> {
    let tokens_valid_since = state.token_service.logout_all(&user.0).await?;
    Ok(Json(LogoutAllResponse {
        tokens_valid_since,
        message: "Logged out from all sessions".to_string(),
    }))
}

/// Change the caller's password
#[utoipa::path(
    post,
    path = "/auth/password",
    request_body = ChangePasswordRequest,
    responses(
        (status = 200, description = "Password changed; every earlier token is revoked", body = TokenPair),
        (status = 400, description = "Invalid request or not a password account", body = ErrorResponse),
        (status = 401, description = "Invalid token or wrong current password", body = ErrorResponse)
    ),
    tag = "Authentication",
    security(("bearer_auth" = []))
)]
#[tracing::instrument(skip_all, fields(user_id = %user.0.user_id))]
pub async fn change_password(
    State(state): State<AppState>,
    user: AuthUser,
    ValidatedJson(req): ValidatedJson<ChangePasswordRequest>,
) -> Result<Json<TokenPair>, AppError> {
    let pair = state
        .token_service
        .change_password(
            &user.0,
            Password::new(req.current_password),
            Password::new(req.new_password),
        )
        .await?;
    Ok(Json(pair))
}

/// The identity behind the presented access token
#[utoipa::path(
    get,
    path = "/auth/me",
    responses(
        (status = 200, description = "Authenticated context", body = AuthContext),
        (status = 401, description = "Invalid token", body = ErrorResponse)
    ),
    tag = "Authentication",
    security(("bearer_auth" = []))
)]
pub async fn me(user: AuthUser) -> Json<AuthContext> {
    Json(user.0)
}

/// Report whether a token is currently accepted
#[utoipa::path(
    post,
    path = "/auth/introspect",
    request_body = IntrospectRequest,
    responses(
        (status = 200, description = "Token status", body = Introspection)
    ),
    tag = "Authentication"
)]
#[tracing::instrument(skip_all)]
pub async fn introspect(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<IntrospectRequest>,
) -> Json<Introspection> {
    Json(state.token_service.introspect(&req.token).await)
}
