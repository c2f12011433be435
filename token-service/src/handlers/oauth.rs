use service_core::axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use service_core::error::AppError;

use crate::dtos::auth::{OAuthExchangeRequest, OAuthInitiateQuery, OAuthSignupRequest};
use crate::models::ProviderKind;
use crate::services::{CallbackParams, TokenPair};
use crate::utils::ValidatedJson;
use crate::AppState;

fn provider_from_path(raw: &str) -> Result<ProviderKind, AppError> {
    raw.parse()
        .map_err(|_| AppError::NotFound(anyhow::anyhow!("Unknown OAuth provider")))
}

fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

/// Start an OAuth sign-in
#[utoipa::path(
    get,
    path = "/auth/{provider}",
    params(
        ("provider" = String, Path, description = "google or github"),
        OAuthInitiateQuery
    ),
    responses(
        (status = 302, description = "Redirect to the provider"),
        (status = 404, description = "Unknown provider", body = ErrorResponse)
    ),
    tag = "OAuth"
)]
#[tracing::instrument(skip(state, query))]
pub async fn oauth_initiate(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<OAuthInitiateQuery>,
) -> Result<Response, AppError> {
    let kind = provider_from_path(&provider)?;
    let url = state.oauth.initiate(kind, query.invitation_token).await?;
    Ok(found(&url))
}

/// Provider redirect target
#[utoipa::path(
    get,
    path = "/auth/{provider}/callback",
    params(("provider" = String, Path, description = "google or github")),
    responses(
        (status = 302, description = "Redirect to the frontend with a one-time session id or an error code"),
        (status = 404, description = "Unknown provider", body = ErrorResponse)
    ),
    tag = "OAuth"
)]
#[tracing::instrument(skip(state, params))]
pub async fn oauth_callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(params): Query<CallbackParams>,
) -> Result<Response, AppError> {
    let kind = provider_from_path(&provider)?;
    let url = state.oauth.handle_callback(kind, params).await?;
    Ok(found(&url))
}

/// Redeem the tokens of a completed OAuth login
#[utoipa::path(
    post,
    path = "/auth/oauth/exchange",
    request_body = OAuthExchangeRequest,
    responses(
        (status = 200, description = "Token pair", body = TokenPair),
        (status = 400, description = "Unknown, used or expired session", body = ErrorResponse)
    ),
    tag = "OAuth"
)]
#[tracing::instrument(skip_all)]
pub async fn oauth_exchange(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<OAuthExchangeRequest>,
) -> Result<Json<TokenPair>, AppError> {
    let pair = state.oauth.redeem_login_grant(&req.session_id).await?;
    Ok(Json(pair))
}

/// Create the account for a pending OAuth signup
#[utoipa::path(
    post,
    path = "/auth/oauth/signup",
    request_body = OAuthSignupRequest,
    responses(
        (status = 201, description = "Account created and signed in", body = TokenPair),
        (status = 400, description = "Unknown, used or expired session", body = ErrorResponse),
        (status = 409, description = "An account with this email already exists", body = ErrorResponse),
        (status = 410, description = "Invitation is invalid or has expired", body = ErrorResponse)
    ),
    tag = "OAuth"
)]
#[tracing::instrument(skip_all)]
pub async fn oauth_signup(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<OAuthSignupRequest>,
) -> Result<(StatusCode, Json<TokenPair>), AppError> {
    let pair = state
        .oauth
        .complete_signup(&req.session_id, req.first_name, req.last_name)
        .await?;
    Ok((StatusCode::CREATED, Json(pair)))
}
