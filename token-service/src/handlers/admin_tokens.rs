//! Administrative revocation endpoints. Mounted behind `auth_middleware`
//! and `require_admin`.

use service_core::axum::{
    extract::{Path, Query, State},
    Json,
};
use service_core::error::AppError;

use crate::dtos::admin::{
    BlacklistQuery, RevokeTokenRequest, RevokeTokenResponse, RevokeUserTokensRequest,
    RevokeUserTokensResponse,
};
use crate::middleware::AuthUser;
use crate::models::{BlacklistFilter, BlacklistPage, BlacklistStats, PageRequest, RevocationReason};
use crate::utils::ValidatedJson;
use crate::AppState;

const MAX_USER_ID_LEN: usize = 128;

fn parse_reason(raw: &str) -> Result<RevocationReason, AppError> {
    raw.parse()
        .map_err(|e: crate::models::InvalidReason| AppError::BadRequest(anyhow::anyhow!(e)))
}

/// Revoke a single token by JTI
#[utoipa::path(
    post,
    path = "/admin/tokens/revoke",
    request_body = RevokeTokenRequest,
    responses(
        (status = 200, description = "Token revoked", body = RevokeTokenResponse),
        (status = 400, description = "Invalid request or token already revoked", body = ErrorResponse),
        (status = 401, description = "Missing or invalid token", body = ErrorResponse),
        (status = 403, description = "Caller is not an administrator", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "Admin",
    security(("bearer_auth" = []))
)]
#[tracing::instrument(skip(state, admin, req), fields(admin_id = %admin.0.user_id, jti = %req.jti))]
pub async fn revoke_token(
    State(state): State<AppState>,
    admin: AuthUser,
    ValidatedJson(req): ValidatedJson<RevokeTokenRequest>,
) -> Result<Json<RevokeTokenResponse>, AppError> {
    let reason = req
        .parsed_reason()
        .map_err(|e| AppError::BadRequest(anyhow::anyhow!(e)))?;

    let entry = state
        .blacklist
        .revoke_token(&req.jti, &admin.0.user_id, reason)
        .await?;

    Ok(Json(RevokeTokenResponse {
        jti: entry.jti,
        reason: entry.reason.as_str().to_string(),
        revoked_at: entry.revoked_at,
        message: "Token revoked".to_string(),
    }))
}

/// Revoke every token a user currently holds
#[utoipa::path(
    post,
    path = "/admin/users/{user_id}/tokens/revoke",
    params(("user_id" = String, Path, description = "User whose tokens are revoked")),
    request_body = RevokeUserTokensRequest,
    responses(
        (status = 200, description = "Tokens revoked", body = RevokeUserTokensResponse),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 401, description = "Missing or invalid token", body = ErrorResponse),
        (status = 403, description = "Caller is not an administrator", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "Admin",
    security(("bearer_auth" = []))
)]
#[tracing::instrument(skip(state, admin, req), fields(admin_id = %admin.0.user_id))]
pub async fn revoke_user_tokens(
    State(state): State<AppState>,
    admin: AuthUser,
    Path(user_id): Path<String>,
    ValidatedJson(req): ValidatedJson<RevokeUserTokensRequest>,
) -> Result<Json<RevokeUserTokensResponse>, AppError> {
    if user_id.is_empty() || user_id.len() > MAX_USER_ID_LEN {
        return Err(AppError::BadRequest(anyhow::anyhow!("Invalid user id")));
    }
    let reason = parse_reason(&req.reason)?;

    let tokens_valid_since = state
        .blacklist
        .revoke_all_user_tokens(&user_id, &admin.0.user_id, reason.clone())
        .await?;

    Ok(Json(RevokeUserTokensResponse {
        user_id,
        reason: reason.as_str().to_string(),
        tokens_valid_since,
        message: "All user tokens revoked".to_string(),
    }))
}

/// List blacklisted tokens by owner and/or reason
#[utoipa::path(
    get,
    path = "/admin/tokens/blacklisted",
    params(BlacklistQuery),
    responses(
        (status = 200, description = "Newest revocations first", body = BlacklistPage),
        (status = 400, description = "Neither user_id nor reason given", body = ErrorResponse),
        (status = 401, description = "Missing or invalid token", body = ErrorResponse),
        (status = 403, description = "Caller is not an administrator", body = ErrorResponse)
    ),
    tag = "Admin",
    security(("bearer_auth" = []))
)]
#[tracing::instrument(skip(state, _admin))]
pub async fn list_blacklisted_tokens(
    State(state): State<AppState>,
    _admin: AuthUser,
    Query(query): Query<BlacklistQuery>,
) -> Result<Json<BlacklistPage>, AppError> {
    let user_id = query.user_id.filter(|u| !u.is_empty());
    let reason = query
        .reason
        .filter(|r| !r.is_empty())
        .map(|r| parse_reason(&r))
        .transpose()?;

    if user_id.is_none() && reason.is_none() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Either user_id or reason must be provided"
        )));
    }

    let page = PageRequest::clamped(query.limit, query.offset);
    let result = match (user_id, reason) {
        (Some(user_id), None) => state.blacklist.get_user_blacklisted_tokens(&user_id, page).await?,
        (None, Some(reason)) => state.blacklist.get_tokens_by_reason(reason, page).await?,
        (user_id, reason) => {
            state
                .blacklist
                .list(BlacklistFilter { user_id, reason }, page)
                .await?
        }
    };

    Ok(Json(result))
}

/// Blacklist statistics
#[utoipa::path(
    get,
    path = "/admin/tokens/stats",
    responses(
        (status = 200, description = "Blacklist counts", body = BlacklistStats),
        (status = 401, description = "Missing or invalid token", body = ErrorResponse),
        (status = 403, description = "Caller is not an administrator", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "Admin",
    security(("bearer_auth" = []))
)]
pub async fn token_stats(
    State(state): State<AppState>,
    _admin: AuthUser,
) -> Result<Json<BlacklistStats>, AppError> {
    Ok(Json(state.blacklist.stats().await?))
}
