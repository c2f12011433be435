use service_core::axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts},
    middleware::Next,
    response::Response,
};
use service_core::error::AppError;

use crate::models::Role;
use crate::services::AuthContext;
use crate::AppState;

fn bearer_token(req: &Request) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Requires a valid access token and stores its `AuthContext` in the
/// request extensions. Every rejection is the same 401.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer_token(&req).ok_or_else(|| {
        AppError::Unauthorized(anyhow::anyhow!("Missing or invalid Authorization header"))
    })?;

    let ctx = state.token_service.validate_auth_token(token).await?;

    req.extensions_mut().insert(ctx);
    Ok(next.run(req).await)
}

/// Layered inside `auth_middleware`: the caller must hold the admin role.
pub async fn require_admin(req: Request, next: Next) -> Result<Response, AppError> {
    let role = req.extensions().get::<AuthContext>().map(|ctx| ctx.role);

    match role {
        Some(Role::Admin) => Ok(next.run(req).await),
        Some(_) => {
            tracing::warn!("Non-admin caller rejected from admin route");
            Err(AppError::Forbidden(anyhow::anyhow!(
                "Administrator role required"
            )))
        }
        None => Err(AppError::Unauthorized(anyhow::anyhow!(
            "Invalid or expired token"
        ))),
    }
}

/// Authenticated caller, as established by `auth_middleware`.
pub struct AuthUser(pub AuthContext);

#[service_core::axum::async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .map(AuthUser)
            .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Invalid or expired token")))
    }
}
