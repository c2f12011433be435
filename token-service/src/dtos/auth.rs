use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use validator::Validate;

#[derive(Deserialize, Validate, ToSchema)]
pub struct LoginRequest {
    #[validate(email(message = "Invalid email format"))]
    #[schema(example = "user@example.com")]
    pub email: String,

    #[validate(length(min = 1, message = "Password is required"))]
    #[schema(example = "password123")]
    pub password: String,
}

#[derive(Deserialize, Validate, ToSchema)]
pub struct RefreshRequest {
    #[validate(length(min = 1, message = "Refresh token is required"))]
    pub refresh_token: String,
}

#[derive(Deserialize, Validate, ToSchema)]
pub struct ChangePasswordRequest {
    #[validate(length(min = 1, message = "Current password is required"))]
    pub current_password: String,

    #[validate(length(
        min = 8,
        max = 128,
        message = "New password must be between 8 and 128 characters"
    ))]
    #[schema(min_length = 8, max_length = 128)]
    pub new_password: String,
}

#[derive(Deserialize, Validate, ToSchema)]
pub struct IntrospectRequest {
    #[validate(length(min = 1, message = "Token is required"))]
    pub token: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct OAuthExchangeRequest {
    /// One-time id from the login redirect
    #[validate(length(min = 1, max = 256, message = "Invalid session id"))]
    pub session_id: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct OAuthSignupRequest {
    /// One-time id from the signup redirect
    #[validate(length(min = 1, max = 256, message = "Invalid session id"))]
    pub session_id: String,

    #[validate(length(max = 100, message = "First name is too long"))]
    #[schema(example = "Ada")]
    pub first_name: Option<String>,

    #[validate(length(max = 100, message = "Last name is too long"))]
    #[schema(example = "Lovelace")]
    pub last_name: Option<String>,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct OAuthInitiateQuery {
    /// Invitation to redeem if this sign-in creates an account
    pub invitation_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LogoutAllResponse {
    pub tokens_valid_since: DateTime<Utc>,
    #[schema(example = "Logged out from all sessions")]
    pub message: String,
}
