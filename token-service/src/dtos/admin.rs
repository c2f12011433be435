use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use validator::{Validate, ValidationError};

use crate::models::{is_well_formed_jti, RevocationReason};

fn validate_jti(jti: &str) -> Result<(), ValidationError> {
    if is_well_formed_jti(jti) {
        Ok(())
    } else {
        Err(ValidationError::new("jti").with_message("Malformed token identifier".into()))
    }
}

fn validate_reason(reason: &str) -> Result<(), ValidationError> {
    reason
        .parse::<RevocationReason>()
        .map(|_| ())
        .map_err(|e| ValidationError::new("reason").with_message(e.to_string().into()))
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct RevokeTokenRequest {
    #[validate(custom(function = "validate_jti"))]
    #[schema(example = "01K4FHGHT3XX9WFM293QPZ5G9V")]
    pub jti: String,

    #[validate(custom(function = "validate_reason"))]
    #[schema(example = "security_incident")]
    pub reason: String,
}

impl RevokeTokenRequest {
    /// Only call after `validate()`.
    pub fn parsed_reason(&self) -> Result<RevocationReason, crate::models::InvalidReason> {
        self.reason.parse()
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RevokeTokenResponse {
    #[schema(example = "01K4FHGHT3XX9WFM293QPZ5G9V")]
    pub jti: String,
    #[schema(example = "security_incident")]
    pub reason: String,
    pub revoked_at: DateTime<Utc>,
    #[schema(example = "Token revoked")]
    pub message: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct RevokeUserTokensRequest {
    #[validate(custom(function = "validate_reason"))]
    #[schema(example = "password_change")]
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RevokeUserTokensResponse {
    #[schema(example = "01K4ADMIN000000000000000")]
    pub user_id: String,
    #[schema(example = "password_change")]
    pub reason: String,
    /// Tokens issued before this instant are rejected.
    pub tokens_valid_since: DateTime<Utc>,
    #[schema(example = "All user tokens revoked")]
    pub message: String,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct BlacklistQuery {
    /// Owner to filter by
    pub user_id: Option<String>,
    /// Revocation reason to filter by
    #[param(example = "security_incident")]
    pub reason: Option<String>,
    /// Page size, 1 to 200 (default 50)
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}
