use service_core::error::AppError;
use thiserror::Error;

/// Failures of the persistence layer, classified by kind so callers can
/// decide what is retryable without looking at messages.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record already exists")]
    AlreadyExists,

    #[error("record not found")]
    NotFound,

    /// Transient: connection loss, pool exhaustion, timeouts.
    #[error("store unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),

    #[error("store error: {0}")]
    Backend(#[source] anyhow::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(ref db) if db.is_unique_violation() => StoreError::AlreadyExists,
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(anyhow::Error::new(err)),
            other => StoreError::Backend(anyhow::Error::new(other)),
        }
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
            StoreError::Unavailable(anyhow::Error::new(err))
        } else {
            StoreError::Backend(anyhow::Error::new(err))
        }
    }
}

/// Domain errors. Converted into HTTP errors by kind, never by message.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Token is already revoked")]
    AlreadyRevoked,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Token revoked")]
    TokenRevoked,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Invitation is invalid or has expired")]
    InvitationInvalid,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("JTI collision on issuance")]
    JtiCollision,

    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[source] anyhow::Error),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AlreadyExists => ServiceError::Conflict("Resource already exists".into()),
            StoreError::NotFound => ServiceError::NotFound("Resource not found".into()),
            StoreError::Unavailable(e) => ServiceError::StoreUnavailable(e),
            StoreError::Backend(e) => ServiceError::Internal(e),
        }
    }
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::AlreadyRevoked => {
                AppError::BadRequest(anyhow::anyhow!("Token is already revoked"))
            }
            // Which check rejected a token is never disclosed.
            ServiceError::InvalidToken | ServiceError::TokenExpired | ServiceError::TokenRevoked => {
                AppError::Unauthorized(anyhow::anyhow!("Invalid or expired token"))
            }
            ServiceError::InvalidCredentials => {
                AppError::AuthError(anyhow::anyhow!("Invalid credentials"))
            }
            ServiceError::NotFound(msg) => AppError::NotFound(anyhow::anyhow!(msg)),
            ServiceError::Conflict(msg) => AppError::Conflict(anyhow::anyhow!(msg)),
            ServiceError::InvitationInvalid => {
                AppError::Gone(anyhow::anyhow!("Invitation is invalid or has expired"))
            }
            ServiceError::Validation(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            ServiceError::JtiCollision => {
                AppError::InternalError(anyhow::anyhow!("JTI collision on issuance"))
            }
            ServiceError::StoreUnavailable(e) => AppError::DatabaseError(e),
            ServiceError::Internal(e) => AppError::InternalError(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use service_core::axum::http::StatusCode;

    #[test]
    fn maps_by_kind() {
        assert_eq!(
            AppError::from(ServiceError::AlreadyRevoked).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::from(ServiceError::TokenRevoked).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::from(ServiceError::InvitationInvalid).status_code(),
            StatusCode::GONE
        );
        assert_eq!(
            AppError::from(ServiceError::StoreUnavailable(anyhow::anyhow!("down"))).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn only_unavailable_is_transient() {
        assert!(StoreError::Unavailable(anyhow::anyhow!("x")).is_transient());
        assert!(!StoreError::AlreadyExists.is_transient());
        assert!(!StoreError::NotFound.is_transient());
        assert!(!StoreError::from(sqlx::Error::RowNotFound).is_transient());
        assert!(StoreError::from(sqlx::Error::PoolTimedOut).is_transient());
    }
}
