use service_core::axum::{
    extract::{FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::de::DeserializeOwned;
use validator::Validate;

use crate::dtos::ErrorResponse;

/// JSON body that has passed its `validator` rules. Both malformed JSON and
/// rule violations are rejected with 400.
pub struct ValidatedJson<T>(pub T);

#[service_core::axum::async_trait]
impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate + 'static,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await.map_err(|e| {
            reject(format!("Invalid request body: {}", e.body_text()))
        })?;

        value
            .validate()
            .map_err(|e| reject(format!("Validation error: {}", e)))?;

        Ok(ValidatedJson(value))
    }
}

fn reject(error: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse { error })).into_response()
}
