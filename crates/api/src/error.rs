//! API error type

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use revisume_billing::BillingError;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("Invalid email or password")]
    InvalidCredentials,
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    ServiceUnavailable(String),
    #[error(transparent)]
    Billing(#[from] BillingError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Billing(e) => {
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Server-side details stay in the logs
        let message = if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "Request failed");
            match status {
                StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY => self.to_string(),
                _ => "Internal server error".to_string(),
            }
        } else {
            self.to_string()
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revisume_billing::StoreError;

    #[test]
    fn test_billing_errors_keep_their_status() {
        let dup = ApiError::from(BillingError::Store(StoreError::DuplicateKey(
            "users_email_key".into(),
        )));
        assert_eq!(dup.status_code(), StatusCode::CONFLICT);

        let sig = ApiError::from(BillingError::WebhookSignatureInvalid);
        assert_eq!(sig.status_code(), StatusCode::BAD_REQUEST);

        let db = ApiError::from(BillingError::Store(StoreError::Database("down".into())));
        assert_eq!(db.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
