use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::auth::AuthError;

/// Structured JSON error response for API errors
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// API error types that map to HTTP status codes
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized: {0}")]
    Unauthorized(#[from] AuthError),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_response) = match &self {
            ApiError::Unauthorized(auth_err) => {
                tracing::warn!(error = %auth_err, "Rejected credential");
                (
                    StatusCode::UNAUTHORIZED,
                    ErrorResponse::with_details("Unauthorized", auth_err.to_string()),
                )
            }
            ApiError::Forbidden(msg) => {
                tracing::warn!(message = %msg, "Forbidden");
                (
                    StatusCode::FORBIDDEN,
                    ErrorResponse::with_details("Forbidden", msg.clone()),
                )
            }
            ApiError::BadRequest(msg) => {
                tracing::warn!(message = %msg, "Bad request");
                (
                    StatusCode::BAD_REQUEST,
                    ErrorResponse::with_details("Bad request", msg.clone()),
                )
            }
            ApiError::Internal(msg) => {
                tracing::error!(message = %msg, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::new("Internal server error"),
                )
            }
        };

        (status, Json(error_response)).into_response()
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn extract_response(response: Response) -> (StatusCode, ErrorResponse) {
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let error_response: ErrorResponse = serde_json::from_slice(&body).unwrap();
        (status, error_response)
    }

    #[tokio::test]
    async fn test_expired_credential_returns_401() {
        let response = ApiError::from(AuthError::Expired).into_response();
        let (status, body) = extract_response(response).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body.error, "Unauthorized");
        assert_eq!(body.details.as_deref(), Some("credential expired"));
    }

    #[tokio::test]
    async fn test_bad_request_returns_400() {
        let response = ApiError::BadRequest("uid must be an integer".into()).into_response();
        let (status, body) = extract_response(response).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.details.unwrap().contains("uid"));
    }

    #[tokio::test]
    async fn test_forbidden_returns_403() {
        let response = ApiError::Forbidden("push API disabled".into()).into_response();
        let (status, _) = extract_response(response).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_internal_error_hides_details() {
        let response = ApiError::Internal("secret stack".into()).into_response();
        let (status, body) = extract_response(response).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error, "Internal server error");
        assert!(body.details.is_none());
    }

    #[test]
    fn test_error_response_skips_empty_details() {
        let json = serde_json::to_string(&ErrorResponse::new("x")).unwrap();
        assert_eq!(json, r#"{"error":"x"}"#);
    }
}
