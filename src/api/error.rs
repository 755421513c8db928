//! API error type mapped to HTTP status codes and a JSON body.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed request (400)
    #[error("Bad request: {message}")]
    BadRequest { message: String },

    /// The requested game was not loaded at startup (503)
    #[error("Game not configured: {game}")]
    NotConfigured { game: &'static str },

    /// Inference rejected the input (422)
    #[error("Game error: {0:#}")]
    Game(#[from] anyhow::Error),

    /// Internal server error (500)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::NotConfigured { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Game(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => "BAD_REQUEST",
            Self::NotConfigured { .. } => "NOT_CONFIGURED",
            Self::Game(_) => "GAME_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match &self {
            ApiError::Internal { .. } => tracing::error!(error = %self, "API error"),
            _ => tracing::warn!(error = %self, "API error"),
        }

        let body = ErrorResponse {
            code: self.error_code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            ApiError::bad_request("x").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::NotConfigured { game: "digit" }.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::from(anyhow::anyhow!("no such word")).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ApiError::internal("boom").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_codes_and_messages() {
        let err = ApiError::NotConfigured { game: "steer" };
        assert_eq!(err.error_code(), "NOT_CONFIGURED");
        assert_eq!(err.to_string(), "Game not configured: steer");

        let err = ApiError::from(anyhow::anyhow!("inner").context("outer"));
        assert_eq!(err.to_string(), "Game error: outer: inner");
    }

    #[test]
    fn test_into_response_status() {
        let response = ApiError::bad_request("empty word").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
