use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Configuration error: {0} is not set")]
    Configuration(&'static str),

    #[error("Unauthorized: {0}")]
    Unauthorized(&'static str),

    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Invalid shop domain: {0}")]
    InvalidShop(String),

    #[error("Token exchange failed with status {status}: {message}")]
    TokenExchange { status: u16, message: String },

    #[error("Token exchange response did not contain an access token")]
    MissingAccessToken,

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Request body too large")]
    PayloadTooLarge,

    #[error("Resource not found")]
    NotFound,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Configuration(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Server is not configured")
            }
            AppError::Unauthorized(reason) => (StatusCode::UNAUTHORIZED, reason),
            AppError::MissingParameter(_) => {
                (StatusCode::BAD_REQUEST, "Missing required parameter")
            }
            AppError::InvalidShop(_) => (StatusCode::BAD_REQUEST, "Invalid shop domain"),
            AppError::TokenExchange { .. } => (StatusCode::BAD_GATEWAY, "Token exchange failed"),
            AppError::MissingAccessToken => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "No access token received",
            ),
            AppError::Http(_) => (StatusCode::BAD_GATEWAY, "Upstream request failed"),
            AppError::PayloadTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large"),
            AppError::NotFound => (StatusCode::NOT_FOUND, "Resource not found"),
        };

        tracing::warn!("Error occurred: {}", self);

        let body = Json(json!({
            "error": error_message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}
