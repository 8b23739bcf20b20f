//! Error types for boardfed
//!
//! Every fallible operation in the crate returns `AppError`.
//! Only the HTTP layer turns it into a status code, through `IntoResponse`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Actor could not be resolved locally or remotely (404)
    #[error("Actor not found: {0}")]
    ActorNotFound(String),

    /// Authentication required (401)
    #[error("Authentication required")]
    Unauthorized,

    /// Access denied (403)
    #[error("Access denied")]
    Forbidden,

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unprocessable entity (422)
    #[error("Unprocessable entity: {0}")]
    Unprocessable(String),

    /// Client did not ask for an ActivityPub representation (406)
    #[error("Not acceptable: {0}")]
    NotAcceptable(String),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP client error (502)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Remote peer answered with an unexpected status (502)
    #[error("Non-success response from {url}: HTTP {status}")]
    NonSuccessStatus { url: String, status: u16 },

    /// Federation error (502)
    #[error("Federation error: {0}")]
    Federation(String),

    /// Signature verification failed (401)
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// Private key file missing for a local actor (500, operator action required)
    #[error("Private key missing at {path}")]
    MissingPrivateKey { path: String },

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Validation(format!("Malformed JSON: {}", err))
    }
}

impl AppError {
    /// Short label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound => "not_found",
            AppError::ActorNotFound(_) => "actor_not_found",
            AppError::Unauthorized => "unauthorized",
            AppError::Forbidden => "forbidden",
            AppError::Validation(_) => "validation",
            AppError::Unprocessable(_) => "unprocessable",
            AppError::NotAcceptable(_) => "not_acceptable",
            AppError::Database(_) => "database",
            AppError::HttpClient(_) => "http_client",
            AppError::NonSuccessStatus { .. } => "non_success_status",
            AppError::Federation(_) => "federation",
            AppError::InvalidSignature(_) => "invalid_signature",
            AppError::MissingPrivateKey { .. } => "missing_private_key",
            AppError::Config(_) => "config",
            AppError::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound | AppError::ActorNotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized | AppError::InvalidSignature(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::NotAcceptable(_) => StatusCode::NOT_ACCEPTABLE,
            AppError::HttpClient(_)
            | AppError::NonSuccessStatus { .. }
            | AppError::Federation(_) => StatusCode::BAD_GATEWAY,
            AppError::Database(_)
            | AppError::MissingPrivateKey { .. }
            | AppError::Config(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        use axum::Json;

        let status = self.status();
        // Server-side details stay in the logs.
        let error_message = match &self {
            AppError::Database(_) => "Database error".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
            AppError::MissingPrivateKey { .. } => "Signing key unavailable".to_string(),
            _ => self.to_string(),
        };

        if status.is_server_error() {
            tracing::error!(error = %self, kind = self.kind(), "Request failed");
        } else {
            tracing::debug!(error = %self, kind = self.kind(), "Request rejected");
        }

        crate::metrics::ERRORS_TOTAL
            .with_label_values(&[self.kind()])
            .inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_error_taxonomy() {
        assert_eq!(AppError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::InvalidSignature("bad".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::NotAcceptable("text/html".into()).status(),
            StatusCode::NOT_ACCEPTABLE
        );
        assert_eq!(
            AppError::NonSuccessStatus {
                url: "https://remote.example/outbox".into(),
                status: 500
            }
            .status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            AppError::MissingPrivateKey {
                path: "keys/b-private.pem".into()
            }
            .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn into_response_hides_internal_details() {
        let response = AppError::Internal(anyhow::anyhow!("secret detail")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
