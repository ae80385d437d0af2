use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Failures while establishing or consuming a completion stream.
///
/// A safety block is not an error: the provider reports it in-band as a
/// stream event, and the session absorbs both kinds into the same
/// user-visible fallback sentence.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("no API key configured")]
    MissingApiKey,

    #[error("completion request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("completion API returned {status}: {message}")]
    Api { status: u16, message: String },
}

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Requested session id is unknown.
    SessionNotFound,
    /// Request body failed validation.
    Validation(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::SessionNotFound => (
                StatusCode::NOT_FOUND,
                "SESSION_NOT_FOUND",
                "Session not found".to_string(),
            ),
            AppError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
            }
        };

        let body = json!({
            "error": {
                "code": code,
                "message": message,
            }
        });

        (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}
