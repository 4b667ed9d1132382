//! API error taxonomy and its HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use kiln_core::PipelineError;

use crate::store::CapacityError;

/// Errors surfaced by the generation endpoint. The first two are the
/// client's fault and never touch the session store; the rest are server
/// faults.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The prompt was blank after trimming.
    #[error("prompt cannot be empty")]
    EmptyPrompt,

    /// The client address could not be parsed as an IP address. Carries
    /// no payload so the raw input never reaches logs or responses.
    #[error("client address could not be parsed")]
    InvalidAddress,

    /// The session store is full and this client has no session yet.
    #[error(transparent)]
    SessionLimit(#[from] CapacityError),

    /// Pipeline construction or inference failed.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// The generated image could not be encoded for transport.
    #[error("failed to encode image: {0}")]
    Encoding(String),
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::EmptyPrompt => (StatusCode::BAD_REQUEST, "empty_prompt"),
            ApiError::InvalidAddress => (StatusCode::BAD_REQUEST, "invalid_address"),
            ApiError::SessionLimit(_) => (StatusCode::SERVICE_UNAVAILABLE, "session_limit"),
            ApiError::Pipeline(_) => (StatusCode::INTERNAL_SERVER_ERROR, "pipeline_error"),
            ApiError::Encoding(_) => (StatusCode::INTERNAL_SERVER_ERROR, "encoding_error"),
        };

        let message = self.to_string();
        if status.is_server_error() {
            tracing::error!(status = %status, code, error = %message, "request failed");
        } else {
            tracing::warn!(status = %status, code, error = %message, "request rejected");
        }

        let body = ErrorResponse {
            code: code.to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}
