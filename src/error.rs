//! Error handling

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::upstream::UpstreamError;

/// Message shown when the upstream can't be reached; the detail only goes to the log.
const CONNECTION_FAILED_MESSAGE: &str = "Failed to connect to the image generation API.";

/// definitions for the storyframe application.
#[derive(Debug)]
pub enum StoryframeError {
    /// When you didn't send what we need, eg a blank prompt
    BadRequest(String),
    /// OPENAI_BASE_URL / OPENAI_API_KEY missing or unusable
    NotConfigured(String),
    /// Upstream rejected the call; its status and body go back to the caller
    Upstream {
        /// Upstream HTTP status
        status: u16,
        /// Upstream response body
        body: String,
    },
    /// Upstream couldn't be reached
    Connection(String),
    /// Upstream answered with something we couldn't use
    BadGateway(String),
    /// When an internal server error occurs
    InternalServerError(String),
}

impl From<UpstreamError> for StoryframeError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::NotConfigured | UpstreamError::InvalidBaseUrl { .. } => {
                StoryframeError::NotConfigured(err.to_string())
            }
            UpstreamError::Upstream { status, body } => StoryframeError::Upstream { status, body },
            UpstreamError::Connection(detail) => StoryframeError::Connection(detail),
            UpstreamError::InvalidResponse(_) | UpstreamError::NoImageProduced { .. } => {
                StoryframeError::BadGateway(err.to_string())
            }
        }
    }
}

impl From<axum::http::Error> for StoryframeError {
    fn from(err: axum::http::Error) -> Self {
        StoryframeError::InternalServerError(err.to_string())
    }
}

impl From<JsonRejection> for StoryframeError {
    fn from(rejection: JsonRejection) -> Self {
        StoryframeError::BadRequest(rejection.body_text())
    }
}

/// The `{error: {message}}` body every API failure uses.
pub(crate) fn error_body(message: &str) -> Json<Value> {
    Json(json!({ "error": { "message": message } }))
}

impl IntoResponse for StoryframeError {
    fn into_response(self) -> Response {
        match self {
            StoryframeError::BadRequest(message) => {
                info!("Bad request received: {}", message);
                (StatusCode::BAD_REQUEST, error_body(&message)).into_response()
            }
            StoryframeError::NotConfigured(message) => {
                tracing::error!("Configuration error: {}", message);
                (StatusCode::INTERNAL_SERVER_ERROR, error_body(&message)).into_response()
            }
            StoryframeError::Upstream { status, body } => {
                warn!("Upstream returned {}: {}", status, body);
                let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
                match serde_json::from_str::<Value>(&body) {
                    Ok(value @ Value::Object(_)) => (status, Json(value)).into_response(),
                    _ => (status, error_body(&body)).into_response(),
                }
            }
            StoryframeError::Connection(detail) => {
                tracing::error!("Image generation error: {}", detail);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    error_body(CONNECTION_FAILED_MESSAGE),
                )
                    .into_response()
            }
            StoryframeError::BadGateway(message) => {
                tracing::error!("Bad upstream response: {}", message);
                (StatusCode::BAD_GATEWAY, error_body(&message)).into_response()
            }
            StoryframeError::InternalServerError(message) => {
                tracing::error!("Internal server error: {}", message);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    error_body("Internal server error"),
                )
                    .into_response()
            }
        }
    }
}
