//! HTTP surface of the coach.

pub mod chat;
pub mod documents;
pub mod summary;
pub mod transcribe;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use thiserror::Error;
use tower_http::trace::TraceLayer;

use crate::docs::schema::SchemaError;
use crate::error::LlmError;
use crate::state::AppState;

/// Uploads carry base64 images and audio clips.
const BODY_LIMIT: usize = 25 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("Stored document is invalid: {0}")]
    InvalidDocument(#[from] SchemaError),

    #[error("Upstream service failed: {0}")]
    Upstream(#[from] LlmError),

    #[error("Internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::InvalidDocument(ref e) => {
                tracing::error!("Invalid stored document: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, format!("Invalid {} document", e.label))
            }
            ApiError::Upstream(ref e) => {
                tracing::error!("Upstream error: {}", e);
                (StatusCode::BAD_GATEWAY, "Upstream service error".to_string())
            }
            ApiError::Internal(ref e) => {
                tracing::error!("Internal error: {:#}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat/:id", post(chat::send_message))
        .route("/api/summary", get(summary::summary))
        .route(
            "/api/documents/:slug",
            get(documents::read_document).put(documents::write_document),
        )
        .route("/api/transcribe", post(transcribe::transcribe))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
