use axum::extract::{Path, State};
use axum::http::{header, HeaderName, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use crate::docs::schema::SchemaError;
use crate::docs::types::Slug;
use crate::state::AppState;

use super::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct WriteDocumentRequest {
    pub content: String,
}

const UPDATED_AT: HeaderName = HeaderName::from_static("x-updated-at");

fn parse_slug(raw: &str) -> ApiResult<Slug> {
    raw.parse()
        .map_err(|e: crate::docs::types::UnknownSlug| ApiError::NotFound(e.to_string()))
}

pub async fn read_document(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let slug = parse_slug(&slug)?;
    // A slug with no row reads as empty content.
    let (content, updated_at) = match state.store.record(slug).await? {
        Some(record) => (record.content, record.updated_at),
        None => (String::new(), String::new()),
    };
    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (UPDATED_AT, updated_at),
        ],
        content,
    ))
}

/// Replace a document after validating it against its schema.
pub async fn write_document(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Json(req): Json<WriteDocumentRequest>,
) -> ApiResult<StatusCode> {
    let slug = parse_slug(&slug)?;
    state
        .store
        .import(slug, &req.content)
        .await
        .map_err(|e| match e.downcast::<SchemaError>() {
            Ok(schema) => ApiError::BadRequest(schema.to_string()),
            Err(other) => ApiError::Internal(other),
        })?;
    Ok(StatusCode::NO_CONTENT)
}
