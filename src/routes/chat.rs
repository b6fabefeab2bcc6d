use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::agent::ImageAttachment;
use crate::state::AppState;

use super::{ApiError, ApiResult};

const IMAGE_TYPES: &[&str] = &["image/jpeg", "image/png"];

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default)]
    pub images: Vec<ImageAttachment>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum FailureFrame {
    Error { message: String },
}

fn frame<T: Serialize>(value: &T) -> Event {
    Event::default().json_data(value).unwrap_or_default()
}

/// Run one turn and stream its events. The turn keeps running to
/// completion on a background task; a client that goes away cancels it.
pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    for image in &req.images {
        if !IMAGE_TYPES.contains(&image.mime_type.as_str()) || image.base64_data.is_empty() {
            return Err(ApiError::BadRequest("Invalid payload".to_string()));
        }
    }

    let cancel = CancellationToken::new();
    let turn = state.engine.clone().run_turn(
        conversation_id.clone(),
        req.content,
        req.images,
        cancel.clone(),
    );

    let (tx, rx) = mpsc::channel::<Event>(64);
    tokio::spawn(async move {
        let mut turn = std::pin::pin!(turn);
        let mut failed = false;
        while let Some(item) = turn.next().await {
            let event = match item {
                Ok(event) => frame(&event),
                Err(e) => {
                    failed = true;
                    frame(&FailureFrame::Error {
                        message: e.to_string(),
                    })
                }
            };
            // Keep draining after the client is gone so the turn can persist.
            let _ = tx.send(event).await;
        }
        if !failed {
            let _ = tx.send(Event::default().data("[DONE]")).await;
        }
        debug!(conversation_id = %conversation_id, "chat stream closed");
    });

    let guard = cancel.drop_guard();
    let stream = ReceiverStream::new(rx).map(move |event| {
        let _ = &guard;
        Ok(event)
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};

    use super::super::testing;
    use crate::llm::Role;

    fn request(id: &str, body: &str) -> Request<Body> {
        Request::post(format!("/api/chat/{}", id))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_streams_deltas_then_done() {
        let (state, _) = testing::state(vec![Ok("Moi!".to_string())]);
        let (status, body) = testing::send(&state, request("c1", r#"{"content":"Hei"}"#)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            "data: {\"type\":\"content_delta\",\"content\":\"Moi!\"}\n\ndata: [DONE]\n\n"
        );
        let history = state.store.load_conversation("c1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_model_failure_emits_error_frame() {
        let (state, _) = testing::state(vec![Err(529)]);
        let (status, body) = testing::send(&state, request("c1", r#"{"content":"Hei"}"#)).await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.starts_with("data: {\"type\":\"error\",\"message\":"));
        assert!(!body.contains("[DONE]"));
        assert_eq!(state.store.load_conversation("c1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_unsupported_image_type() {
        let (state, _) = testing::state(vec![]);
        let body = r#"{"content":"kuva","images":[{"mimeType":"image/gif","base64Data":"R0lG"}]}"#;
        let (status, _) = testing::send(&state, request("c1", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
