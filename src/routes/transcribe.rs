use axum::extract::{Multipart, State};
use axum::Json;
use serde::Serialize;
use tracing::info;

use crate::docs::schema::{KnownIngredients, StructuredDocument};
use crate::docs::types::Slug;
use crate::prompts;
use crate::state::AppState;

use super::{ApiError, ApiResult};

const DEFAULT_AUDIO_TYPE: &str = "audio/wav";

#[derive(Debug, Serialize)]
pub struct TranscribeResponse {
    pub transcript: String,
}

#[derive(Serialize)]
struct SavedFoodItem<'a> {
    name: &'a str,
    brand: &'a str,
}

/// Known ingredient names and brands, as vocabulary for the transcriber.
fn saved_food_items(known: &KnownIngredients) -> anyhow::Result<String> {
    let items: Vec<SavedFoodItem<'_>> = known
        .ingredients
        .iter()
        .map(|i| SavedFoodItem {
            name: &i.name,
            brand: i.brand.as_deref().unwrap_or(""),
        })
        .collect();
    Ok(serde_json::to_string_pretty(&items)?)
}

pub async fn transcribe(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<TranscribeResponse>> {
    let mut audio = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        if field.name() != Some("audio") {
            continue;
        }
        let mime_type = field
            .content_type()
            .unwrap_or(DEFAULT_AUDIO_TYPE)
            .to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        audio = Some((mime_type, bytes));
        break;
    }
    let (mime_type, bytes) = audio
        .filter(|(_, bytes)| !bytes.is_empty())
        .ok_or_else(|| ApiError::BadRequest("No audio file provided".to_string()))?;

    let known = KnownIngredients::parse(&state.store.read(Slug::KnownIngredients).await?)?;
    let prompt = prompts::transcribe_prompt(&saved_food_items(&known)?);

    let transcript = state
        .transcriber
        .transcribe(&bytes, &mime_type, prompt)
        .await?;
    info!(bytes = bytes.len(), transcript_len = transcript.len(), "audio transcribed");
    Ok(Json(TranscribeResponse { transcript }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};

    use super::super::testing;

    const BOUNDARY: &str = "coach-boundary";

    fn upload(field: &str, payload: &str) -> Request<Body> {
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"clip.webm\"\r\nContent-Type: audio/webm\r\n\r\n{payload}\r\n--{b}--\r\n",
            b = BOUNDARY,
        );
        Request::post("/api/transcribe")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_transcribes_with_known_ingredient_vocabulary() {
        let (state, transcriber) = testing::state(vec![]);
        state
            .store
            .upsert(
                Slug::KnownIngredients,
                r#"{"ingredients":[{"id":"6f1c2a4e-8a3b-4b7e-9d2a-1c3e5f7a9b0d","name":"Maitorahka","brand":"Valio","unit":"g","nutrients":{"kcal":62,"protein":11}}]}"#,
            )
            .await
            .unwrap();

        let (status, body) = testing::send(&state, upload("audio", "kaksisataa grammaa rahkaa")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"transcript":"kaksisataa grammaa rahkaa"}"#);

        let prompts = transcriber.prompts.lock().unwrap();
        assert!(prompts[0].contains("\"name\": \"Maitorahka\""));
        assert!(prompts[0].contains("\"brand\": \"Valio\""));
    }

    #[tokio::test]
    async fn test_missing_audio_field_is_400() {
        let (state, _) = testing::state(vec![]);
        let (status, _) = testing::send(&state, upload("file", "abc")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
