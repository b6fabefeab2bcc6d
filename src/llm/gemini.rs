//! Gemini `generateContent` client used for reference matching and audio
//! transcription.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::LlmError;

use super::{TextMatcher, Transcriber};

pub struct GeminiClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl GeminiClient {
    pub fn from_env() -> Result<Self> {
        let api_key = dotenv::var("GEMINI_API_KEY").context("GEMINI_API_KEY required")?;
        let base_url = dotenv::var("GEMINI_BASE_URL")
            .unwrap_or_else(|_| "https://generativelanguage.googleapis.com".to_string());
        let model = dotenv::var("GEMINI_MODEL").unwrap_or_else(|_| "gemini-2.5-flash".to_string());

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            api_key,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        )
    }

    /// Single non-streaming generation. Returns the concatenated text parts.
    async fn generate(&self, parts: Vec<Value>, json_output: bool) -> Result<String, LlmError> {
        let mut generation_config = json!({
            "maxOutputTokens": 4096,
            "temperature": 0.2,
            "thinkingConfig": {"thinkingBudget": 0},
        });
        if json_output {
            generation_config["responseMimeType"] = json!("application/json");
        }
        let body = json!({
            "contents": [{"role": "user", "parts": parts}],
            "generationConfig": generation_config,
        });

        let resp = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(LlmError::Api {
                status: status.as_u16(),
                body: text,
            });
        }

        let json: Value =
            serde_json::from_str(&text).map_err(|e| LlmError::Decode(e.to_string()))?;
        Ok(extract_text(&json))
    }
}

#[async_trait]
impl TextMatcher for GeminiClient {
    async fn complete(&self, prompt: String) -> Result<String, LlmError> {
        let text = self.generate(vec![json!({"text": prompt})], false).await?;
        Ok(text.trim().to_string())
    }
}

#[async_trait]
impl Transcriber for GeminiClient {
    async fn transcribe(
        &self,
        audio: &[u8],
        mime_type: &str,
        prompt: String,
    ) -> Result<String, LlmError> {
        debug!(bytes = audio.len(), mime_type, "Transcribing audio");
        let data = base64::engine::general_purpose::STANDARD.encode(audio);
        let raw = self
            .generate(
                vec![
                    json!({"text": prompt}),
                    json!({"inlineData": {"mimeType": mime_type, "data": data}}),
                ],
                true,
            )
            .await?;
        parse_transcript(&raw)
    }
}

fn extract_text(body: &Value) -> String {
    body["candidates"]
        .get(0)
        .and_then(|c| c["content"]["parts"].as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p["text"].as_str())
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

#[derive(Deserialize)]
struct Transcript {
    transcript: String,
}

fn parse_transcript(raw: &str) -> Result<String, LlmError> {
    let parsed: Transcript = serde_json::from_str(raw)
        .map_err(|e| LlmError::Decode(format!("transcription response: {e}")))?;
    Ok(parsed.transcript.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_text_joins_parts() {
        let body = json!({
            "candidates": [{"content": {"parts": [{"text": "<match_1>"}, {"text": "\nName: Banaani"}]}}]
        });
        assert_eq!(extract_text(&body), "<match_1>\nName: Banaani");
        assert_eq!(extract_text(&json!({"candidates": []})), "");
    }

    #[test]
    fn test_parse_transcript() {
        assert_eq!(
            parse_transcript(r#"{"transcript": "  kaksi kananmunaa "}"#).unwrap(),
            "kaksi kananmunaa"
        );
        assert!(parse_transcript("kaksi kananmunaa").is_err());
    }
}
