//! Streaming client for the Anthropic Messages API.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::LlmError;

use super::sse::event_stream;
use super::{ContentBlock, Message, ModelClient, ModelEvent, ModelRequest, ModelStream};

const API_VERSION: &str = "2023-06-01";
const THINKING_BETA: &str = "interleaved-thinking-2025-05-14";

pub struct AnthropicClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    max_tokens: u32,
    /// Zero turns extended thinking off.
    thinking_budget: u32,
    /// Sent as `metadata.user_id`; one per process.
    user_id: String,
}

impl AnthropicClient {
    pub fn from_env() -> Result<Self> {
        let api_key = dotenv::var("ANTHROPIC_API_KEY").context("ANTHROPIC_API_KEY required")?;
        let base_url = dotenv::var("ANTHROPIC_BASE_URL")
            .unwrap_or_else(|_| "https://api.anthropic.com".to_string());
        let model =
            dotenv::var("ANTHROPIC_MODEL").unwrap_or_else(|_| "claude-sonnet-4-0".to_string());
        let max_tokens = dotenv::var("ANTHROPIC_MAX_TOKENS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8192);
        let thinking_budget = dotenv::var("ANTHROPIC_THINKING_BUDGET")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(4096);

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            api_key,
            max_tokens,
            thinking_budget,
            user_id: Uuid::new_v4().to_string(),
        })
    }

    fn build_body(&self, req: &ModelRequest<'_>) -> Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "stream": true,
            "metadata": {"user_id": self.user_id},
            "system": [{
                "type": "text",
                "text": req.system,
                "cache_control": {"type": "ephemeral"},
            }],
            "messages": req.messages,
            "tools": req.tools,
        });
        if self.thinking_budget > 0 {
            body["thinking"] = serde_json::json!({
                "type": "enabled",
                "budget_tokens": self.thinking_budget,
            });
        }
        body
    }
}

#[async_trait]
impl ModelClient for AnthropicClient {
    async fn stream(&self, request: ModelRequest<'_>) -> Result<ModelStream, LlmError> {
        let body = self.build_body(&request);
        debug!(
            model = %self.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Calling messages API"
        );

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("anthropic-beta", THINKING_BETA)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let mut state = StreamState::default();
        Ok(event_stream(resp, move |data| parse_sse(data, &mut state)))
    }
}

enum PartialBlock {
    Text(String),
    Thinking {
        thinking: String,
        signature: String,
    },
    ToolUse {
        id: String,
        name: String,
        json: String,
    },
}

/// Content blocks under assembly, keyed by stream index.
#[derive(Default)]
struct StreamState {
    open: BTreeMap<u64, PartialBlock>,
    closed: BTreeMap<u64, ContentBlock>,
}

fn str_field(v: &Value, key: &str) -> String {
    v.get(key).and_then(Value::as_str).unwrap_or("").to_string()
}

fn parse_sse(data: &str, state: &mut StreamState) -> Vec<Result<ModelEvent, LlmError>> {
    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return vec![Err(LlmError::Decode(e.to_string()))],
    };
    let index = v.get("index").and_then(Value::as_u64).unwrap_or(0);

    match v.get("type").and_then(Value::as_str).unwrap_or("") {
        "content_block_start" => {
            let Some(block) = v.get("content_block") else {
                return vec![];
            };
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    state
                        .open
                        .insert(index, PartialBlock::Text(str_field(block, "text")));
                }
                Some("tool_use") => {
                    state.open.insert(
                        index,
                        PartialBlock::ToolUse {
                            id: str_field(block, "id"),
                            name: str_field(block, "name"),
                            json: String::new(),
                        },
                    );
                }
                Some("thinking") => {
                    state.open.insert(
                        index,
                        PartialBlock::Thinking {
                            thinking: str_field(block, "thinking"),
                            signature: str_field(block, "signature"),
                        },
                    );
                }
                Some("redacted_thinking") => {
                    state.closed.insert(
                        index,
                        ContentBlock::RedactedThinking {
                            data: str_field(block, "data"),
                        },
                    );
                }
                _ => {}
            }
            vec![]
        }

        "content_block_delta" => {
            let Some(delta) = v.get("delta") else {
                return vec![];
            };
            match (delta.get("type").and_then(Value::as_str), state.open.get_mut(&index)) {
                (Some("text_delta"), Some(PartialBlock::Text(text))) => {
                    let piece = str_field(delta, "text");
                    if piece.is_empty() {
                        return vec![];
                    }
                    text.push_str(&piece);
                    vec![Ok(ModelEvent::TextDelta(piece))]
                }
                (Some("input_json_delta"), Some(PartialBlock::ToolUse { json, .. })) => {
                    json.push_str(&str_field(delta, "partial_json"));
                    vec![]
                }
                (Some("thinking_delta"), Some(PartialBlock::Thinking { thinking, .. })) => {
                    thinking.push_str(&str_field(delta, "thinking"));
                    vec![]
                }
                (Some("signature_delta"), Some(PartialBlock::Thinking { signature, .. })) => {
                    signature.push_str(&str_field(delta, "signature"));
                    vec![]
                }
                _ => vec![],
            }
        }

        "content_block_stop" => match state.open.remove(&index) {
            Some(PartialBlock::Text(text)) => {
                // The API rejects empty text blocks when history is replayed.
                if !text.is_empty() {
                    state.closed.insert(index, ContentBlock::text(text));
                }
                vec![]
            }
            Some(PartialBlock::Thinking {
                thinking,
                signature,
            }) => {
                state.closed.insert(
                    index,
                    ContentBlock::Thinking {
                        thinking,
                        signature,
                    },
                );
                vec![]
            }
            Some(PartialBlock::ToolUse { id, name, json }) => {
                let input = if json.trim().is_empty() {
                    Ok(Value::Object(Default::default()))
                } else {
                    serde_json::from_str(&json)
                };
                match input {
                    Ok(input) => {
                        state
                            .closed
                            .insert(index, ContentBlock::ToolUse { id, name, input });
                        vec![]
                    }
                    Err(e) => vec![Err(LlmError::Decode(format!(
                        "tool input for {name} is not valid JSON: {e}"
                    )))],
                }
            }
            None => vec![],
        },

        "message_stop" => {
            let content = std::mem::take(&mut state.closed).into_values().collect();
            vec![Ok(ModelEvent::Completed(Message::assistant(content)))]
        }

        "error" => {
            let message = v
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            vec![Err(LlmError::Stream(message.to_string()))]
        }

        // message_start, message_delta, ping
        _ => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn feed(payloads: &[Value]) -> Vec<Result<ModelEvent, LlmError>> {
        let mut state = StreamState::default();
        payloads
            .iter()
            .flat_map(|p| parse_sse(&p.to_string(), &mut state))
            .collect()
    }

    #[test]
    fn test_text_and_tool_use_are_assembled() {
        let events = feed(&[
            json!({"type": "message_start", "message": {"usage": {"input_tokens": 10}}}),
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Kirjaan "}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "painon."}}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "AppendWeightLogEntry", "input": {}}}),
            json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"weight\": "}}),
            json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "82.4}"}}),
            json!({"type": "content_block_stop", "index": 1}),
            json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}}),
            json!({"type": "message_stop"}),
        ]);

        let events: Vec<ModelEvent> = events.into_iter().map(Result::unwrap).collect();
        assert_eq!(events[0], ModelEvent::TextDelta("Kirjaan ".into()));
        assert_eq!(events[1], ModelEvent::TextDelta("painon.".into()));
        let ModelEvent::Completed(message) = &events[2] else {
            panic!("expected completion, got {:?}", events[2]);
        };
        assert_eq!(message.content[0], ContentBlock::text("Kirjaan painon."));
        assert_eq!(
            message.content[1],
            ContentBlock::ToolUse {
                id: "toolu_1".into(),
                name: "AppendWeightLogEntry".into(),
                input: json!({"weight": 82.4}),
            }
        );
    }

    #[test]
    fn test_tool_use_without_arguments_gets_empty_object() {
        let events = feed(&[
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "tool_use", "id": "t", "name": "ReadDocument"}}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "message_stop"}),
        ]);
        let Ok(ModelEvent::Completed(message)) = &events[0] else {
            panic!("expected completion");
        };
        assert_eq!(message.tool_uses()[0].input, json!({}));
    }

    #[test]
    fn test_error_event_surfaces() {
        let events = feed(&[json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}})]);
        assert!(matches!(&events[0], Err(LlmError::Stream(m)) if m == "Overloaded"));
    }

    #[test]
    fn test_thinking_is_kept_with_its_signature_but_not_streamed() {
        let events = feed(&[
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "thinking", "thinking": ""}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "thinking_delta", "thinking": "Lasketaan "}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "thinking_delta", "thinking": "kalorit."}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "signature_delta", "signature": "EqQB"}}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "content_block_start", "index": 1, "content_block": {"type": "redacted_thinking", "data": "opaque"}}),
            json!({"type": "content_block_stop", "index": 1}),
            json!({"type": "message_stop"}),
        ]);
        assert_eq!(events.len(), 1);
        let Ok(ModelEvent::Completed(message)) = &events[0] else {
            panic!("expected completion, got {:?}", events[0]);
        };
        assert_eq!(
            message.content,
            vec![
                ContentBlock::Thinking {
                    thinking: "Lasketaan kalorit.".into(),
                    signature: "EqQB".into(),
                },
                ContentBlock::RedactedThinking {
                    data: "opaque".into(),
                },
            ]
        );
    }

    fn client(thinking_budget: u32) -> AnthropicClient {
        AnthropicClient {
            client: reqwest::Client::new(),
            base_url: "http://localhost".into(),
            model: "claude-sonnet-4-0".into(),
            api_key: "test".into(),
            max_tokens: 8192,
            thinking_budget,
            user_id: "u-1".into(),
        }
    }

    #[test]
    fn test_request_enables_thinking_and_sends_user_id() {
        let request = ModelRequest {
            system: "coach",
            messages: &[],
            tools: &[],
        };
        let body = client(4096).build_body(&request);
        assert_eq!(body["thinking"], json!({"type": "enabled", "budget_tokens": 4096}));
        assert_eq!(body["metadata"]["user_id"], "u-1");
        assert_eq!(body["system"][0]["cache_control"], json!({"type": "ephemeral"}));

        let body = client(0).build_body(&request);
        assert!(body.get("thinking").is_none());
    }
}
