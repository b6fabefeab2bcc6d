pub mod anthropic;
pub mod gemini;
mod sse;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

pub use anthropic::AnthropicClient;
pub use gemini::GeminiClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Prompt-cache hint attached to a content block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CacheControl {
    Ephemeral,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ImageSource {
    Base64 { media_type: String, data: String },
}

/// One content block, in the Messages API wire shape so stored history can be
/// replayed verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    /// Extended thinking. Replayed unchanged; the signature must match.
    Thinking {
        thinking: String,
        signature: String,
    },
    RedactedThinking {
        data: String,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text {
            text: text.into(),
            cache_control: None,
        }
    }

    pub fn image(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        ContentBlock::Image {
            source: ImageSource::Base64 {
                media_type: media_type.into(),
                data: data.into(),
            },
        }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            cache_control: None,
        }
    }

    #[cfg(test)]
    pub fn cache_control(&self) -> Option<CacheControl> {
        match self {
            ContentBlock::Text { cache_control, .. }
            | ContentBlock::ToolResult { cache_control, .. } => *cache_control,
            _ => None,
        }
    }

    /// Set the cache hint. Blocks that cannot carry one are left alone.
    pub fn set_cache_control(&mut self, value: Option<CacheControl>) {
        match self {
            ContentBlock::Text { cache_control, .. }
            | ContentBlock::ToolResult { cache_control, .. } => *cache_control = value,
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

impl Message {
    pub fn user(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content,
        }
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }

    /// Tool-use blocks in the order the model produced them.
    pub fn tool_uses(&self) -> Vec<ToolUse> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, input } => Some(ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }
}

/// Tool declaration sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: String,
    pub input_schema: serde_json::Value,
}

pub struct ModelRequest<'a> {
    pub system: &'a str,
    pub messages: &'a [Message],
    pub tools: &'a [ToolDefinition],
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    TextDelta(String),
    /// The complete assistant message; always the last event of a stream.
    Completed(Message),
}

pub type ModelStream = Pin<Box<dyn Stream<Item = Result<ModelEvent, LlmError>> + Send>>;

/// Primary text-generation service.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn stream(&self, request: ModelRequest<'_>) -> Result<ModelStream, LlmError>;
}

/// Secondary single-shot text service used for dataset matching.
#[async_trait]
pub trait TextMatcher: Send + Sync {
    async fn complete(&self, prompt: String) -> Result<String, LlmError>;
}

/// Speech-to-text. The prompt asks for a `{"transcript": "..."}` object.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(
        &self,
        audio: &[u8],
        mime_type: &str,
        prompt: String,
    ) -> Result<String, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_blocks_use_wire_shape() {
        let mut block = ContentBlock::tool_result("toolu_1", "ok");
        block.set_cache_control(Some(CacheControl::Ephemeral));
        assert_eq!(
            serde_json::to_value(&block).unwrap(),
            json!({
                "type": "tool_result",
                "tool_use_id": "toolu_1",
                "content": "ok",
                "cache_control": {"type": "ephemeral"}
            })
        );

        let image = ContentBlock::image("image/png", "AAAA");
        assert_eq!(
            serde_json::to_value(&image).unwrap(),
            json!({"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "AAAA"}})
        );
    }

    #[test]
    fn test_thinking_blocks_round_trip_through_history() {
        let raw = json!([
            {"type": "thinking", "thinking": "Paino laski.", "signature": "sig=="},
            {"type": "redacted_thinking", "data": "opaque"}
        ]);
        let blocks: Vec<ContentBlock> = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(
            blocks[0],
            ContentBlock::Thinking {
                thinking: "Paino laski.".into(),
                signature: "sig==".into(),
            }
        );
        assert_eq!(serde_json::to_value(&blocks).unwrap(), raw);
    }

    #[test]
    fn test_images_ignore_cache_control() {
        let mut image = ContentBlock::image("image/jpeg", "AAAA");
        image.set_cache_control(Some(CacheControl::Ephemeral));
        assert_eq!(image.cache_control(), None);
    }

    #[test]
    fn test_tool_uses_keep_order() {
        let message = Message::assistant(vec![
            ContentBlock::text("Logging."),
            ContentBlock::ToolUse {
                id: "a".into(),
                name: "SaveMemory".into(),
                input: json!({}),
            },
            ContentBlock::ToolUse {
                id: "b".into(),
                name: "ReadDocument".into(),
                input: json!({}),
            },
        ]);
        let ids: Vec<String> = message.tool_uses().into_iter().map(|u| u.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
