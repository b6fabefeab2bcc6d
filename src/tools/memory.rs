use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use schemars::JsonSchema;
use serde::Deserialize;

use crate::clock;
use crate::docs::schema::{Config, StructuredDocument};
use crate::docs::types::Slug;
use crate::docs::DocumentStore;
use crate::error::ToolError;

use super::ToolInput;

pub const DESCRIPTION: &str = r#"Save a memory about the user to their configuration for future conversations. Use it only when the user explicitly asks you to remember something.

Write the memory from the user's perspective, concise and factual, in the language the user speaks, e.g. "I prefer vegetarian meals." The tool stores it as "YYYY-MM-DD: <memory>" with today's date, so never put a date in the memory yourself."#;

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct SaveMemoryInput {
    /// The memory to save: a concise, factual statement about the user.
    pub memory: String,
}

impl ToolInput for SaveMemoryInput {
    fn check(&self) -> Result<(), ToolError> {
        if self.memory.trim().is_empty() {
            return Err(ToolError::InvalidInput);
        }
        Ok(())
    }
}

/// The stored line: the user's local calendar date, then the memory.
fn memory_entry(memory: &str, now: DateTime<Utc>, tz: Tz) -> String {
    format!("{}: {}", clock::format_date(now, tz), memory.trim())
}

pub async fn save_memory(
    store: &DocumentStore,
    tz: Tz,
    input: SaveMemoryInput,
) -> Result<String, ToolError> {
    let mut config = Config::parse(&store.read(Slug::Config).await?)?;

    config
        .memory_entries
        .push(memory_entry(&input.memory, Utc::now(), tz));
    store.upsert(Slug::Config, &config.to_content()?).await?;

    Ok("Memory saved.".to_string())
}
