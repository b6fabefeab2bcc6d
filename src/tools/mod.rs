//! The closed set of operations the model may request.
//!
//! Each tool owns a typed input struct. The same struct drives the JSON
//! schema advertised to the model and the decoding of the model's request,
//! so the two can never disagree.

pub mod code;
pub mod documents;
pub mod ingredients;
pub mod log;
pub mod memory;
pub mod reference;

use std::fmt;
use std::sync::Arc;

use chrono_tz::Tz;
use schemars::gen::SchemaSettings;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::docs::DocumentStore;
use crate::error::ToolError;
use crate::llm::ToolDefinition;
use crate::sandbox::Sandbox;

use reference::ReferenceSearch;

/// Validation beyond what the input's types express.
pub trait ToolInput: DeserializeOwned + JsonSchema {
    fn check(&self) -> Result<(), ToolError> {
        Ok(())
    }
}

fn decode<T: ToolInput>(input: Value) -> Result<T, ToolError> {
    let parsed: T = serde_json::from_value(input).map_err(|e| {
        debug!(error = %e, "tool input rejected");
        ToolError::InvalidInput
    })?;
    parsed.check()?;
    Ok(parsed)
}

fn input_schema<T: JsonSchema>() -> Value {
    let generator = SchemaSettings::draft07()
        .with(|s| {
            s.inline_subschemas = true;
            s.option_add_null_type = false;
            s.meta_schema = None;
        })
        .into_generator();
    let schema = generator.into_root_schema_for::<T>();
    let mut value = serde_json::to_value(schema).unwrap_or_else(|_| serde_json::json!({}));
    if let Some(obj) = value.as_object_mut() {
        obj.remove("title");
        obj.remove("description");
        obj.entry("type").or_insert_with(|| "object".into());
    }
    value
}

/// Name of a registered tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolName {
    ReadDocument,
    AppendFoodLogEntry,
    AppendWeightLogEntry,
    RemoveLogEntry,
    SaveMemory,
    UpsertKnownIngredient,
    SearchReferenceDatabase,
    ExecuteCode,
}

impl ToolName {
    pub const ALL: [ToolName; 8] = [
        ToolName::ReadDocument,
        ToolName::AppendFoodLogEntry,
        ToolName::AppendWeightLogEntry,
        ToolName::RemoveLogEntry,
        ToolName::SaveMemory,
        ToolName::UpsertKnownIngredient,
        ToolName::SearchReferenceDatabase,
        ToolName::ExecuteCode,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::ReadDocument => "ReadDocument",
            ToolName::AppendFoodLogEntry => "AppendFoodLogEntry",
            ToolName::AppendWeightLogEntry => "AppendWeightLogEntry",
            ToolName::RemoveLogEntry => "RemoveLogEntry",
            ToolName::SaveMemory => "SaveMemory",
            ToolName::UpsertKnownIngredient => "UpsertKnownIngredient",
            ToolName::SearchReferenceDatabase => "SearchReferenceDatabase",
            ToolName::ExecuteCode => "ExecuteCode",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    pub fn definition(&self) -> ToolDefinition {
        let (description, input_schema) = match self {
            ToolName::ReadDocument => (
                documents::description(),
                input_schema::<documents::ReadDocumentInput>(),
            ),
            ToolName::AppendFoodLogEntry => (
                log::APPEND_FOOD_DESCRIPTION.to_string(),
                input_schema::<log::AppendFoodLogEntryInput>(),
            ),
            ToolName::AppendWeightLogEntry => (
                log::APPEND_WEIGHT_DESCRIPTION.to_string(),
                input_schema::<log::AppendWeightLogEntryInput>(),
            ),
            ToolName::RemoveLogEntry => (
                log::REMOVE_DESCRIPTION.to_string(),
                input_schema::<log::RemoveLogEntryInput>(),
            ),
            ToolName::SaveMemory => (
                memory::DESCRIPTION.to_string(),
                input_schema::<memory::SaveMemoryInput>(),
            ),
            ToolName::UpsertKnownIngredient => (
                ingredients::DESCRIPTION.to_string(),
                input_schema::<ingredients::UpsertKnownIngredientInput>(),
            ),
            ToolName::SearchReferenceDatabase => (
                reference::DESCRIPTION.to_string(),
                input_schema::<reference::SearchReferenceInput>(),
            ),
            ToolName::ExecuteCode => (
                code::DESCRIPTION.to_string(),
                input_schema::<code::ExecuteCodeInput>(),
            ),
        };
        ToolDefinition {
            name: self.as_str(),
            description,
            input_schema,
        }
    }

    /// Every tool, as advertised to the model.
    pub fn registry() -> Vec<ToolDefinition> {
        Self::ALL.iter().map(ToolName::definition).collect()
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded tool request.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    ReadDocument(documents::ReadDocumentInput),
    AppendFoodLogEntry(log::AppendFoodLogEntryInput),
    AppendWeightLogEntry(log::AppendWeightLogEntryInput),
    RemoveLogEntry(log::RemoveLogEntryInput),
    SaveMemory(memory::SaveMemoryInput),
    UpsertKnownIngredient(ingredients::UpsertKnownIngredientInput),
    SearchReferenceDatabase(reference::SearchReferenceInput),
    ExecuteCode(code::ExecuteCodeInput),
}

impl ToolCall {
    pub fn parse(name: ToolName, input: Value) -> Result<Self, ToolError> {
        Ok(match name {
            ToolName::ReadDocument => ToolCall::ReadDocument(decode(input)?),
            ToolName::AppendFoodLogEntry => ToolCall::AppendFoodLogEntry(decode(input)?),
            ToolName::AppendWeightLogEntry => ToolCall::AppendWeightLogEntry(decode(input)?),
            ToolName::RemoveLogEntry => ToolCall::RemoveLogEntry(decode(input)?),
            ToolName::SaveMemory => ToolCall::SaveMemory(decode(input)?),
            ToolName::UpsertKnownIngredient => ToolCall::UpsertKnownIngredient(decode(input)?),
            ToolName::SearchReferenceDatabase => {
                ToolCall::SearchReferenceDatabase(decode(input)?)
            }
            ToolName::ExecuteCode => ToolCall::ExecuteCode(decode(input)?),
        })
    }

    pub fn name(&self) -> ToolName {
        match self {
            ToolCall::ReadDocument(_) => ToolName::ReadDocument,
            ToolCall::AppendFoodLogEntry(_) => ToolName::AppendFoodLogEntry,
            ToolCall::AppendWeightLogEntry(_) => ToolName::AppendWeightLogEntry,
            ToolCall::RemoveLogEntry(_) => ToolName::RemoveLogEntry,
            ToolCall::SaveMemory(_) => ToolName::SaveMemory,
            ToolCall::UpsertKnownIngredient(_) => ToolName::UpsertKnownIngredient,
            ToolCall::SearchReferenceDatabase(_) => ToolName::SearchReferenceDatabase,
            ToolCall::ExecuteCode(_) => ToolName::ExecuteCode,
        }
    }
}

/// Service handles the tools run against.
pub struct ToolContext {
    pub store: Arc<DocumentStore>,
    pub reference: Arc<ReferenceSearch>,
    pub sandbox: Arc<Sandbox>,
    pub time_zone: Tz,
}

impl ToolContext {
    /// Run one tool. Every failure is rendered into the returned text.
    pub async fn dispatch(&self, call: ToolCall, cancel: &CancellationToken) -> String {
        let name = call.name();
        let result = match call {
            ToolCall::ReadDocument(input) => documents::read_document(&self.store, input).await,
            ToolCall::AppendFoodLogEntry(input) => log::append_food(&self.store, input).await,
            ToolCall::AppendWeightLogEntry(input) => log::append_weight(&self.store, input).await,
            ToolCall::RemoveLogEntry(input) => log::remove_entry(&self.store, input).await,
            ToolCall::SaveMemory(input) => {
                memory::save_memory(&self.store, self.time_zone, input).await
            }
            ToolCall::UpsertKnownIngredient(input) => {
                ingredients::upsert_ingredient(&self.store, input).await
            }
            ToolCall::SearchReferenceDatabase(input) => {
                self.reference.search(&input.query, cancel).await
            }
            ToolCall::ExecuteCode(input) => code::execute_code(&self.sandbox, input, cancel).await,
        };

        match result {
            Ok(output) => {
                debug!(tool = %name, output_len = output.len(), "tool completed");
                output
            }
            Err(e) => {
                debug!(tool = %name, error = %e, "tool returned an error");
                e.to_string()
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_registry_covers_every_tool() {
        let registry = ToolName::registry();
        assert_eq!(registry.len(), ToolName::ALL.len());
        for def in &registry {
            assert_eq!(ToolName::from_name(def.name).map(|t| t.as_str()), Some(def.name));
            assert_eq!(def.input_schema["type"], "object");
            assert!(def.input_schema.get("title").is_none());
            assert!(!def.description.is_empty());
        }
    }

    #[test]
    fn test_schemas_mark_required_fields() {
        let weight = ToolName::AppendWeightLogEntry.definition().input_schema;
        let required: Vec<&str> = weight["required"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert_eq!(required, vec!["weight"]);
        assert!(weight["properties"]["date"].is_object());

        let read = ToolName::ReadDocument.definition().input_schema;
        assert_eq!(read["properties"]["slug"]["enum"].as_array().unwrap().len(), 4);

        let ingredient = ToolName::UpsertKnownIngredient.definition().input_schema;
        assert_eq!(ingredient["properties"]["unit"]["enum"], json!(["g", "ml"]));
    }

    #[test]
    fn test_unknown_name_is_not_a_tool() {
        assert_eq!(ToolName::from_name("DeleteEverything"), None);
        assert_eq!(ToolName::from_name("SaveMemory"), Some(ToolName::SaveMemory));
    }

    #[test]
    fn test_bad_input_is_recoverable() {
        let err = ToolCall::parse(ToolName::AppendWeightLogEntry, json!({"weight": "heavy"}))
            .unwrap_err();
        assert_eq!(err.to_string(), "Error: Invalid input.");

        let err = ToolCall::parse(ToolName::ExecuteCode, json!({})).unwrap_err();
        assert_eq!(err.to_string(), "Error: Invalid input.");
    }

    #[tokio::test]
    async fn test_dispatch_renders_errors_as_text() {
        let ctx = testing::context();
        let call = ToolCall::parse(ToolName::ReadDocument, json!({"slug": "foo"})).unwrap();
        let output = ctx.dispatch(call, &CancellationToken::new()).await;
        assert_eq!(output, "Error: Unknown document slug: foo");
    }
}
