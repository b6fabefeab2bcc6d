use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::Deserialize;

use crate::docs::types::Slug;
use crate::docs::DocumentStore;
use crate::error::ToolError;

use super::ToolInput;

pub fn description() -> String {
    let slugs = Slug::ALL
        .iter()
        .map(|slug| format!("- {}: {}", slug, slug.summary()))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Read a document's contents by its slug. Available documents are:\n{}",
        slugs
    )
}

fn slug_schema(_: &mut SchemaGenerator) -> Schema {
    SchemaObject {
        instance_type: Some(InstanceType::String.into()),
        enum_values: Some(Slug::ALL.iter().map(|s| s.as_str().into()).collect()),
        ..Default::default()
    }
    .into()
}

/// The slug is kept as free text so an unknown value reaches the tool and
/// gets a not-found answer instead of a generic input error.
#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct ReadDocumentInput {
    /// The slug of the document to read.
    #[schemars(schema_with = "slug_schema")]
    pub slug: String,
}

impl ToolInput for ReadDocumentInput {}

pub async fn read_document(
    store: &DocumentStore,
    input: ReadDocumentInput,
) -> Result<String, ToolError> {
    let slug: Slug = input
        .slug
        .parse()
        .map_err(|e: crate::docs::types::UnknownSlug| ToolError::NotFound(e.to_string()))?;

    let content = store.read(slug).await?;
    if content.is_empty() || !slug.is_structured() {
        return Ok(content);
    }

    let value: serde_json::Value =
        serde_json::from_str(&content).map_err(|_| ToolError::Schema(slug.label()))?;
    serde_json::to_string_pretty(&value).map_err(|e| ToolError::Execution(e.to_string()))
}
