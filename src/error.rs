use thiserror::Error;

use crate::docs::schema::SchemaError;

/// Failures local to a single tool call. Every variant is rendered into the
/// tool-result text the model sees, so the `Display` output is user-facing.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Error: Invalid input.")]
    InvalidInput,

    #[error("Error: {0}")]
    Validation(String),

    #[error("Error: Failed to parse {0} document.")]
    Schema(&'static str),

    #[error("Error: {0}")]
    NotFound(String),

    #[error("Got a non-empty stderr output:\n{0}")]
    Stderr(String),

    #[error("Error: {0}")]
    Execution(String),

    #[error("Error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl From<SchemaError> for ToolError {
    fn from(err: SchemaError) -> Self {
        ToolError::Schema(err.label)
    }
}

/// Failures talking to a remote model service.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("stream error: {0}")]
    Stream(String),

    #[error("malformed response: {0}")]
    Decode(String),
}

/// Errors that end a turn early.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("model call failed: {0}")]
    Collaborator(#[from] LlmError),

    #[error("model requested a tool outside the registry: {0}")]
    UnknownTool(String),

    #[error("storage failure: {0:#}")]
    Store(#[from] anyhow::Error),
}
