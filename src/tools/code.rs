use schemars::JsonSchema;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::error::ToolError;
use crate::sandbox::{ExecOutput, Sandbox};

use super::ToolInput;

pub const DESCRIPTION: &str = r#"Execute Python code and return what it prints to stdout.

The environment is restricted to computation. Only these modules can be imported: math, cmath, statistics, datetime, calendar, json, re, string, collections, itertools, functools, fractions, decimal and random. Other modules (os, sys, subprocess and so on) and packages like numpy or pandas fail to import. Files, network access and user input are not available, and names starting with an underscore cannot be accessed.

Every call starts from a clean namespace: variables and imports do not carry over between calls. Output written to stderr is returned as an error. When nothing is printed, a success message is returned."#;

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct ExecuteCodeInput {
    /// The Python code to execute.
    pub code: String,
}

impl ToolInput for ExecuteCodeInput {
    fn check(&self) -> Result<(), ToolError> {
        if self.code.is_empty() {
            return Err(ToolError::InvalidInput);
        }
        Ok(())
    }
}

fn render(output: ExecOutput) -> Result<String, ToolError> {
    if let Some(exception) = output.exception {
        return Err(ToolError::Execution(exception));
    }
    if !output.stderr.is_empty() {
        return Err(ToolError::Stderr(output.stderr));
    }
    if output.stdout.is_empty() {
        return Ok("Code executed successfully (no output).".to_string());
    }
    Ok(output.stdout)
}

pub async fn execute_code(
    sandbox: &Sandbox,
    input: ExecuteCodeInput,
    cancel: &CancellationToken,
) -> Result<String, ToolError> {
    let output = sandbox
        .execute(&input.code, cancel)
        .await
        .map_err(|e| ToolError::Execution(e.to_string()))?;
    render(output)
}
