use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use regex::Regex;
use schemars::JsonSchema;
use serde::Deserialize;
use uuid::Uuid;

use crate::docs::schema::{FoodEntry, Log, LogEntry, StructuredDocument, WeightEntry};
use crate::docs::types::Slug;
use crate::docs::DocumentStore;
use crate::error::ToolError;

use super::ToolInput;

pub const APPEND_FOOD_DESCRIPTION: &str = r#"Append a food intake entry to the user's log. Leave 'date' empty unless the user names a specific day.

Prefer one entry per meal or sitting, even when it lists several foods; only split items into separate entries when the user asks for it.

Estimate nutrition in this order: the user's known-ingredients document first (always read it before logging), then the reference database for foods that matter to the totals, then general knowledge for common items. If you are less than about 90% sure of the values or the description is too vague, ask the user before logging, but do not ask for confirmation on every entry.

After logging, reply with a short summary of what was recorded and its nutritional values so the user can correct mistakes."#;

pub const APPEND_WEIGHT_DESCRIPTION: &str = "Append a body weight measurement (in kilograms) to the user's log. Leave 'date' empty unless the user names a specific day.";

pub const REMOVE_DESCRIPTION: &str = "Remove an entry from the user's log by its ID. Read the log first to find the ID of the entry to remove.";

static DATE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("date pattern is valid"));

fn non_negative(value: Option<f64>) -> Result<(), ToolError> {
    match value {
        Some(v) if !v.is_finite() || v < 0.0 => Err(ToolError::InvalidInput),
        _ => Ok(()),
    }
}

/// Midnight UTC of an explicit `YYYY-MM-DD` date, or now when absent.
fn entry_timestamp(date: Option<&str>) -> Result<DateTime<Utc>, ToolError> {
    let Some(date) = date.map(str::trim).filter(|d| !d.is_empty()) else {
        return Ok(Utc::now());
    };
    let invalid = || ToolError::Validation("Date must be in YYYY-MM-DD format.".to_string());
    if !DATE_PATTERN.is_match(date) {
        return Err(invalid());
    }
    let day = NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| invalid())?;
    Ok(day.and_time(NaiveTime::MIN).and_utc())
}

async fn write_log(store: &DocumentStore, log: &Log) -> Result<(), ToolError> {
    store.upsert(Slug::Log, &log.to_content()?).await?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct AppendFoodLogEntryInput {
    /// Optional date of the meal in YYYY-MM-DD format (e.g. '2024-10-01'). Defaults to the current time.
    #[serde(default)]
    pub date: Option<String>,
    /// What was eaten, e.g. 'Kaksi siivua ruisleipää, 1 dl maitoa, 1 banaani'.
    pub description: String,
    /// Optional extra notes. Only include when the user asks for them.
    #[serde(default)]
    pub notes: Option<String>,
    /// Best-effort estimate of energy in kcal.
    #[schemars(range(min = 0))]
    pub kcal: f64,
    /// Best-effort estimate of protein in grams.
    #[schemars(range(min = 0))]
    pub protein: f64,
    /// Optional estimate of carbohydrates in grams.
    #[serde(default)]
    #[schemars(range(min = 0))]
    pub carbs: Option<f64>,
    /// Optional estimate of fat in grams.
    #[serde(default)]
    #[schemars(range(min = 0))]
    pub fat: Option<f64>,
}

impl ToolInput for AppendFoodLogEntryInput {
    fn check(&self) -> Result<(), ToolError> {
        if self.description.trim().is_empty() {
            return Err(ToolError::InvalidInput);
        }
        non_negative(Some(self.kcal))?;
        non_negative(Some(self.protein))?;
        non_negative(self.carbs)?;
        non_negative(self.fat)
    }
}

pub async fn append_food(
    store: &DocumentStore,
    input: AppendFoodLogEntryInput,
) -> Result<String, ToolError> {
    let ts = entry_timestamp(input.date.as_deref())?;
    let mut log = Log::parse(&store.read(Slug::Log).await?)?;

    let id = Uuid::new_v4();
    log.append(LogEntry::Food(FoodEntry {
        id,
        ts,
        description: input.description,
        notes: input.notes.filter(|n| !n.trim().is_empty()),
        kcal: Some(input.kcal),
        protein: Some(input.protein),
        carbs: input.carbs,
        fat: input.fat,
    }));
    write_log(store, &log).await?;

    Ok(format!("Food log entry recorded (id: {}).", id))
}

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct AppendWeightLogEntryInput {
    /// Optional date of the measurement in YYYY-MM-DD format. Defaults to the current time.
    #[serde(default)]
    pub date: Option<String>,
    /// The weight in kilograms.
    pub weight: f64,
}

impl ToolInput for AppendWeightLogEntryInput {
    fn check(&self) -> Result<(), ToolError> {
        if !self.weight.is_finite() || self.weight <= 0.0 {
            return Err(ToolError::Validation(
                "Weight must be a positive number.".to_string(),
            ));
        }
        Ok(())
    }
}

pub async fn append_weight(
    store: &DocumentStore,
    input: AppendWeightLogEntryInput,
) -> Result<String, ToolError> {
    let ts = entry_timestamp(input.date.as_deref())?;
    let mut log = Log::parse(&store.read(Slug::Log).await?)?;

    let id = Uuid::new_v4();
    log.append(LogEntry::Weight(WeightEntry {
        id,
        ts,
        weight: input.weight,
    }));
    write_log(store, &log).await?;

    Ok(format!("Weight log entry recorded (id: {}).", id))
}

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct RemoveLogEntryInput {
    /// The ID of the log entry to remove.
    pub id: String,
}

impl ToolInput for RemoveLogEntryInput {}

pub async fn remove_entry(
    store: &DocumentStore,
    input: RemoveLogEntryInput,
) -> Result<String, ToolError> {
    let mut log = Log::parse(&store.read(Slug::Log).await?)?;

    let not_found = || ToolError::NotFound(format!("Log entry with ID {} not found.", input.id));
    let id = Uuid::parse_str(input.id.trim()).map_err(|_| not_found())?;
    let removed = log.remove(id).ok_or_else(not_found)?;
    write_log(store, &log).await?;

    Ok(format!(
        "Log entry removed (id: {}, type: {}).",
        id,
        removed.kind()
    ))
}
