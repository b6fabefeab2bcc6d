//! Document contracts for the structured slugs.
//!
//! Every reader and writer goes through [`StructuredDocument::parse`], so the
//! shape and the numeric constraints of each document live in one place.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::types::Slug;

#[derive(Debug, Error)]
#[error("invalid {label} document: {detail}")]
pub struct SchemaError {
    pub label: &'static str,
    pub detail: String,
}

pub trait StructuredDocument: Serialize + DeserializeOwned {
    const SLUG: Slug;
    const LABEL: &'static str = Self::SLUG.label();

    /// Constraints serde cannot express.
    fn check(&self) -> Result<(), String>;

    /// Parse stored content. Empty content is treated as `{}`.
    fn parse(raw: &str) -> Result<Self, SchemaError> {
        let raw = if raw.trim().is_empty() { "{}" } else { raw };
        let doc: Self = serde_json::from_str(raw).map_err(|e| SchemaError {
            label: Self::LABEL,
            detail: e.to_string(),
        })?;
        doc.check().map_err(|detail| SchemaError {
            label: Self::LABEL,
            detail,
        })?;
        Ok(doc)
    }

    fn to_content(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn non_negative(field: &str, value: f64) -> Result<(), String> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(format!("{field} must be a non-negative number"))
    }
}

fn non_negative_opt(field: &str, value: Option<f64>) -> Result<(), String> {
    value.map_or(Ok(()), |v| non_negative(field, v))
}

// ── Config ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub target_daily_intake_calories: f64,
    pub target_daily_intake_protein: f64,
    pub target_weight_date: DateTime<Utc>,
    pub target_weight_value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<String>,
    #[serde(default)]
    pub memory_entries: Vec<String>,
}

impl StructuredDocument for Config {
    const SLUG: Slug = Slug::Config;

    fn check(&self) -> Result<(), String> {
        non_negative("targetDailyIntakeCalories", self.target_daily_intake_calories)?;
        non_negative("targetDailyIntakeProtein", self.target_daily_intake_protein)?;
        non_negative("targetWeightValue", self.target_weight_value)
    }
}

// ── Log ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoodEntry {
    pub id: Uuid,
    pub ts: DateTime<Utc>,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kcal: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protein: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carbs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fat: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightEntry {
    pub id: Uuid,
    pub ts: DateTime<Utc>,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LogEntry {
    Food(FoodEntry),
    Weight(WeightEntry),
}

impl LogEntry {
    pub fn id(&self) -> Uuid {
        match self {
            LogEntry::Food(e) => e.id,
            LogEntry::Weight(e) => e.id,
        }
    }

    pub fn ts(&self) -> DateTime<Utc> {
        match self {
            LogEntry::Food(e) => e.ts,
            LogEntry::Weight(e) => e.ts,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LogEntry::Food(_) => "food",
            LogEntry::Weight(_) => "weight",
        }
    }

    fn check(&self) -> Result<(), String> {
        match self {
            LogEntry::Food(e) => {
                if e.description.is_empty() {
                    return Err(format!("food entry {} has an empty description", e.id));
                }
                non_negative_opt("kcal", e.kcal)?;
                non_negative_opt("protein", e.protein)?;
                non_negative_opt("carbs", e.carbs)?;
                non_negative_opt("fat", e.fat)
            }
            LogEntry::Weight(e) => non_negative("weight", e.weight),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Log {
    #[serde(default)]
    pub entries: Vec<LogEntry>,
}

impl Log {
    /// Append and restore timestamp order. The sort is stable, so entries
    /// sharing a timestamp keep their insertion order.
    pub fn append(&mut self, entry: LogEntry) {
        self.entries.push(entry);
        self.entries.sort_by_key(LogEntry::ts);
    }

    pub fn remove(&mut self, id: Uuid) -> Option<LogEntry> {
        let index = self.entries.iter().position(|e| e.id() == id)?;
        Some(self.entries.remove(index))
    }
}

impl StructuredDocument for Log {
    const SLUG: Slug = Slug::Log;

    fn check(&self) -> Result<(), String> {
        let mut seen = HashSet::with_capacity(self.entries.len());
        for entry in &self.entries {
            entry.check()?;
            if !seen.insert(entry.id()) {
                return Err(format!("duplicate log entry id {}", entry.id()));
            }
        }
        Ok(())
    }
}

// ── Known ingredients ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub enum Unit {
    #[serde(rename = "g")]
    Grams,
    #[serde(rename = "ml")]
    Milliliters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Nutrients {
    pub kcal: f64,
    pub protein: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carbs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fat: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ingredient {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    pub unit: Unit,
    pub nutrients: Nutrients,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnownIngredients {
    #[serde(default)]
    pub ingredients: Vec<Ingredient>,
}

impl StructuredDocument for KnownIngredients {
    const SLUG: Slug = Slug::KnownIngredients;

    fn check(&self) -> Result<(), String> {
        for ingredient in &self.ingredients {
            if ingredient.name.is_empty() {
                return Err(format!("ingredient {} has an empty name", ingredient.id));
            }
            let n = &ingredient.nutrients;
            non_negative("kcal", n.kcal)?;
            non_negative("protein", n.protein)?;
            non_negative_opt("carbs", n.carbs)?;
            non_negative_opt("fat", n.fat)?;
        }
        Ok(())
    }
}

/// Validate content destined for `slug` without writing it.
pub fn validate_content(slug: Slug, content: &str) -> Result<(), SchemaError> {
    match slug {
        Slug::Config => Config::parse(content).map(drop),
        Slug::Log => Log::parse(content).map(drop),
        Slug::KnownIngredients => KnownIngredients::parse(content).map(drop),
        Slug::TrainingProgram => Ok(()),
    }
}
