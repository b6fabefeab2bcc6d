use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of a singleton document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Slug {
    Config,
    Log,
    KnownIngredients,
    TrainingProgram,
}

impl Slug {
    pub const ALL: [Slug; 4] = [
        Slug::Config,
        Slug::Log,
        Slug::KnownIngredients,
        Slug::TrainingProgram,
    ];

    /// Documents created empty on first start.
    pub const SEEDED: [Slug; 3] = [Slug::TrainingProgram, Slug::KnownIngredients, Slug::Log];

    pub fn as_str(&self) -> &'static str {
        match self {
            Slug::Config => "config",
            Slug::Log => "log",
            Slug::KnownIngredients => "known-ingredients",
            Slug::TrainingProgram => "training-program",
        }
    }

    /// Name used in validation messages.
    pub const fn label(&self) -> &'static str {
        match self {
            Slug::Config => "config",
            Slug::Log => "log",
            Slug::KnownIngredients => "known ingredients",
            Slug::TrainingProgram => "training program",
        }
    }

    /// Whether the content is JSON (and therefore pretty-printed when read).
    pub fn is_structured(&self) -> bool {
        !matches!(self, Slug::TrainingProgram)
    }

    /// Short explanation shown to the model in the ReadDocument description.
    pub fn summary(&self) -> &'static str {
        match self {
            Slug::Config => {
                "The user's configuration: daily intake targets, weight goal, profile and saved memories."
            }
            Slug::Log => {
                "Chronological log of food intake and weight measurements. Use the Append*LogEntry tools to add entries."
            }
            Slug::KnownIngredients => {
                "User-saved foods and ingredients with nutritional values. Always prefer these over other sources."
            }
            Slug::TrainingProgram => "The user's current training program.",
        }
    }
}

impl fmt::Display for Slug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown document slug: {0}")]
pub struct UnknownSlug(pub String);

impl FromStr for Slug {
    type Err = UnknownSlug;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Slug::ALL
            .into_iter()
            .find(|slug| slug.as_str() == s)
            .ok_or_else(|| UnknownSlug(s.to_string()))
    }
}

/// A stored document row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRecord {
    pub slug: Slug,
    pub content: String,
    pub created_at: String,
    pub updated_at: String,
}
