use schemars::JsonSchema;
use serde::Deserialize;
use uuid::Uuid;

use crate::docs::schema::{Ingredient, KnownIngredients, Nutrients, StructuredDocument, Unit};
use crate::docs::types::Slug;
use crate::docs::DocumentStore;
use crate::error::ToolError;

use super::ToolInput;

pub const DESCRIPTION: &str = "Insert a new known ingredient, or update an existing one by passing its ID. Nutritional values are per 100 g or 100 ml depending on the unit.";

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct UpsertKnownIngredientInput {
    /// ID of an existing ingredient to update. Leave empty to add a new one.
    #[serde(default)]
    pub id: Option<String>,
    /// Name of the ingredient.
    pub name: String,
    /// Optional brand, if the user provided one.
    #[serde(default)]
    pub brand: Option<String>,
    /// 'g' for grams or 'ml' for millilitres.
    pub unit: Unit,
    /// Energy per 100 g or 100 ml.
    #[schemars(range(min = 0))]
    pub kcal: f64,
    /// Protein per 100 g or 100 ml, in grams.
    #[schemars(range(min = 0))]
    pub protein: f64,
    /// Optional carbohydrates per 100 g or 100 ml, in grams.
    #[serde(default)]
    #[schemars(range(min = 0))]
    pub carbs: Option<f64>,
    /// Optional fat per 100 g or 100 ml, in grams.
    #[serde(default)]
    #[schemars(range(min = 0))]
    pub fat: Option<f64>,
}

impl ToolInput for UpsertKnownIngredientInput {
    fn check(&self) -> Result<(), ToolError> {
        if self.name.trim().is_empty() {
            return Err(ToolError::InvalidInput);
        }
        if let Some(id) = self.id.as_deref().filter(|id| !id.is_empty()) {
            Uuid::parse_str(id).map_err(|_| ToolError::InvalidInput)?;
        }
        let values = [Some(self.kcal), Some(self.protein), self.carbs, self.fat];
        if values
            .into_iter()
            .flatten()
            .any(|v| !v.is_finite() || v < 0.0)
        {
            return Err(ToolError::InvalidInput);
        }
        Ok(())
    }
}

pub async fn upsert_ingredient(
    store: &DocumentStore,
    input: UpsertKnownIngredientInput,
) -> Result<String, ToolError> {
    let id = match input.id.as_deref().filter(|id| !id.is_empty()) {
        Some(raw) => Some(Uuid::parse_str(raw).map_err(|_| ToolError::InvalidInput)?),
        None => None,
    };
    let mut known = KnownIngredients::parse(&store.read(Slug::KnownIngredients).await?)?;

    let nutrients = Nutrients {
        kcal: input.kcal,
        protein: input.protein,
        carbs: input.carbs,
        fat: input.fat,
    };
    let brand = input.brand.filter(|b| !b.trim().is_empty());

    let verb = match id {
        Some(id) => {
            let existing = known
                .ingredients
                .iter_mut()
                .find(|i| i.id == id)
                .ok_or_else(|| ToolError::NotFound(format!("Ingredient with ID {} not found.", id)))?;
            existing.name = input.name;
            existing.brand = brand;
            existing.unit = input.unit;
            existing.nutrients = nutrients;
            "updated"
        }
        None => {
            known.ingredients.push(Ingredient {
                id: Uuid::new_v4(),
                name: input.name,
                brand,
                unit: input.unit,
                nutrients,
            });
            "added"
        }
    };
    store
        .upsert(Slug::KnownIngredients, &known.to_content()?)
        .await?;

    Ok(format!("Ingredient {} successfully.", verb))
}
