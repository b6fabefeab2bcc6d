use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::clock;
use crate::docs::schema::{Config, Log, LogEntry, StructuredDocument};
use crate::docs::types::Slug;
use crate::state::AppState;

use super::ApiResult;

const WEIGHT_HISTORY_DAYS: i64 = 180;
const RECENT_MEMORIES: usize = 5;

#[derive(Debug, Serialize, PartialEq)]
pub struct Intake {
    pub kcal: f64,
    pub protein: f64,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct WeightPoint {
    pub date: DateTime<Utc>,
    pub weight: f64,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct FoodLogItem {
    pub ts: DateTime<Utc>,
    pub label: String,
    pub kcal: Option<f64>,
    pub protein: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub config: Config,
    pub food_intake_today: Intake,
    pub weight_history: Vec<WeightPoint>,
    pub food_log_today: Vec<FoodLogItem>,
    pub recent_memories: Vec<String>,
}

/// Dashboard view over the config and log. "Today" is the calendar date in
/// `tz`.
pub fn build_summary(config: Config, log: &Log, now: DateTime<Utc>, tz: Tz) -> Summary {
    let today = clock::local_date(now, tz);
    let history_start = now - Duration::days(WEIGHT_HISTORY_DAYS);

    let mut intake = Intake {
        kcal: 0.0,
        protein: 0.0,
    };
    let mut food_log_today = Vec::new();
    let mut weight_history = Vec::new();

    for entry in &log.entries {
        match entry {
            LogEntry::Food(food) if clock::local_date(food.ts, tz) == today => {
                intake.kcal += food.kcal.unwrap_or(0.0);
                intake.protein += food.protein.unwrap_or(0.0);
                food_log_today.push(FoodLogItem {
                    ts: food.ts,
                    label: food.description.clone(),
                    kcal: food.kcal,
                    protein: food.protein,
                });
            }
            LogEntry::Weight(weight) if weight.ts >= history_start => {
                weight_history.push(WeightPoint {
                    date: weight.ts,
                    weight: weight.weight,
                });
            }
            _ => {}
        }
    }

    let skip = config.memory_entries.len().saturating_sub(RECENT_MEMORIES);
    let recent_memories = config.memory_entries[skip..].to_vec();

    Summary {
        config,
        food_intake_today: intake,
        weight_history,
        food_log_today,
        recent_memories,
    }
}

pub async fn summary(State(state): State<AppState>) -> ApiResult<Json<Summary>> {
    let config = Config::parse(&state.store.read(Slug::Config).await?)?;
    let log = Log::parse(&state.store.read(Slug::Log).await?)?;
    Ok(Json(build_summary(config, &log, Utc::now(), state.time_zone)))
}
