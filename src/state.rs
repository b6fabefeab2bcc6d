use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono_tz::Tz;

use crate::agent::TurnEngine;
use crate::docs::DocumentStore;
use crate::llm::Transcriber;

const DEFAULT_TIME_ZONE: Tz = chrono_tz::Europe::Helsinki;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match dotenv::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("Invalid {}={:?}: {}", key, raw, e)),
        Err(_) => Ok(default),
    }
}

/// Turn engine tunables.
#[derive(Debug, Clone, Copy)]
pub struct AgentConfig {
    /// Model calls allowed per turn.
    pub max_turns: usize,
    pub time_zone: Tz,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: 16,
            time_zone: DEFAULT_TIME_ZONE,
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let time_zone = match dotenv::var("COACH_TIME_ZONE") {
            Ok(name) => name
                .trim()
                .parse::<Tz>()
                .map_err(|e| anyhow!("Invalid COACH_TIME_ZONE={:?}: {}", name, e))?,
            Err(_) => defaults.time_zone,
        };
        Ok(Self {
            max_turns: env_or("MAX_TURNS", defaults.max_turns)?,
            time_zone,
        })
    }
}

/// Process settings read once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_path: PathBuf,
    pub reference_data_path: PathBuf,
    pub bind_addr: String,
    pub search_batch_size: usize,
    pub agent: AgentConfig,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let search_batch_size = env_or("SEARCH_BATCH_SIZE", 512usize)?;
        if search_batch_size == 0 {
            return Err(anyhow!("SEARCH_BATCH_SIZE must be positive"));
        }
        Ok(Self {
            database_path: env_or("DATABASE_PATH", PathBuf::from("./data/coach.db"))?,
            reference_data_path: env_or(
                "REFERENCE_DATA_PATH",
                PathBuf::from("./data/fineli/fineli.json"),
            )?,
            bind_addr: dotenv::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8000".to_string()),
            search_batch_size,
            agent: AgentConfig::from_env().context("Failed to read agent settings")?,
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<DocumentStore>,
    pub engine: Arc<TurnEngine>,
    pub transcriber: Arc<dyn Transcriber>,
    pub time_zone: Tz,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.max_turns, 16);
        assert_eq!(config.time_zone.name(), "Europe/Helsinki");
    }

    #[test]
    fn test_env_or_falls_back_and_rejects_garbage() {
        assert_eq!(env_or("COACH_TEST_UNSET_VALUE", 7usize).unwrap(), 7);

        std::env::set_var("COACH_TEST_BAD_VALUE", "many");
        assert!(env_or("COACH_TEST_BAD_VALUE", 7usize).is_err());
    }
}
