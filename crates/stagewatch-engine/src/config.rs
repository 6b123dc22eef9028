use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const STAGE_PERIOD_ENV: &str = "STAGEWATCH_STAGE_PERIOD_MS";
pub const OUTPUT_PERIOD_ENV: &str = "STAGEWATCH_OUTPUT_PERIOD_MS";
pub const DETAIL_PERIOD_ENV: &str = "STAGEWATCH_DETAIL_PERIOD_MS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: &'static str, value: String },
    #[error("{field} must be greater than zero")]
    ZeroPeriod { field: &'static str },
}

/// Poll periods of every engine component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingConfig {
    pub stage_period: Duration,
    pub output_period: Duration,
    pub detail_period: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            stage_period: Duration::from_secs(5),
            output_period: Duration::from_secs(3),
            detail_period: Duration::from_secs(5),
        }
    }
}

/// `[polling]` table as written in TOML files, in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PollingTable {
    pub stage_period_ms: Option<u64>,
    pub output_period_ms: Option<u64>,
    pub detail_period_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PollingDocument {
    #[serde(default)]
    polling: PollingTable,
}

impl PollingConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let document: PollingDocument = toml::from_str(contents)?;
        let mut config = Self::default();
        config.apply_table(&document.polling);
        config.validate()?;
        Ok(config)
    }

    /// Missing files fall back to the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn apply_table(&mut self, table: &PollingTable) {
        if let Some(ms) = table.stage_period_ms {
            self.stage_period = Duration::from_millis(ms);
        }
        if let Some(ms) = table.output_period_ms {
            self.output_period = Duration::from_millis(ms);
        }
        if let Some(ms) = table.detail_period_ms {
            self.detail_period = Duration::from_millis(ms);
        }
    }

    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    pub fn apply_env_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut table = PollingTable::default();
        for (key, slot) in [
            (STAGE_PERIOD_ENV, &mut table.stage_period_ms),
            (OUTPUT_PERIOD_ENV, &mut table.output_period_ms),
            (DETAIL_PERIOD_ENV, &mut table.detail_period_ms),
        ] {
            let Some(value) = lookup(key).filter(|value| !value.trim().is_empty()) else {
                continue;
            };
            let ms = value
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidEnv { key, value })?;
            *slot = Some(ms);
        }
        self.apply_table(&table);
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, period) in [
            ("stage_period", self.stage_period),
            ("output_period", self.output_period),
            ("detail_period", self.detail_period),
        ] {
            if period.is_zero() {
                return Err(ConfigError::ZeroPeriod { field });
            }
        }
        Ok(())
    }
}
