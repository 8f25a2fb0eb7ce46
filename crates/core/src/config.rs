//! Workspace configuration.
//!
//! Every process sharing a coordination database reads the same
//! `config.json` from the storage directory, falling back to defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Retry bound used when a feedback loop is created without one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Values that parse but make no sense
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Portline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the database and this file
    pub storage_dir: PathBuf,

    /// Database file name inside `storage_dir`
    pub database: String,

    /// Retry bound for feedback loops created without one
    pub default_max_retries: u32,

    /// Thresholds for the built-in escalation triggers
    pub triggers: TriggerThresholds,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from(".portline"),
            database: "portline.db".to_string(),
            default_max_retries: DEFAULT_MAX_RETRIES,
            triggers: TriggerThresholds::default(),
        }
    }
}

impl Config {
    /// Name of the config file inside the storage directory.
    pub const FILE_NAME: &'static str = "config.json";

    /// Load `config.json` from `storage_dir`, or defaults when it is absent.
    ///
    /// `storage_dir` always wins over any directory recorded in the file.
    pub fn load(storage_dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let storage_dir = storage_dir.as_ref();
        let path = storage_dir.join(Self::FILE_NAME);

        let mut config = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str::<Config>(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(e.into()),
        };
        config.storage_dir = storage_dir.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    /// Write this configuration to `<storage_dir>/config.json`.
    pub fn save(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.storage_dir)?;
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(self.storage_dir.join(Self::FILE_NAME), raw)?;
        Ok(())
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.trim().is_empty() {
            return Err(ConfigError::Invalid("database name is empty".to_string()));
        }
        if self.default_max_retries == 0 {
            return Err(ConfigError::Invalid(
                "default_max_retries must be positive".to_string(),
            ));
        }
        self.triggers.validate()
    }

    /// Full path of the database file.
    pub fn database_path(&self) -> PathBuf {
        self.storage_dir.join(&self.database)
    }
}

/// Budget thresholds for the built-in triggers, as fractions of the budget.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerThresholds {
    /// Usage at which the low-severity warning fires
    pub budget_warning_ratio: f64,

    /// Usage at which the near-exhaustion escalation fires
    pub budget_exhausted_ratio: f64,
}

impl Default for TriggerThresholds {
    fn default() -> Self {
        Self {
            budget_warning_ratio: 0.80,
            budget_exhausted_ratio: 0.95,
        }
    }
}

impl TriggerThresholds {
    /// Require `0 < warning < exhausted <= 1`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ok = self.budget_warning_ratio > 0.0
            && self.budget_warning_ratio < self.budget_exhausted_ratio
            && self.budget_exhausted_ratio <= 1.0;
        if ok {
            Ok(())
        } else {
            Err(ConfigError::Invalid(format!(
                "budget ratios must satisfy 0 < warning ({}) < exhausted ({}) <= 1",
                self.budget_warning_ratio, self.budget_exhausted_ratio
            )))
        }
    }
}
