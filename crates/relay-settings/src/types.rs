//! Settings type definitions.
//!
//! Field names are camelCase in JSON. Every section has `#[serde(default)]`, so a
//! partial file only overrides what it names.

use std::collections::BTreeMap;

use relay_core::model::StreamingMode;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    pub runner: RunnerSettings,
    pub logging: LoggingSettings,
    pub session: SessionSettings,
}

impl RelaySettings {
    /// Checks cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.session.backend == SessionBackend::Sqlite && self.session.sqlite_path.is_none() {
            return Err(SettingsError::InvalidValue(
                "session.sqlitePath is required for the sqlite backend".into(),
            ));
        }
        if !is_level(&self.logging.level) {
            return Err(SettingsError::InvalidValue(format!(
                "logging.level: unknown level {}",
                self.logging.level
            )));
        }
        if let Some((module, level)) = self.logging.modules.iter().find(|(_, l)| !is_level(l)) {
            return Err(SettingsError::InvalidValue(format!(
                "logging.modules.{module}: unknown level {level}"
            )));
        }
        Ok(())
    }
}

fn is_level(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "trace" | "debug" | "info" | "warn" | "error"
    )
}

/// Defaults applied to every run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerSettings {
    /// Model calls allowed per invocation. 0 disables the limit.
    pub max_llm_calls: u32,
    pub streaming_mode: StreamingMode,
    /// Store inline data from user messages as artifacts instead of sending it to the model.
    pub save_input_blobs_as_artifacts: bool,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            max_llm_calls: 500,
            streaming_mode: StreamingMode::None,
            save_input_blobs_as_artifacts: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    /// Per-module level overrides, e.g. `{"relay_engine": "debug"}`.
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            modules: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    pub backend: SessionBackend,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sqlite_path: Option<String>,
}
