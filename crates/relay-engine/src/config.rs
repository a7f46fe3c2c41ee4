//! Run configuration and conversions from loaded settings.

use std::path::Path;
use std::sync::Arc;

use relay_core::model::StreamingMode;
use relay_settings::{LoggingSettings, RunnerSettings, SessionBackend, SessionSettings};
use relay_store::{InMemorySessionService, SessionService, SqliteSessionService};
use relay_telemetry::{parse_level, LoggingConfig};

use crate::error::EngineError;

pub const DEFAULT_MAX_LLM_CALLS: u32 = 500;

/// Per-run knobs shared by every agent of an invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct RunConfig {
    pub streaming_mode: StreamingMode,
    /// Model calls allowed per invocation. 0 disables the limit.
    pub max_llm_calls: u32,
    pub save_input_blobs_as_artifacts: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            streaming_mode: StreamingMode::None,
            max_llm_calls: DEFAULT_MAX_LLM_CALLS,
            save_input_blobs_as_artifacts: false,
        }
    }
}

impl From<&RunnerSettings> for RunConfig {
    fn from(settings: &RunnerSettings) -> Self {
        Self {
            streaming_mode: settings.streaming_mode,
            max_llm_calls: settings.max_llm_calls,
            save_input_blobs_as_artifacts: settings.save_input_blobs_as_artifacts,
        }
    }
}

pub fn logging_config(settings: &LoggingSettings) -> Result<LoggingConfig, EngineError> {
    let level = parse_level(&settings.level)
        .ok_or_else(|| EngineError::Configuration(format!("unknown log level {}", settings.level)))?;
    let module_levels = settings
        .modules
        .iter()
        .map(|(module, level)| {
            parse_level(level)
                .map(|l| (module.clone(), l))
                .ok_or_else(|| EngineError::Configuration(format!("unknown log level {level} for {module}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(LoggingConfig {
        level,
        module_levels,
        json: settings.json,
    })
}

/// Builds the configured session backend.
pub fn session_service(settings: &SessionSettings) -> Result<Arc<dyn SessionService>, EngineError> {
    match settings.backend {
        SessionBackend::Memory => Ok(Arc::new(InMemorySessionService::new())),
        SessionBackend::Sqlite => {
            let path = settings.sqlite_path.as_deref().ok_or_else(|| {
                EngineError::Configuration("sqlite session backend needs a path".into())
            })?;
            Ok(Arc::new(SqliteSessionService::open(Path::new(path))?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_settings::RelaySettings;
    use tracing::Level;

    #[test]
    fn run_config_from_settings() {
        let mut settings = RelaySettings::default();
        settings.runner.max_llm_calls = 7;
        settings.runner.streaming_mode = StreamingMode::Sse;
        let config = RunConfig::from(&settings.runner);
        assert_eq!(config.max_llm_calls, 7);
        assert_eq!(config.streaming_mode, StreamingMode::Sse);
        assert_eq!(RunConfig::from(&RunnerSettings::default()), RunConfig::default());
    }

    #[test]
    fn logging_config_from_settings() {
        let mut settings = LoggingSettings::default();
        settings.level = "warn".into();
        settings.modules.insert("relay_engine".into(), "trace".into());
        let config = logging_config(&settings).unwrap();
        assert_eq!(config.level, Level::WARN);
        assert_eq!(config.module_levels, vec![("relay_engine".to_string(), Level::TRACE)]);
    }

    #[test]
    fn logging_config_rejects_unknown_level() {
        let mut settings = LoggingSettings::default();
        settings.level = "loud".into();
        assert!(matches!(logging_config(&settings), Err(EngineError::Configuration(_))));
    }

    #[tokio::test]
    async fn sqlite_backend_from_settings() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SessionSettings {
            backend: SessionBackend::Sqlite,
            sqlite_path: Some(dir.path().join("s.db").to_string_lossy().into_owned()),
        };
        let service = session_service(&settings).unwrap();
        let session = service.create_session("app", "u", None, None).await.unwrap();
        assert!(service
            .get_session("app", "u", &session.id, None)
            .await
            .unwrap()
            .is_some());
    }
}
