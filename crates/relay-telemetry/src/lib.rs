mod capture;
mod logger;

pub use capture::{CapturedLogs, CapturedRecord};
pub use logger::{Logger, Scoped};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log filter: {0}")]
    InvalidFilter(String),
    #[error("subscriber already installed: {0}")]
    AlreadyInitialized(String),
    #[error("filter reload failed: {0}")]
    Reload(String),
}

/// Configuration for the process-wide subscriber.
#[derive(Clone, Debug)]
pub struct LoggingConfig {
    /// Default level. Overridden by the RUST_LOG env var.
    pub level: Level,
    /// Per-module overrides (e.g. "relay_engine" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl LoggingConfig {
    pub fn filter_directive(&self) -> String {
        let mut filter = self.level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Handle to the installed subscriber's level filter.
pub struct LoggingGuard {
    handle: reload::Handle<EnvFilter, Registry>,
    default_directive: String,
}

impl LoggingGuard {
    /// Replace the active filter, e.g. `"debug"` or `"info,relay_engine=trace"`.
    pub fn set_level(&self, directive: &str) -> Result<(), TelemetryError> {
        let filter =
            EnvFilter::try_new(directive).map_err(|e| TelemetryError::InvalidFilter(e.to_string()))?;
        self.handle
            .reload(filter)
            .map_err(|e| TelemetryError::Reload(e.to_string()))
    }

    /// Restore the filter the subscriber was installed with.
    pub fn reset_level(&self) -> Result<(), TelemetryError> {
        self.set_level(&self.default_directive)
    }

    pub fn default_directive(&self) -> &str {
        &self.default_directive
    }
}

/// Install the process-wide subscriber. Call once at startup.
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuard, TelemetryError> {
    let default_directive = config.filter_directive();
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&default_directive))
        .map_err(|e| TelemetryError::InvalidFilter(e.to_string()))?;
    let (filter_layer, handle) = reload::Layer::new(env_filter);

    let (json_layer, text_layer) = if config.json {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_span_list(true),
            ),
            None,
        )
    } else {
        (None, Some(tracing_subscriber::fmt::layer().with_target(true)))
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e| TelemetryError::AlreadyInitialized(e.to_string()))?;

    Ok(LoggingGuard {
        handle,
        default_directive,
    })
}

/// Parse a level name such as `"warn"`.
pub fn parse_level(value: &str) -> Option<Level> {
    value.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_directive_includes_modules() {
        let config = LoggingConfig {
            level: Level::WARN,
            module_levels: vec![("relay_engine".into(), Level::DEBUG)],
            json: true,
        };
        assert_eq!(config.filter_directive(), "warn,relay_engine=debug");
    }

    #[test]
    fn parse_level_accepts_names() {
        assert_eq!(parse_level("debug"), Some(Level::DEBUG));
        assert_eq!(parse_level(" WARN "), Some(Level::WARN));
        assert_eq!(parse_level("loud"), None);
    }

    // The only test in this crate that installs the global subscriber.
    #[test]
    fn init_then_adjust_level() {
        let guard = init_logging(&LoggingConfig::default()).unwrap();
        assert_eq!(guard.default_directive(), "info");
        guard.set_level("debug,relay_engine=trace").unwrap();
        assert!(matches!(
            guard.set_level("relay=notalevel"),
            Err(TelemetryError::InvalidFilter(_))
        ));
        guard.reset_level().unwrap();
        assert!(init_logging(&LoggingConfig::default()).is_err());
    }
}
