use std::sync::Arc;

use regex::Regex;
use tracing::debug;

use relay_core::errors::ModelError;
use relay_core::model::Model;

/// Builds a model for a model string matched by a registered pattern.
pub type ModelFactory = Arc<dyn Fn(&str) -> Result<Arc<dyn Model>, ModelError> + Send + Sync>;

struct Entry {
    pattern: Regex,
    factory: ModelFactory,
}

/// Resolves model strings such as `"gemini-2.0-flash"` to model backends.
///
/// Patterns must match the whole model string. Later registrations take
/// precedence over earlier ones.
#[derive(Default)]
pub struct ModelRegistry {
    entries: Vec<Entry>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, pattern: &str, factory: F) -> Result<(), ModelError>
    where
        F: Fn(&str) -> Result<Arc<dyn Model>, ModelError> + Send + Sync + 'static,
    {
        let anchored = Regex::new(&format!("^(?:{pattern})$"))
            .map_err(|e| ModelError::InvalidRequest(format!("model pattern {pattern}: {e}")))?;
        self.entries.push(Entry {
            pattern: anchored,
            factory: Arc::new(factory),
        });
        Ok(())
    }

    pub fn with<F>(mut self, pattern: &str, factory: F) -> Result<Self, ModelError>
    where
        F: Fn(&str) -> Result<Arc<dyn Model>, ModelError> + Send + Sync + 'static,
    {
        self.register(pattern, factory)?;
        Ok(self)
    }

    pub fn supports(&self, model: &str) -> bool {
        self.entries.iter().any(|e| e.pattern.is_match(model))
    }

    /// Build the model for `model`. Unknown strings fail with [`ModelError::Unsupported`].
    pub fn resolve(&self, model: &str) -> Result<Arc<dyn Model>, ModelError> {
        let entry = self
            .entries
            .iter()
            .rev()
            .find(|e| e.pattern.is_match(model))
            .ok_or_else(|| ModelError::Unsupported(format!("model {model} is not registered")))?;
        debug!(model, pattern = entry.pattern.as_str(), "resolved model");
        (entry.factory)(model)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
