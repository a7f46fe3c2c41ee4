use relay_core::errors::{ModelError, ToolError};
use relay_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("missing state key: {0}")]
    MissingStateKey(String),

    #[error("max llm calls exceeded: {0}")]
    LlmCallsLimitExceeded(u32),

    #[error("invocation aborted")]
    Aborted,

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    /// Short machine-readable name, used for event error codes and log fields.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Store(_) => "store",
            Self::Model(_) => "model",
            Self::Tool(_) => "tool",
            Self::SessionNotFound(_) => "session_not_found",
            Self::AgentNotFound(_) => "agent_not_found",
            Self::Unsupported(_) => "unsupported",
            Self::Configuration(_) => "configuration",
            Self::MissingStateKey(_) => "missing_state_key",
            Self::LlmCallsLimitExceeded(_) => "llm_calls_limit_exceeded",
            Self::Aborted => "aborted",
            Self::Internal(_) => "internal",
        }
    }
}
