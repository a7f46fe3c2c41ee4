use std::time::Duration;

/// Failures raised at the model-invocation boundary.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ModelError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("model overloaded")]
    Overloaded,
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
    #[error("cancelled")]
    Cancelled,
}

impl ModelError {
    /// Short classification string, used as the `error_code` of error events.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Unsupported(_) => "unsupported",
            Self::Overloaded => "overloaded",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Failures raised by tool execution.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_strings() {
        assert_eq!(ModelError::Cancelled.error_kind(), "cancelled");
        assert_eq!(ModelError::Unsupported(String::new()).error_kind(), "unsupported");
        assert_eq!(ModelError::Overloaded.to_string(), "model overloaded");
    }

    #[test]
    fn tool_error_display() {
        let err = ToolError::InvalidArguments("missing city".into());
        assert_eq!(err.to_string(), "invalid arguments: missing city");
        assert_eq!(ToolError::NotFound("x".into()).to_string(), "tool not found: x");
    }
}
