use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ModelError;
use crate::events::{Blob, Content};

/// How model output is delivered to the caller of a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingMode {
    /// One complete response per model call.
    #[default]
    None,
    /// Partial chunks followed by the aggregated response.
    Sse,
    /// Duplex live connection.
    Bidi,
}

/// A tool as advertised to the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmRequest {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
    pub contents: Vec<Content>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDeclaration>,
    #[serde(default)]
    pub config: GenerateConfig,
}

impl LlmRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    /// Appends a paragraph to the system instruction.
    pub fn append_instruction(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        match &mut self.system_instruction {
            Some(existing) if !existing.is_empty() => {
                existing.push_str("\n\n");
                existing.push_str(text);
            }
            _ => self.system_instruction = Some(text.to_string()),
        }
    }

    pub fn tool(&self, name: &str) -> Option<&ToolDeclaration> {
        self.tools.iter().find(|t| t.name == name)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// One chunk or complete response from a model.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(default)]
    pub partial: bool,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl LlmResponse {
    pub fn new(content: Content) -> Self {
        Self {
            content: Some(content),
            ..Default::default()
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Content::model_text(text))
    }

    pub fn partial_text(text: impl Into<String>) -> Self {
        Self {
            partial: true,
            ..Self::text(text)
        }
    }

    /// A response describing an error reported in-band by the model.
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_code: Some(code.into()),
            error_message: Some(message.into()),
            ..Default::default()
        }
    }
}

pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<LlmResponse, ModelError>> + Send>>;

/// A model backend. Implementations translate [`LlmRequest`] to a provider wire format.
#[async_trait]
pub trait Model: Send + Sync {
    fn name(&self) -> &str;

    /// Generate a response. With `stream` set, partial chunks precede the final response.
    async fn generate(&self, request: LlmRequest, stream: bool) -> Result<ResponseStream, ModelError>;

    /// Open a duplex live connection.
    async fn connect(&self, _request: LlmRequest) -> Result<Box<dyn LiveConnection>, ModelError> {
        Err(ModelError::Unsupported(format!(
            "live connections for model {}",
            self.name()
        )))
    }
}

/// A duplex model connection. `receive` must be cancel-safe.
#[async_trait]
pub trait LiveConnection: Send {
    async fn send_content(&mut self, content: Content) -> Result<(), ModelError>;
    async fn send_realtime(&mut self, blob: Blob) -> Result<(), ModelError>;
    /// `None` once the connection is closed.
    async fn receive(&mut self) -> Option<Result<LlmResponse, ModelError>>;
    async fn close(&mut self) -> Result<(), ModelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain;

    #[async_trait]
    impl Model for Plain {
        fn name(&self) -> &str {
            "plain"
        }

        async fn generate(&self, _request: LlmRequest, _stream: bool) -> Result<ResponseStream, ModelError> {
            Ok(Box::pin(futures::stream::iter(vec![Ok(LlmResponse::text("ok"))])))
        }
    }

    #[tokio::test]
    async fn connect_defaults_to_unsupported() {
        let result = Plain.connect(LlmRequest::new("plain")).await;
        assert!(matches!(result, Err(ModelError::Unsupported(_))));
    }

    #[test]
    fn append_instruction_joins_paragraphs() {
        let mut req = LlmRequest::new("m");
        req.append_instruction("");
        assert!(req.system_instruction.is_none());
        req.append_instruction("first");
        req.append_instruction("second");
        assert_eq!(req.system_instruction.as_deref(), Some("first\n\nsecond"));
    }

    #[test]
    fn streaming_mode_serde() {
        assert_eq!(serde_json::to_string(&StreamingMode::Sse).unwrap(), r#""sse""#);
        let parsed: StreamingMode = serde_json::from_str(r#""bidi""#).unwrap();
        assert_eq!(parsed, StreamingMode::Bidi);
    }
}
