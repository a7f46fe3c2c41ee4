use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use serde_json::{json, Value};

use relay_core::errors::ToolError;

use super::{Tool, ToolContext};

type Handler = Box<
    dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send>> + Send + Sync,
>;

/// A tool backed by an async closure over its arguments.
pub struct FunctionTool {
    name: String,
    description: String,
    parameters: Value,
    long_running: bool,
    handler: Handler,
}

impl FunctionTool {
    pub fn new<F, Fut>(name: impl Into<String>, description: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: json!({"type": "object", "properties": {}}),
            long_running: false,
            handler: Box::new(move |args| Box::pin(handler(args))),
        }
    }

    pub fn with_parameters(mut self, schema: Value) -> Self {
        self.parameters = schema;
        self
    }

    pub fn long_running(mut self) -> Self {
        self.long_running = true;
        self
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.parameters.clone()
    }

    fn is_long_running(&self) -> bool {
        self.long_running
    }

    async fn run(&self, args: Value, _ctx: &mut ToolContext) -> Result<Value, ToolError> {
        (self.handler)(args).await
    }
}
