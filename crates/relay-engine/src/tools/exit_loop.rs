use async_trait::async_trait;
use serde_json::{json, Value};

use relay_core::errors::ToolError;

use super::{Tool, ToolContext};

/// Lets a model inside a `LoopAgent` end the loop.
pub struct ExitLoopTool;

#[async_trait]
impl Tool for ExitLoopTool {
    fn name(&self) -> &str {
        "exit_loop"
    }

    fn description(&self) -> &str {
        "Exits the loop. Call this function only when you are instructed to do so."
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn run(&self, _args: Value, ctx: &mut ToolContext) -> Result<Value, ToolError> {
        ctx.escalate();
        ctx.skip_summarization();
        Ok(json!({}))
    }
}
