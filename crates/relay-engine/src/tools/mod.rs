mod exit_loop;
mod function;
mod transfer;

pub use exit_loop::ExitLoopTool;
pub use function::FunctionTool;
pub use transfer::{TransferToAgentTool, TRANSFER_TO_AGENT};

use std::ops::{Deref, DerefMut};

use async_trait::async_trait;
use serde_json::Value;

use relay_core::errors::ToolError;
use relay_core::events::EventActions;
use relay_core::ids::FunctionCallId;
use relay_core::model::ToolDeclaration;

use crate::callback::CallbackContext;
use crate::context::InvocationContext;

/// A capability an `LlmAgent` offers to its model.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON schema of the arguments object.
    fn parameters_schema(&self) -> Value;

    /// Long-running tools end the agent's turn once called; their result arrives later.
    fn is_long_running(&self) -> bool {
        false
    }

    async fn run(&self, args: Value, ctx: &mut ToolContext) -> Result<Value, ToolError>;

    fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// Callback context for one function call.
pub struct ToolContext {
    callback: CallbackContext,
    function_call_id: FunctionCallId,
}

impl ToolContext {
    pub async fn new(invocation: &InvocationContext, function_call_id: FunctionCallId) -> Self {
        Self {
            callback: CallbackContext::new(invocation).await,
            function_call_id,
        }
    }

    pub fn function_call_id(&self) -> &FunctionCallId {
        &self.function_call_id
    }

    /// Asks the enclosing loop to stop.
    pub fn escalate(&mut self) {
        self.actions_mut().escalate = true;
    }

    /// Hands control to another agent once this call completes.
    pub fn transfer_to_agent(&mut self, agent_name: impl Into<String>) {
        self.actions_mut().transfer_to_agent = Some(agent_name.into());
    }

    /// Ends the turn without sending the tool result back to the model.
    pub fn skip_summarization(&mut self) {
        self.actions_mut().skip_summarization = true;
    }

    pub fn into_actions(self) -> EventActions {
        self.callback.into_actions()
    }
}

impl Deref for ToolContext {
    type Target = CallbackContext;

    fn deref(&self) -> &CallbackContext {
        &self.callback
    }
}

impl DerefMut for ToolContext {
    fn deref_mut(&mut self) -> &mut CallbackContext {
        &mut self.callback
    }
}

/// Reads a required string argument.
pub(crate) fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidArguments(format!("missing string argument {key}")))
}
