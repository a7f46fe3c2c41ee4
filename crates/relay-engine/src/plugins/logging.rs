use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use relay_core::errors::{ModelError, ToolError};
use relay_core::events::{Content, Event};
use relay_core::model::{LlmRequest, LlmResponse};

use super::{EventOverride, Plugin};
use crate::callback::CallbackContext;
use crate::context::InvocationContext;
use crate::tools::{Tool, ToolContext};

/// Logs every interception point. Never intercepts.
#[derive(Clone, Debug, Default)]
pub struct LoggingPlugin;

impl LoggingPlugin {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Plugin for LoggingPlugin {
    fn name(&self) -> &str {
        "logging"
    }

    async fn on_user_message(&self, ctx: &InvocationContext, message: &Content) -> Option<Content> {
        info!(
            invocation_id = %ctx.invocation_id(),
            parts = message.parts.len(),
            "user message received"
        );
        None
    }

    async fn before_run(&self, ctx: &InvocationContext) -> Option<Content> {
        info!(invocation_id = %ctx.invocation_id(), agent = ctx.agent_name(), "run starting");
        None
    }

    async fn after_run(&self, ctx: &InvocationContext) {
        info!(
            invocation_id = %ctx.invocation_id(),
            llm_calls = ctx.llm_calls(),
            "run finished"
        );
    }

    async fn on_event(&self, _ctx: &InvocationContext, event: &Event) -> Option<EventOverride> {
        debug!(
            event_id = %event.id,
            author = %event.author,
            branch = event.branch.as_deref().unwrap_or(""),
            partial = event.partial,
            function_calls = event.function_calls().len(),
            final_response = event.is_final_response(),
            "event"
        );
        None
    }

    async fn before_agent(&self, ctx: &mut CallbackContext) -> Option<Content> {
        debug!(agent = ctx.agent_name(), "agent starting");
        None
    }

    async fn after_agent(&self, ctx: &mut CallbackContext) -> Option<Content> {
        debug!(agent = ctx.agent_name(), "agent finished");
        None
    }

    async fn before_model(&self, ctx: &mut CallbackContext, request: &mut LlmRequest) -> Option<LlmResponse> {
        debug!(
            agent = ctx.agent_name(),
            model = %request.model,
            contents = request.contents.len(),
            tools = request.tools.len(),
            "calling model"
        );
        None
    }

    async fn after_model(&self, ctx: &mut CallbackContext, response: &LlmResponse) -> Option<LlmResponse> {
        debug!(
            agent = ctx.agent_name(),
            partial = response.partial,
            error_code = response.error_code.as_deref().unwrap_or(""),
            "model responded"
        );
        None
    }

    async fn on_model_error(
        &self,
        ctx: &mut CallbackContext,
        _request: &LlmRequest,
        error: &ModelError,
    ) -> Option<LlmResponse> {
        warn!(agent = ctx.agent_name(), kind = error.error_kind(), error = %error, "model call failed");
        None
    }

    async fn before_tool(&self, tool: &dyn Tool, _args: &Value, ctx: &mut ToolContext) -> Option<Value> {
        debug!(tool = tool.name(), call_id = %ctx.function_call_id(), "calling tool");
        None
    }

    async fn after_tool(
        &self,
        tool: &dyn Tool,
        _args: &Value,
        ctx: &mut ToolContext,
        _result: &Value,
    ) -> Option<Value> {
        debug!(tool = tool.name(), call_id = %ctx.function_call_id(), "tool returned");
        None
    }

    async fn on_tool_error(
        &self,
        tool: &dyn Tool,
        _args: &Value,
        ctx: &mut ToolContext,
        error: &ToolError,
    ) -> Option<Value> {
        warn!(tool = tool.name(), call_id = %ctx.function_call_id(), error = %error, "tool failed");
        None
    }
}
