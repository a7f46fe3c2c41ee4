//! Interception points around runs, agents, model calls and tool calls.
//!
//! Every hook defaults to pass-through (`None`). Hooks run in registration
//! order, global plugins before an agent's own callbacks, and the first hook
//! returning `Some` wins: its value is used and later hooks are skipped.

mod logging;
mod manager;

pub use logging::LoggingPlugin;
pub use manager::PluginManager;

use async_trait::async_trait;
use serde_json::Value;

use relay_core::errors::{ModelError, ToolError};
use relay_core::events::{Content, Event};
use relay_core::model::{LlmRequest, LlmResponse};

use crate::callback::CallbackContext;
use crate::context::InvocationContext;
use crate::tools::{Tool, ToolContext};

/// What `on_event` may do with an event before it is persisted and yielded.
#[derive(Clone, Debug, PartialEq)]
pub enum EventOverride {
    Replace(Event),
    Drop,
}

#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique within one runner.
    fn name(&self) -> &str;

    /// May replace the incoming user message.
    async fn on_user_message(&self, _ctx: &InvocationContext, _message: &Content) -> Option<Content> {
        None
    }

    /// Returning content ends the run without running any agent.
    async fn before_run(&self, _ctx: &InvocationContext) -> Option<Content> {
        None
    }

    /// Runs for every plugin once the run ends, successfully or not.
    async fn after_run(&self, _ctx: &InvocationContext) {}

    async fn on_event(&self, _ctx: &InvocationContext, _event: &Event) -> Option<EventOverride> {
        None
    }

    /// Returning content skips the agent; the content becomes its response.
    async fn before_agent(&self, _ctx: &mut CallbackContext) -> Option<Content> {
        None
    }

    async fn after_agent(&self, _ctx: &mut CallbackContext) -> Option<Content> {
        None
    }

    /// May edit the request, or answer in place of the model.
    async fn before_model(
        &self,
        _ctx: &mut CallbackContext,
        _request: &mut LlmRequest,
    ) -> Option<LlmResponse> {
        None
    }

    async fn after_model(
        &self,
        _ctx: &mut CallbackContext,
        _response: &LlmResponse,
    ) -> Option<LlmResponse> {
        None
    }

    /// A returned response substitutes for the failed call.
    async fn on_model_error(
        &self,
        _ctx: &mut CallbackContext,
        _request: &LlmRequest,
        _error: &ModelError,
    ) -> Option<LlmResponse> {
        None
    }

    /// Returning a value skips the tool and uses the value as its result.
    async fn before_tool(
        &self,
        _tool: &dyn Tool,
        _args: &Value,
        _ctx: &mut ToolContext,
    ) -> Option<Value> {
        None
    }

    async fn after_tool(
        &self,
        _tool: &dyn Tool,
        _args: &Value,
        _ctx: &mut ToolContext,
        _result: &Value,
    ) -> Option<Value> {
        None
    }

    /// A returned value substitutes for the failed call's result.
    async fn on_tool_error(
        &self,
        _tool: &dyn Tool,
        _args: &Value,
        _ctx: &mut ToolContext,
        _error: &ToolError,
    ) -> Option<Value> {
        None
    }
}
