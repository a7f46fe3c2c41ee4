use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use relay_core::errors::{ModelError, ToolError};
use relay_core::events::{Content, Event};
use relay_core::model::{LlmRequest, LlmResponse};

use super::{EventOverride, Plugin};
use crate::callback::CallbackContext;
use crate::context::InvocationContext;
use crate::error::EngineError;
use crate::tools::{Tool, ToolContext};

/// Runs `$call` for each plugin in `$chain` and returns the first `Some`.
macro_rules! first_some {
    ($chain:expr, $hook:literal, |$plugin:ident| $call:expr) => {{
        for $plugin in $chain {
            if let Some(out) = $call.await {
                debug!(plugin = $plugin.name(), hook = $hook, "plugin short-circuited");
                return Some(out);
            }
        }
        None
    }};
}

/// Registered plugins, invoked in registration order.
#[derive(Default)]
pub struct PluginManager {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), EngineError> {
        if self.get(plugin.name()).is_some() {
            return Err(EngineError::Configuration(format!(
                "plugin {} is already registered",
                plugin.name()
            )));
        }
        self.plugins.push(plugin);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Plugin>> {
        self.plugins.iter().find(|p| p.name() == name)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Global plugins followed by an agent's own callbacks.
    fn chain<'a>(&'a self, local: &'a [Arc<dyn Plugin>]) -> impl Iterator<Item = &'a Arc<dyn Plugin>> {
        self.plugins.iter().chain(local.iter())
    }

    pub async fn on_user_message(&self, ctx: &InvocationContext, message: &Content) -> Option<Content> {
        first_some!(self.plugins.iter(), "on_user_message", |p| p.on_user_message(ctx, message))
    }

    pub async fn before_run(&self, ctx: &InvocationContext) -> Option<Content> {
        first_some!(self.plugins.iter(), "before_run", |p| p.before_run(ctx))
    }

    pub async fn after_run(&self, ctx: &InvocationContext) {
        for plugin in &self.plugins {
            plugin.after_run(ctx).await;
        }
    }

    pub async fn on_event(&self, ctx: &InvocationContext, event: &Event) -> Option<EventOverride> {
        first_some!(self.plugins.iter(), "on_event", |p| p.on_event(ctx, event))
    }

    pub async fn before_agent(
        &self,
        local: &[Arc<dyn Plugin>],
        ctx: &mut CallbackContext,
    ) -> Option<Content> {
        first_some!(self.chain(local), "before_agent", |p| p.before_agent(ctx))
    }

    pub async fn after_agent(
        &self,
        local: &[Arc<dyn Plugin>],
        ctx: &mut CallbackContext,
    ) -> Option<Content> {
        first_some!(self.chain(local), "after_agent", |p| p.after_agent(ctx))
    }

    pub async fn before_model(
        &self,
        local: &[Arc<dyn Plugin>],
        ctx: &mut CallbackContext,
        request: &mut LlmRequest,
    ) -> Option<LlmResponse> {
        first_some!(self.chain(local), "before_model", |p| p.before_model(ctx, request))
    }

    pub async fn after_model(
        &self,
        local: &[Arc<dyn Plugin>],
        ctx: &mut CallbackContext,
        response: &LlmResponse,
    ) -> Option<LlmResponse> {
        first_some!(self.chain(local), "after_model", |p| p.after_model(ctx, response))
    }

    pub async fn on_model_error(
        &self,
        local: &[Arc<dyn Plugin>],
        ctx: &mut CallbackContext,
        request: &LlmRequest,
        error: &ModelError,
    ) -> Option<LlmResponse> {
        first_some!(self.chain(local), "on_model_error", |p| p.on_model_error(ctx, request, error))
    }

    pub async fn before_tool(
        &self,
        local: &[Arc<dyn Plugin>],
        tool: &dyn Tool,
        args: &Value,
        ctx: &mut ToolContext,
    ) -> Option<Value> {
        first_some!(self.chain(local), "before_tool", |p| p.before_tool(tool, args, ctx))
    }

    pub async fn after_tool(
        &self,
        local: &[Arc<dyn Plugin>],
        tool: &dyn Tool,
        args: &Value,
        ctx: &mut ToolContext,
        result: &Value,
    ) -> Option<Value> {
        first_some!(self.chain(local), "after_tool", |p| p.after_tool(tool, args, ctx, result))
    }

    pub async fn on_tool_error(
        &self,
        local: &[Arc<dyn Plugin>],
        tool: &dyn Tool,
        args: &Value,
        ctx: &mut ToolContext,
        error: &ToolError,
    ) -> Option<Value> {
        first_some!(self.chain(local), "on_tool_error", |p| p.on_tool_error(tool, args, ctx, error))
    }
}
