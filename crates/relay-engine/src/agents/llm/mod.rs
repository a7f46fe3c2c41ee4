//! The model-driven agent: builds requests from session history, calls the
//! model, runs the tools it asks for, and repeats until a final response.

pub mod contents;
pub mod instructions;

pub use contents::IncludeContents;

use std::collections::HashMap;
use std::sync::Arc;

use async_stream::stream;
use futures::future::join_all;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use relay_core::errors::{ModelError, ToolError};
use relay_core::events::{Content, Event, EventActions, FunctionCall, FunctionResponse, Part, Role};
use relay_core::ids::FunctionCallId;
use relay_core::model::{GenerateConfig, LlmRequest, LlmResponse, Model, ResponseStream, StreamingMode};
use relay_llm::ModelRegistry;

use crate::agents::{next_or_cancel, run_agent, Agent, EventStream, Next};
use crate::callback::CallbackContext;
use crate::context::InvocationContext;
use crate::error::EngineError;
use crate::live::LiveRequest;
use crate::plugins::Plugin;
use crate::tools::{Tool, ToolContext, TransferToAgentTool};
use contents::build_contents;
use instructions::inject_state;

type ToolMap = HashMap<String, Arc<dyn Tool>>;

/// Everything one model call needs.
struct Step {
    model: Arc<dyn Model>,
    request: LlmRequest,
    tools: ToolMap,
}

pub struct LlmAgent {
    name: String,
    description: String,
    model: Option<Arc<dyn Model>>,
    instruction: String,
    tools: Vec<Arc<dyn Tool>>,
    sub_agents: Vec<Arc<dyn Agent>>,
    output_key: Option<String>,
    include_contents: IncludeContents,
    disallow_transfer_to_parent: bool,
    disallow_transfer_to_peers: bool,
    generate_config: GenerateConfig,
    callbacks: Vec<Arc<dyn Plugin>>,
}

pub struct LlmAgentBuilder {
    agent: LlmAgent,
}

impl LlmAgentBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.agent.description = description.into();
        self
    }

    pub fn model(mut self, model: Arc<dyn Model>) -> Self {
        self.agent.model = Some(model);
        self
    }

    /// Resolves `model` through `registry`.
    pub fn model_name(self, model: &str, registry: &ModelRegistry) -> Result<Self, EngineError> {
        let resolved = registry.resolve(model)?;
        Ok(self.model(resolved))
    }

    /// System instruction template. See [`instructions::inject_state`].
    pub fn instruction(mut self, instruction: impl Into<String>) -> Self {
        self.agent.instruction = instruction.into();
        self
    }

    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.agent.tools.push(tool);
        self
    }

    pub fn sub_agent(mut self, agent: Arc<dyn Agent>) -> Self {
        self.agent.sub_agents.push(agent);
        self
    }

    /// State key that receives the text of the agent's final response.
    pub fn output_key(mut self, key: impl Into<String>) -> Self {
        self.agent.output_key = Some(key.into());
        self
    }

    pub fn include_contents(mut self, include: IncludeContents) -> Self {
        self.agent.include_contents = include;
        self
    }

    pub fn disallow_transfer_to_parent(mut self, disallow: bool) -> Self {
        self.agent.disallow_transfer_to_parent = disallow;
        self
    }

    pub fn disallow_transfer_to_peers(mut self, disallow: bool) -> Self {
        self.agent.disallow_transfer_to_peers = disallow;
        self
    }

    pub fn generate_config(mut self, config: GenerateConfig) -> Self {
        self.agent.generate_config = config;
        self
    }

    /// Adds a callback that runs for this agent only, after the global plugins.
    pub fn callback(mut self, callback: Arc<dyn Plugin>) -> Self {
        self.agent.callbacks.push(callback);
        self
    }

    pub fn build(self) -> LlmAgent {
        self.agent
    }
}

impl LlmAgent {
    pub fn builder(name: impl Into<String>) -> LlmAgentBuilder {
        LlmAgentBuilder {
            agent: LlmAgent {
                name: name.into(),
                description: String::new(),
                model: None,
                instruction: String::new(),
                tools: Vec::new(),
                sub_agents: Vec::new(),
                output_key: None,
                include_contents: IncludeContents::Default,
                disallow_transfer_to_parent: false,
                disallow_transfer_to_peers: false,
                generate_config: GenerateConfig::default(),
                callbacks: Vec::new(),
            },
        }
    }

    /// The agent's own model. Agents without one use their nearest ancestor's.
    pub fn model(&self) -> Option<Arc<dyn Model>> {
        self.model.clone()
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    pub fn tools(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }

    pub fn output_key(&self) -> Option<&str> {
        self.output_key.as_deref()
    }

    pub fn include_contents(&self) -> IncludeContents {
        self.include_contents
    }

    pub fn disallow_transfer_to_parent(&self) -> bool {
        self.disallow_transfer_to_parent
    }

    pub fn disallow_transfer_to_peers(&self) -> bool {
        self.disallow_transfer_to_peers
    }

    async fn prepare(&self, ctx: &InvocationContext, cb: &CallbackContext) -> Result<Step, EngineError> {
        let model = ctx.tree().model_for(&self.name).ok_or_else(|| {
            EngineError::Configuration(format!("no model configured for agent {}", self.name))
        })?;
        let mut request = LlmRequest::new(model.name());
        request.config = self.generate_config.clone();
        let instruction = inject_state(&self.instruction, cb).await?;
        request.append_instruction(&instruction);

        let mut tools: ToolMap = self
            .tools
            .iter()
            .map(|t| (t.name().to_string(), Arc::clone(t)))
            .collect();
        request.tools = self.tools.iter().map(|t| t.declaration()).collect();

        let targets = ctx.tree().transfer_targets(&self.name);
        if !targets.is_empty() {
            request.append_instruction(&transfer_instruction(&self.name, &targets));
            let transfer: Arc<dyn Tool> = Arc::new(TransferToAgentTool::new(
                targets.iter().map(|a| (a.name(), a.description())),
            ));
            request.tools.push(transfer.declaration());
            tools.insert(transfer.name().to_string(), transfer);
        }

        let session = ctx.session().await;
        request.contents = build_contents(
            &session.events,
            &self.name,
            ctx.branch(),
            self.include_contents,
        );
        drop(session);

        Ok(Step {
            model,
            request,
            tools,
        })
    }

    /// Asks the `before_model` chain, then the model. Only real model calls count
    /// against the invocation's call limit.
    async fn call_model(
        &self,
        ctx: &InvocationContext,
        cb: &mut CallbackContext,
        step: &mut Step,
    ) -> Result<ResponseStream, EngineError> {
        let plugins = ctx.plugins();
        if let Some(response) = plugins.before_model(&self.callbacks, cb, &mut step.request).await {
            return Ok(single(response));
        }
        ctx.increment_llm_calls()?;
        let stream = ctx.run_config().streaming_mode == StreamingMode::Sse;
        debug!(
            agent = %self.name,
            model = step.model.name(),
            contents = step.request.contents.len(),
            tools = step.request.tools.len(),
            stream,
            "calling model"
        );
        match step.model.generate(step.request.clone(), stream).await {
            Ok(responses) => Ok(responses),
            Err(err) => {
                warn!(agent = %self.name, error = %err, kind = err.error_kind(), "model call failed");
                let substitute = plugins
                    .on_model_error(&self.callbacks, cb, &step.request, &err)
                    .await;
                substitute.map(single).ok_or(EngineError::Model(err))
            }
        }
    }

    fn response_event(
        &self,
        ctx: &InvocationContext,
        response: LlmResponse,
        tools: &ToolMap,
        actions: EventActions,
    ) -> Event {
        let mut event = ctx
            .new_event()
            .with_actions(actions)
            .with_partial(response.partial);
        event.turn_complete = response.turn_complete;
        event.error_code = response.error_code;
        event.error_message = response.error_message;
        event.content = response.content;
        if let Some(content) = event.content.as_mut() {
            for part in &mut content.parts {
                if let Part::FunctionCall(call) = part {
                    if call.id.as_str().is_empty() {
                        call.id = FunctionCallId::new();
                    }
                }
            }
        }
        if event.partial {
            return event;
        }

        let long_running: Vec<FunctionCallId> = event
            .function_calls()
            .into_iter()
            .filter(|c| tools.get(&c.name).is_some_and(|t| t.is_long_running()))
            .map(|c| c.id.clone())
            .collect();
        event.long_running_tool_ids = long_running;

        if let Some(key) = &self.output_key {
            if event.is_final_response() {
                if let Some(text) = event.text() {
                    event.actions.state_delta.insert(key.clone(), Value::String(text));
                }
            }
        }
        event
    }

    /// Runs `calls` concurrently and merges their results into one event.
    async fn run_tools(
        &self,
        ctx: &InvocationContext,
        calls: Vec<FunctionCall>,
        tools: &ToolMap,
    ) -> Result<Event, EngineError> {
        let results = join_all(calls.into_iter().map(|call| self.run_tool(ctx, call, tools))).await;
        let mut parts = Vec::with_capacity(results.len());
        let mut actions = EventActions::default();
        for result in results {
            let (response, tool_actions) = result?;
            parts.push(Part::FunctionResponse(response));
            actions.merge(tool_actions);
        }
        Ok(ctx
            .new_event()
            .with_content(Content::new(Role::User, parts))
            .with_actions(actions))
    }

    async fn run_tool(
        &self,
        ctx: &InvocationContext,
        call: FunctionCall,
        tools: &ToolMap,
    ) -> Result<(FunctionResponse, EventActions), EngineError> {
        let tool = tools
            .get(&call.name)
            .cloned()
            .ok_or_else(|| ToolError::NotFound(call.name.clone()))?;
        let plugins = ctx.plugins();
        let mut tool_ctx = ToolContext::new(ctx, call.id.clone()).await;

        let intercepted = plugins
            .before_tool(&self.callbacks, tool.as_ref(), &call.args, &mut tool_ctx)
            .await;
        let outcome = match intercepted {
            Some(result) => result,
            None => match tool.run(call.args.clone(), &mut tool_ctx).await {
                Ok(result) => result,
                Err(err) => {
                    warn!(tool = %call.name, error = %err, "tool failed");
                    let substitute = plugins
                        .on_tool_error(&self.callbacks, tool.as_ref(), &call.args, &mut tool_ctx, &err)
                        .await;
                    match substitute {
                        Some(result) => result,
                        None => return Err(err.into()),
                    }
                }
            },
        };
        let replaced = plugins
            .after_tool(&self.callbacks, tool.as_ref(), &call.args, &mut tool_ctx, &outcome)
            .await;
        let result = replaced.unwrap_or(outcome);
        debug!(tool = %call.name, call_id = %call.id, "tool completed");

        let response = FunctionResponse {
            id: call.id,
            name: call.name,
            response: as_object(result),
        };
        Ok((response, tool_ctx.into_actions()))
    }
}

fn single(response: LlmResponse) -> ResponseStream {
    Box::pin(futures::stream::once(async move { Ok(response) }))
}

/// Function responses are always JSON objects.
fn as_object(value: Value) -> Value {
    if value.is_object() {
        value
    } else {
        json!({ "result": value })
    }
}

fn transfer_instruction(name: &str, targets: &[Arc<dyn Agent>]) -> String {
    let mut text = format!("You are agent `{name}`. These agents can take over the conversation:\n");
    for target in targets {
        text.push_str(&format!("\n- `{}`", target.name()));
        if !target.description().is_empty() {
            text.push_str(&format!(": {}", target.description()));
        }
    }
    text.push_str(
        "\n\nIf one of them is better suited to the request, call `transfer_to_agent` with its name.",
    );
    text
}

enum LiveStep {
    Cancelled,
    Model(Option<Result<LlmResponse, ModelError>>),
    Input(Option<LiveRequest>),
}

impl Agent for LlmAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn sub_agents(&self) -> &[Arc<dyn Agent>] {
        &self.sub_agents
    }

    fn callbacks(&self) -> &[Arc<dyn Plugin>] {
        &self.callbacks
    }

    fn as_llm(&self) -> Option<&LlmAgent> {
        Some(self)
    }

    fn run_impl(self: Arc<Self>, ctx: InvocationContext) -> EventStream {
        Box::pin(stream! {
            let cancel = ctx.cancellation_token().clone();
            loop {
                if ctx.is_ended() {
                    return;
                }
                let mut cb = CallbackContext::new(&ctx).await;
                let prepared = self.prepare(&ctx, &cb).await;
                let mut step = match prepared {
                    Ok(step) => step,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                let called = self.call_model(&ctx, &mut cb, &mut step).await;
                let mut responses = match called {
                    Ok(responses) => responses,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };

                let mut last: Option<Event> = None;
                loop {
                    let next = match next_or_cancel(&mut responses, &cancel).await {
                        Next::Item(Ok(response)) => Ok(response),
                        Next::Item(Err(err)) => {
                            let substitute = ctx
                                .plugins()
                                .on_model_error(&self.callbacks, &mut cb, &step.request, &err)
                                .await;
                            substitute.ok_or(EngineError::Model(err))
                        }
                        Next::End => break,
                        Next::Cancelled => Err(EngineError::Aborted),
                    };
                    let mut response = match next {
                        Ok(response) => response,
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    };

                    let actions = if response.partial {
                        EventActions::default()
                    } else {
                        let replaced = ctx
                            .plugins()
                            .after_model(&self.callbacks, &mut cb, &response)
                            .await;
                        if let Some(replacement) = replaced {
                            response = replacement;
                        }
                        cb.take_actions()
                    };
                    let event = self.response_event(&ctx, response, &step.tools, actions);
                    if !event.partial {
                        last = Some(event.clone());
                    }
                    yield Ok(event);
                }

                let Some(last) = last else {
                    return;
                };
                let calls: Vec<FunctionCall> = last.function_calls().into_iter().cloned().collect();
                if calls.is_empty() {
                    return;
                }

                let ran = self.run_tools(&ctx, calls, &step.tools).await;
                let responses_event = match ran {
                    Ok(event) => event,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                let transfer = responses_event.actions.transfer_to_agent.clone();
                let stop = responses_event.actions.escalate
                    || responses_event.actions.skip_summarization
                    || !last.long_running_tool_ids.is_empty();
                yield Ok(responses_event);

                if let Some(target) = transfer {
                    let Some(agent) = ctx.tree().find(&target) else {
                        yield Err(EngineError::AgentNotFound(target));
                        return;
                    };
                    debug!(from = %self.name, to = %target, "transferring");
                    let mut events = run_agent(agent, &ctx);
                    while let Some(item) = events.next().await {
                        let failed = item.is_err();
                        yield item;
                        if failed {
                            return;
                        }
                    }
                    return;
                }
                if stop {
                    return;
                }
            }
        })
    }

    fn run_live_impl(self: Arc<Self>, ctx: InvocationContext) -> EventStream {
        Box::pin(stream! {
            let Some(queue) = ctx.live_queue().cloned() else {
                yield Err(EngineError::Configuration("live run without a request queue".into()));
                return;
            };
            let cancel = ctx.cancellation_token().clone();
            let cb = CallbackContext::new(&ctx).await;
            let prepared = self.prepare(&ctx, &cb).await;
            let step = match prepared {
                Ok(step) => step,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            let connected = step.model.connect(step.request.clone()).await;
            let mut conn = match connected {
                Ok(conn) => conn,
                Err(e) => {
                    yield Err(e.into());
                    return;
                }
            };
            debug!(agent = %self.name, model = step.model.name(), "live connection open");

            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => LiveStep::Cancelled,
                    received = conn.receive() => LiveStep::Model(received),
                    request = queue.recv() => LiveStep::Input(request),
                };
                match next {
                    LiveStep::Cancelled => {
                        yield Err(EngineError::Aborted);
                        break;
                    }
                    LiveStep::Input(None) | LiveStep::Input(Some(LiveRequest::Close)) => break,
                    LiveStep::Input(Some(LiveRequest::Content(content))) => {
                        if let Err(e) = conn.send_content(content).await {
                            yield Err(e.into());
                            break;
                        }
                    }
                    LiveStep::Input(Some(LiveRequest::Realtime(blob))) => {
                        if let Err(e) = conn.send_realtime(blob).await {
                            yield Err(e.into());
                            break;
                        }
                    }
                    LiveStep::Model(None) => break,
                    LiveStep::Model(Some(Err(e))) => {
                        yield Err(e.into());
                        break;
                    }
                    LiveStep::Model(Some(Ok(response))) => {
                        let event = self.response_event(&ctx, response, &step.tools, EventActions::default());
                        let calls: Vec<FunctionCall> = if event.partial {
                            Vec::new()
                        } else {
                            event.function_calls().into_iter().cloned().collect()
                        };
                        yield Ok(event);
                        if calls.is_empty() {
                            continue;
                        }
                        let ran = self.run_tools(&ctx, calls, &step.tools).await;
                        let responses_event = match ran {
                            Ok(event) => event,
                            Err(e) => {
                                yield Err(e);
                                break;
                            }
                        };
                        let reply = responses_event.content.clone();
                        yield Ok(responses_event);
                        if let Some(reply) = reply {
                            if let Err(e) = conn.send_content(reply).await {
                                yield Err(e.into());
                                break;
                            }
                        }
                    }
                }
            }
            if let Err(e) = conn.close().await {
                warn!(agent = %self.name, error = %e, "closing live connection failed");
            }
        })
    }
}
