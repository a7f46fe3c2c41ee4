//! The single entry point for executing an agent tree against a session.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_stream::stream;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_core::events::{Content, Event, EventActions, Part, USER_AUTHOR};
use relay_core::ids::SessionId;
use relay_core::state::StateMap;
use relay_store::{ArtifactService, InMemorySessionService, Session, SessionService};
use relay_telemetry::Logger;

use crate::agents::{run_agent, run_agent_live, Agent, EventStream};
use crate::config::RunConfig;
use crate::context::{InvocationContext, InvocationServices};
use crate::error::EngineError;
use crate::live::LiveRequestQueue;
use crate::plugins::{EventOverride, Plugin, PluginManager};
use crate::tree::AgentTree;

/// Author of the event a `before_run` plugin answers with.
const SHORT_CIRCUIT_AUTHOR: &str = "model";

/// One user turn.
#[derive(Clone, Debug)]
pub struct RunRequest {
    pub user_id: String,
    pub session_id: SessionId,
    pub new_message: Content,
    /// Applied with the user event, so the first agent step already sees it.
    pub state_delta: Option<StateMap>,
    /// Cancelling this token cancels the run. Dropping the run stream does too.
    pub cancel: Option<CancellationToken>,
}

impl RunRequest {
    pub fn new(user_id: impl Into<String>, session_id: SessionId, new_message: Content) -> Self {
        Self {
            user_id: user_id.into(),
            session_id,
            new_message,
            state_delta: None,
            cancel: None,
        }
    }

    pub fn with_state_delta(mut self, delta: StateMap) -> Self {
        self.state_delta = Some(delta);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

pub struct RunnerBuilder {
    app_name: String,
    root: Arc<dyn Agent>,
    session_service: Option<Arc<dyn SessionService>>,
    artifact_service: Option<Arc<dyn ArtifactService>>,
    plugins: Vec<Arc<dyn Plugin>>,
    run_config: RunConfig,
    logger: Option<Logger>,
}

impl RunnerBuilder {
    pub fn session_service(mut self, service: Arc<dyn SessionService>) -> Self {
        self.session_service = Some(service);
        self
    }

    pub fn artifact_service(mut self, service: Arc<dyn ArtifactService>) -> Self {
        self.artifact_service = Some(service);
        self
    }

    pub fn plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn run_config(mut self, config: RunConfig) -> Self {
        self.run_config = config;
        self
    }

    /// Logger every run emits through. Defaults to the dispatcher current at build time.
    pub fn logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Validates the agent tree and plugin names.
    pub fn build(self) -> Result<Runner, EngineError> {
        let tree = AgentTree::new(Arc::clone(&self.root))?;
        tree.validate_models()?;
        let mut plugins = PluginManager::new();
        for plugin in self.plugins {
            plugins.register(plugin)?;
        }
        let session_service = self
            .session_service
            .unwrap_or_else(|| Arc::new(InMemorySessionService::new()));
        debug!(app = %self.app_name, agents = tree.len(), plugins = plugins.len(), "runner built");
        Ok(Runner {
            app_name: self.app_name,
            services: InvocationServices {
                session_service,
                artifact_service: self.artifact_service,
                plugins: Arc::new(plugins),
                tree: Arc::new(tree),
                run_config: self.run_config,
            },
            logger: self.logger.unwrap_or_default(),
        })
    }
}

/// Drives an agent tree for one application.
pub struct Runner {
    app_name: String,
    services: InvocationServices,
    logger: Logger,
}

impl Runner {
    pub fn builder(app_name: impl Into<String>, root: Arc<dyn Agent>) -> RunnerBuilder {
        RunnerBuilder {
            app_name: app_name.into(),
            root,
            session_service: None,
            artifact_service: None,
            plugins: Vec::new(),
            run_config: RunConfig::default(),
            logger: None,
        }
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn root(&self) -> &Arc<dyn Agent> {
        self.services.tree.root()
    }

    pub fn session_service(&self) -> &Arc<dyn SessionService> {
        &self.services.session_service
    }

    pub fn artifact_service(&self) -> Option<&Arc<dyn ArtifactService>> {
        self.services.artifact_service.as_ref()
    }

    pub fn run_config(&self) -> &RunConfig {
        &self.services.run_config
    }

    /// Runs one user turn. Every non-partial event is persisted before it is yielded.
    ///
    /// A failure ends the stream with the error as its last item; events already
    /// persisted stay in the session.
    pub fn run(&self, request: RunRequest) -> EventStream {
        let services = self.services.clone();
        let app_name = self.app_name.clone();
        let events = stream! {
            let RunRequest { user_id, session_id, new_message, state_delta, cancel } = request;
            let cancel = cancel.map(|t| t.child_token()).unwrap_or_default();
            let _cancel_on_drop = cancel.clone().drop_guard();

            let loaded = load_session(&services, &app_name, &user_id, &session_id).await;
            let session = match loaded {
                Ok(session) => session,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            let root = Arc::clone(services.tree.root());
            let ctx = InvocationContext::new(services, session, root, cancel);
            info!(
                app = %app_name,
                user_id = %user_id,
                session_id = %session_id,
                invocation_id = %ctx.invocation_id(),
                "run started"
            );
            let body = invoke(ctx.clone(), new_message, state_delta.unwrap_or_default());
            let mut events = with_after_run(ctx, body);
            while let Some(item) = events.next().await {
                yield item;
            }
        };
        Box::pin(self.logger.scope_stream(events))
    }

    /// Runs the root agent in live mode, fed by `queue` until it is closed.
    pub fn run_live(&self, user_id: &str, session_id: &SessionId, queue: LiveRequestQueue) -> EventStream {
        let services = self.services.clone();
        let app_name = self.app_name.clone();
        let user_id = user_id.to_string();
        let session_id = session_id.clone();
        let events = stream! {
            let cancel = CancellationToken::new();
            let _cancel_on_drop = cancel.clone().drop_guard();

            let loaded = load_session(&services, &app_name, &user_id, &session_id).await;
            let session = match loaded {
                Ok(session) => session,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            let root = Arc::clone(services.tree.root());
            let ctx = InvocationContext::new_live(services, session, Arc::clone(&root), cancel, queue);
            info!(
                app = %app_name,
                user_id = %user_id,
                session_id = %session_id,
                invocation_id = %ctx.invocation_id(),
                "live run started"
            );
            let body = persist(ctx.clone(), run_agent_live(root, &ctx));
            let mut events = with_after_run(ctx, body);
            while let Some(item) = events.next().await {
                yield item;
            }
        };
        Box::pin(self.logger.scope_stream(events))
    }
}

async fn load_session(
    services: &InvocationServices,
    app_name: &str,
    user_id: &str,
    session_id: &SessionId,
) -> Result<Session, EngineError> {
    services
        .session_service
        .get_session(app_name, user_id, session_id, None)
        .await?
        .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))
}

/// Records the user turn, then runs the selected agent.
fn invoke(ctx: InvocationContext, message: Content, state_delta: StateMap) -> EventStream {
    Box::pin(stream! {
        let replaced = ctx.plugins().on_user_message(&ctx, &message).await;
        let message = replaced.unwrap_or(message);

        let mut actions = EventActions {
            state_delta,
            ..EventActions::default()
        };
        let message = if ctx.run_config().save_input_blobs_as_artifacts {
            match save_input_blobs(&ctx, message).await {
                Ok((message, saved)) => {
                    actions.artifact_delta = saved;
                    message
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        } else {
            message
        };

        ctx.set_user_content(message.clone());
        let user_event = Event::new(ctx.invocation_id().clone(), USER_AUTHOR)
            .with_content(message.clone())
            .with_actions(actions);
        if let Err(e) = ctx.append_event(user_event).await {
            yield Err(e);
            return;
        }

        if let Some(content) = ctx.plugins().before_run(&ctx).await {
            debug!(invocation_id = %ctx.invocation_id(), "run answered before any agent");
            let event = Event::new(ctx.invocation_id().clone(), SHORT_CIRCUIT_AUTHOR).with_content(content);
            match ctx.append_event(event).await {
                Ok(stored) => {
                    yield Ok(stored);
                }
                Err(e) => {
                    yield Err(e);
                }
            }
            return;
        }

        let agent = agent_to_run(&ctx, &message).await;
        debug!(agent = agent.name(), "selected agent");
        let mut events = persist(ctx.clone(), run_agent(agent, &ctx));
        while let Some(item) = events.next().await {
            yield item;
        }
    })
}

/// Passes each event through `on_event`, persists it unless partial, then yields it.
fn persist(ctx: InvocationContext, mut events: EventStream) -> EventStream {
    Box::pin(stream! {
        while let Some(item) = events.next().await {
            let event = match item {
                Ok(event) => event,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            let decision = ctx.plugins().on_event(&ctx, &event).await;
            let event = match decision {
                Some(EventOverride::Drop) => continue,
                Some(EventOverride::Replace(replacement)) => replacement,
                None => event,
            };
            if event.partial {
                yield Ok(event);
                continue;
            }
            let stored = ctx.append_event(event).await;
            match stored {
                Ok(stored) => {
                    yield Ok(stored);
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
    })
}

/// Runs `after_run` once `events` ends, before a terminal error is yielded.
fn with_after_run(ctx: InvocationContext, mut events: EventStream) -> EventStream {
    Box::pin(stream! {
        while let Some(item) = events.next().await {
            match item {
                Ok(event) => {
                    yield Ok(event);
                }
                Err(e) => {
                    warn!(
                        invocation_id = %ctx.invocation_id(),
                        error = %e,
                        kind = e.error_kind(),
                        "run failed"
                    );
                    ctx.plugins().after_run(&ctx).await;
                    yield Err(e);
                    return;
                }
            }
        }
        ctx.plugins().after_run(&ctx).await;
        info!(invocation_id = %ctx.invocation_id(), llm_calls = ctx.llm_calls(), "run finished");
    })
}

/// Replaces inline data in `message` with artifacts and a text placeholder.
async fn save_input_blobs(
    ctx: &InvocationContext,
    message: Content,
) -> Result<(Content, BTreeMap<String, u64>), EngineError> {
    let service = ctx.artifact_service().cloned().ok_or_else(|| {
        EngineError::Configuration("saving input blobs needs an artifact service".into())
    })?;
    let scope = ctx.artifact_scope().await;
    let role = message.role;
    let mut saved = BTreeMap::new();
    let mut parts = Vec::with_capacity(message.parts.len());
    for (index, part) in message.parts.into_iter().enumerate() {
        match part {
            Part::InlineData(_) => {
                let filename = format!("artifact_{}_{index}", ctx.invocation_id());
                let version = service.save_artifact(&scope, &filename, part).await?;
                parts.push(Part::text(format!(
                    "Uploaded file: {filename}. It is saved into artifacts"
                )));
                saved.insert(filename, version);
            }
            other => parts.push(other),
        }
    }
    Ok((Content::new(role, parts), saved))
}

/// Picks the agent that handles this turn.
///
/// A function response goes back to the agent that made the call. Otherwise
/// the conversation resumes with the most recent agent that could hand control
/// back up the tree, falling back to the root.
async fn agent_to_run(ctx: &InvocationContext, message: &Content) -> Arc<dyn Agent> {
    let tree = ctx.tree();
    let root = Arc::clone(tree.root());
    let session = ctx.session().await;

    let answered: Vec<_> = message.function_responses().map(|r| r.id.clone()).collect();
    if !answered.is_empty() {
        let caller = session.events.iter().rev().find(|e| {
            e.function_calls()
                .iter()
                .any(|call| answered.contains(&call.id))
        });
        if let Some(agent) = caller.and_then(|e| tree.find(&e.author)) {
            return agent;
        }
    }

    for event in session.events.iter().rev() {
        if event.is_user() {
            continue;
        }
        if event.author == root.name() {
            return root;
        }
        match tree.find(&event.author) {
            Some(agent) if tree.is_transferable(&event.author) => return agent,
            Some(_) => {}
            None => debug!(author = %event.author, "event author is not in the agent tree"),
        }
    }
    root
}
