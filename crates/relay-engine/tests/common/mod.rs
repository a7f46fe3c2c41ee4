//! Shared fixtures for the engine integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;

use relay_core::events::{Content, Event};
use relay_engine::{
    Agent, CallbackContext, EngineError, EventStream, InvocationContext, Plugin, RunRequest,
    Runner,
};
use relay_store::Session;

pub const APP: &str = "app";
pub const USER: &str = "u";

/// Emits one model text event per configured message.
pub struct Scripted {
    name: String,
    messages: Vec<String>,
}

impl Scripted {
    pub fn new(name: &str, messages: &[&str]) -> Arc<dyn Agent> {
        Arc::new(Self {
            name: name.to_string(),
            messages: messages.iter().map(|m| m.to_string()).collect(),
        })
    }
}

impl Agent for Scripted {
    fn name(&self) -> &str {
        &self.name
    }

    fn run_impl(self: Arc<Self>, ctx: InvocationContext) -> EventStream {
        Box::pin(stream! {
            for message in &self.messages {
                yield Ok(ctx.new_event().with_content(Content::model_text(message.clone())));
            }
        })
    }
}

/// Emits one event per run and escalates on run number `escalate_on` (1-based).
pub struct Escalating {
    name: String,
    escalate_on: usize,
    runs: AtomicUsize,
}

impl Escalating {
    pub fn new(name: &str, escalate_on: usize) -> Arc<dyn Agent> {
        Arc::new(Self {
            name: name.to_string(),
            escalate_on,
            runs: AtomicUsize::new(0),
        })
    }
}

impl Agent for Escalating {
    fn name(&self) -> &str {
        &self.name
    }

    fn run_impl(self: Arc<Self>, ctx: InvocationContext) -> EventStream {
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        Box::pin(stream! {
            let mut event = ctx
                .new_event()
                .with_content(Content::model_text(format!("{} run {run}", self.name)));
            event.actions.escalate = run == self.escalate_on;
            yield Ok(event);
        })
    }
}

/// Counts `after_run` calls.
#[derive(Default)]
pub struct RunCounter {
    pub after_run: AtomicUsize,
}

#[async_trait]
impl Plugin for RunCounter {
    fn name(&self) -> &str {
        "run_counter"
    }

    async fn after_run(&self, _ctx: &InvocationContext) {
        self.after_run.fetch_add(1, Ordering::SeqCst);
    }
}

/// Answers `before_agent` for one agent with fixed content.
pub struct SkipAgent {
    pub agent: String,
    pub reply: String,
}

#[async_trait]
impl Plugin for SkipAgent {
    fn name(&self) -> &str {
        "skip_agent"
    }

    async fn before_agent(&self, ctx: &mut CallbackContext) -> Option<Content> {
        (ctx.agent_name() == self.agent).then(|| Content::model_text(self.reply.clone()))
    }
}

pub async fn new_session(runner: &Runner) -> Session {
    runner
        .session_service()
        .create_session(APP, USER, None, None)
        .await
        .unwrap()
}

pub async fn reload(runner: &Runner, session: &Session) -> Session {
    runner
        .session_service()
        .get_session(APP, USER, &session.id, None)
        .await
        .unwrap()
        .unwrap()
}

pub fn request(session: &Session, text: &str) -> RunRequest {
    RunRequest::new(USER, session.id.clone(), Content::user_text(text))
}

pub async fn collect(stream: EventStream) -> Vec<Result<Event, EngineError>> {
    stream.collect().await
}

/// Unwraps every item, panicking on the first error.
pub async fn run_ok(runner: &Runner, request: RunRequest) -> Vec<Event> {
    collect(runner.run(request))
        .await
        .into_iter()
        .map(|item| item.unwrap())
        .collect()
}

pub fn texts(events: &[Event]) -> Vec<String> {
    events.iter().filter_map(Event::text).collect()
}
