//! Agent contract and the lifecycle wrapper every agent runs inside.

pub mod llm;
pub mod loop_agent;
pub mod parallel;
pub mod sequential;

pub use llm::{IncludeContents, LlmAgent, LlmAgentBuilder};
pub use loop_agent::LoopAgent;
pub use parallel::ParallelAgent;
pub use sequential::SequentialAgent;

use std::pin::Pin;
use std::sync::Arc;

use async_stream::stream;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use relay_core::events::{Content, Event};

use crate::callback::CallbackContext;
use crate::context::InvocationContext;
use crate::error::EngineError;
use crate::plugins::Plugin;

pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event, EngineError>> + Send>>;

/// A node of the agent hierarchy.
///
/// Implementations provide `run_impl`; callers go through [`run_agent`],
/// which adds cancellation and the before/after agent callbacks.
pub trait Agent: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn sub_agents(&self) -> &[Arc<dyn Agent>] {
        &[]
    }

    /// Callbacks that run after the global plugins for this agent only.
    fn callbacks(&self) -> &[Arc<dyn Plugin>] {
        &[]
    }

    fn as_llm(&self) -> Option<&LlmAgent> {
        None
    }

    fn run_impl(self: Arc<Self>, ctx: InvocationContext) -> EventStream;

    fn run_live_impl(self: Arc<Self>, _ctx: InvocationContext) -> EventStream {
        let name = self.name().to_string();
        Box::pin(futures::stream::once(async move {
            Err(EngineError::Unsupported(format!("live mode for agent {name}")))
        }))
    }
}

/// Outcome of waiting on a stream that may be cancelled.
pub(crate) enum Next<T> {
    Item(T),
    End,
    Cancelled,
}

pub(crate) async fn next_or_cancel<S>(stream: &mut S, cancel: &CancellationToken) -> Next<S::Item>
where
    S: Stream + Unpin,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Next::Cancelled,
        item = stream.next() => match item {
            Some(item) => Next::Item(item),
            None => Next::End,
        },
    }
}

/// Runs `agent` in `parent`'s invocation.
pub fn run_agent(agent: Arc<dyn Agent>, parent: &InvocationContext) -> EventStream {
    run_with_callbacks(agent, parent, false)
}

/// Runs `agent` in live mode.
pub fn run_agent_live(agent: Arc<dyn Agent>, parent: &InvocationContext) -> EventStream {
    run_with_callbacks(agent, parent, true)
}

fn run_with_callbacks(agent: Arc<dyn Agent>, parent: &InvocationContext, live: bool) -> EventStream {
    let ctx = parent.for_agent(Arc::clone(&agent));
    Box::pin(stream! {
        let cancel = ctx.cancellation_token().clone();
        if cancel.is_cancelled() {
            yield Err(EngineError::Aborted);
            return;
        }
        debug!(agent = agent.name(), branch = ctx.branch().unwrap_or(""), live, "agent starting");

        let mut cb = CallbackContext::new(&ctx).await;
        let replaced = ctx.plugins().before_agent(agent.callbacks(), &mut cb).await;
        if let Some(event) = callback_event(&ctx, cb, replaced) {
            let short_circuit = event.content.is_some();
            yield Ok(event);
            if short_circuit {
                return;
            }
        }

        let mut body = if live {
            Arc::clone(&agent).run_live_impl(ctx.clone())
        } else {
            Arc::clone(&agent).run_impl(ctx.clone())
        };
        loop {
            match next_or_cancel(&mut body, &cancel).await {
                Next::Item(Ok(event)) => {
                    yield Ok(event);
                }
                Next::Item(Err(e)) => {
                    yield Err(e);
                    return;
                }
                Next::End => break,
                Next::Cancelled => {
                    yield Err(EngineError::Aborted);
                    return;
                }
            }
        }

        if ctx.is_ended() {
            return;
        }
        let mut cb = CallbackContext::new(&ctx).await;
        let replaced = ctx.plugins().after_agent(agent.callbacks(), &mut cb).await;
        if let Some(event) = callback_event(&ctx, cb, replaced) {
            yield Ok(event);
        }
    })
}

/// The event a before/after agent callback produces: its content if it
/// returned any, otherwise its state changes alone, otherwise nothing.
fn callback_event(ctx: &InvocationContext, cb: CallbackContext, content: Option<Content>) -> Option<Event> {
    if content.is_none() && !cb.has_changes() {
        return None;
    }
    let mut event = ctx.new_event().with_actions(cb.into_actions());
    event.content = content;
    Some(event)
}
