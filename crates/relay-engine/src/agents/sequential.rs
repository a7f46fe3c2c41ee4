use std::sync::Arc;

use async_stream::stream;
use futures::StreamExt;

use crate::agents::{run_agent, run_agent_live, Agent, EventStream};
use crate::context::InvocationContext;

/// Runs its sub-agents one after another on the same branch.
pub struct SequentialAgent {
    name: String,
    description: String,
    sub_agents: Vec<Arc<dyn Agent>>,
}

impl SequentialAgent {
    pub fn new(name: impl Into<String>, sub_agents: Vec<Arc<dyn Agent>>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            sub_agents,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    fn run_children(self: Arc<Self>, ctx: InvocationContext, live: bool) -> EventStream {
        Box::pin(stream! {
            for sub in &self.sub_agents {
                let mut events = if live {
                    run_agent_live(Arc::clone(sub), &ctx)
                } else {
                    run_agent(Arc::clone(sub), &ctx)
                };
                while let Some(item) = events.next().await {
                    let failed = item.is_err();
                    yield item;
                    if failed {
                        return;
                    }
                }
                if ctx.is_ended() {
                    return;
                }
            }
        })
    }
}

impl Agent for SequentialAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn sub_agents(&self) -> &[Arc<dyn Agent>] {
        &self.sub_agents
    }

    fn run_impl(self: Arc<Self>, ctx: InvocationContext) -> EventStream {
        self.run_children(ctx, false)
    }

    fn run_live_impl(self: Arc<Self>, ctx: InvocationContext) -> EventStream {
        self.run_children(ctx, true)
    }
}
