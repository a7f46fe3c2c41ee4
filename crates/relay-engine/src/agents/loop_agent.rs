use std::sync::Arc;

use async_stream::stream;
use futures::StreamExt;
use tracing::debug;

use crate::agents::{run_agent, Agent, EventStream};
use crate::context::InvocationContext;
use crate::error::EngineError;

/// Repeats its sub-agents in order until one escalates, the iteration
/// limit is reached or the invocation ends.
pub struct LoopAgent {
    name: String,
    description: String,
    sub_agents: Vec<Arc<dyn Agent>>,
    max_iterations: Option<u32>,
}

impl LoopAgent {
    pub fn new(name: impl Into<String>, sub_agents: Vec<Arc<dyn Agent>>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            sub_agents,
            max_iterations: None,
        }
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = Some(max);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn max_iterations(&self) -> Option<u32> {
        self.max_iterations
    }
}

impl Agent for LoopAgent {
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
        Box::pin(stream! {
            if self.sub_agents.is_empty() {
                return;
            }
            let mut iteration = 0u32;
            'iterations: loop {
                if self.max_iterations.is_some_and(|max| iteration >= max) {
                    break;
                }
                iteration += 1;
                debug!(agent = %self.name, iteration, "loop iteration");
                for sub in &self.sub_agents {
                    let mut events = run_agent(Arc::clone(sub), &ctx);
                    while let Some(item) = events.next().await {
                        match item {
                            Ok(event) => {
                                let escalate = event.actions.escalate;
                                yield Ok(event);
                                if escalate {
                                    break 'iterations;
                                }
                            }
                            Err(e) => {
                                yield Err(e);
                                break 'iterations;
                            }
                        }
                    }
                    if ctx.is_ended() {
                        break 'iterations;
                    }
                }
            }
        })
    }

    fn run_live_impl(self: Arc<Self>, _ctx: InvocationContext) -> EventStream {
        let name = self.name.clone();
        Box::pin(futures::stream::once(async move {
            Err(EngineError::Unsupported(format!("live mode for loop agent {name}")))
        }))
    }
}
