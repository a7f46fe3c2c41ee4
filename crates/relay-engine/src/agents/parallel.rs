use std::sync::Arc;

use async_stream::stream;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::instrument::WithSubscriber;
use tracing::debug;

use relay_core::events::Event;

use crate::agents::{run_agent, Agent, EventStream};
use crate::context::InvocationContext;
use crate::error::EngineError;

/// An item from a branch plus the signal that lets the branch continue.
type BranchItem = (Result<Event, EngineError>, oneshot::Sender<()>);

/// Runs its sub-agents concurrently, each on its own branch
/// `<parent branch>.<this agent>.<sub-agent>`.
///
/// A branch waits until its previous event has been consumed downstream
/// (and so persisted) before producing the next one. The first error stops
/// every branch.
pub struct ParallelAgent {
    name: String,
    description: String,
    sub_agents: Vec<Arc<dyn Agent>>,
}

impl ParallelAgent {
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
}

async fn drive_branch(agent: Arc<dyn Agent>, ctx: InvocationContext, tx: mpsc::Sender<BranchItem>) {
    let mut events = run_agent(agent, &ctx);
    while let Some(item) = events.next().await {
        let failed = item.is_err();
        let (ack_tx, ack_rx) = oneshot::channel();
        if tx.send((item, ack_tx)).await.is_err() || failed {
            return;
        }
        if ack_rx.await.is_err() {
            return;
        }
    }
}

impl Agent for ParallelAgent {
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
            let cancel = ctx.cancellation_token().clone();
            let (tx, mut rx) = mpsc::channel::<BranchItem>(self.sub_agents.len());
            let mut branches = JoinSet::new();
            let parent = ctx.with_branch_segment(&self.name);
            for sub in &self.sub_agents {
                let branch_ctx = parent.with_branch_segment(sub.name());
                debug!(agent = %self.name, branch = branch_ctx.branch().unwrap_or(""), "starting branch");
                branches.spawn(
                    drive_branch(Arc::clone(sub), branch_ctx, tx.clone()).with_current_subscriber(),
                );
            }
            drop(tx);

            loop {
                let received = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(EngineError::Aborted),
                    item = rx.recv() => Ok(item),
                };
                match received {
                    Err(aborted) => {
                        yield Err(aborted);
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some((item, ack))) => {
                        let failed = item.is_err();
                        yield item;
                        if failed {
                            break;
                        }
                        let _ = ack.send(());
                    }
                }
            }
            branches.abort_all();
        })
    }
}
