use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{RwLock as AsyncRwLock, RwLockReadGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use relay_core::events::{child_branch, Content, Event};
use relay_core::ids::{InvocationId, SessionId};
use relay_store::{ArtifactScope, ArtifactService, Session, SessionService};

use crate::agents::Agent;
use crate::config::RunConfig;
use crate::error::EngineError;
use crate::live::LiveRequestQueue;
use crate::plugins::PluginManager;
use crate::tree::AgentTree;

/// Services and configuration an invocation runs against.
#[derive(Clone)]
pub struct InvocationServices {
    pub session_service: Arc<dyn SessionService>,
    pub artifact_service: Option<Arc<dyn ArtifactService>>,
    pub plugins: Arc<PluginManager>,
    pub tree: Arc<AgentTree>,
    pub run_config: RunConfig,
}

struct Shared {
    invocation_id: InvocationId,
    services: InvocationServices,
    session: AsyncRwLock<Session>,
    cancel: CancellationToken,
    user_content: RwLock<Option<Content>>,
    llm_calls: AtomicU32,
    end_invocation: AtomicBool,
    live: Option<LiveRequestQueue>,
}

/// Everything one agent needs while it runs inside an invocation.
///
/// Cloning is cheap. Clones share the session, the cancellation token and the
/// invocation counters; the current agent and branch are per clone.
#[derive(Clone)]
pub struct InvocationContext {
    shared: Arc<Shared>,
    agent: Arc<dyn Agent>,
    branch: Option<String>,
}

impl InvocationContext {
    pub fn new(
        services: InvocationServices,
        session: Session,
        agent: Arc<dyn Agent>,
        cancel: CancellationToken,
    ) -> Self {
        Self::build(services, session, agent, cancel, None)
    }

    pub fn new_live(
        services: InvocationServices,
        session: Session,
        agent: Arc<dyn Agent>,
        cancel: CancellationToken,
        queue: LiveRequestQueue,
    ) -> Self {
        Self::build(services, session, agent, cancel, Some(queue))
    }

    fn build(
        services: InvocationServices,
        session: Session,
        agent: Arc<dyn Agent>,
        cancel: CancellationToken,
        live: Option<LiveRequestQueue>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                invocation_id: InvocationId::new(),
                services,
                session: AsyncRwLock::new(session),
                cancel,
                user_content: RwLock::new(None),
                llm_calls: AtomicU32::new(0),
                end_invocation: AtomicBool::new(false),
                live,
            }),
            agent,
            branch: None,
        }
    }

    /// Same invocation, running `agent`.
    pub fn for_agent(&self, agent: Arc<dyn Agent>) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            agent,
            branch: self.branch.clone(),
        }
    }

    /// Same invocation on the branch `<current>.<segment>`.
    pub fn with_branch_segment(&self, segment: &str) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            agent: Arc::clone(&self.agent),
            branch: Some(child_branch(self.branch.as_deref(), segment)),
        }
    }

    pub fn invocation_id(&self) -> &InvocationId {
        &self.shared.invocation_id
    }

    pub fn agent(&self) -> &Arc<dyn Agent> {
        &self.agent
    }

    pub fn agent_name(&self) -> &str {
        self.agent.name()
    }

    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    pub fn run_config(&self) -> &RunConfig {
        &self.shared.services.run_config
    }

    pub fn plugins(&self) -> &PluginManager {
        &self.shared.services.plugins
    }

    pub fn tree(&self) -> &AgentTree {
        &self.shared.services.tree
    }

    pub fn session_service(&self) -> &Arc<dyn SessionService> {
        &self.shared.services.session_service
    }

    pub fn artifact_service(&self) -> Option<&Arc<dyn ArtifactService>> {
        self.shared.services.artifact_service.as_ref()
    }

    pub fn live_queue(&self) -> Option<&LiveRequestQueue> {
        self.shared.live.as_ref()
    }

    /// Read access to the live session. Do not hold across a yield.
    pub async fn session(&self) -> RwLockReadGuard<'_, Session> {
        self.shared.session.read().await
    }

    pub async fn session_id(&self) -> SessionId {
        self.session().await.id.clone()
    }

    pub async fn artifact_scope(&self) -> ArtifactScope {
        let session = self.session().await;
        ArtifactScope::new(
            session.app_name.clone(),
            session.user_id.clone(),
            session.id.clone(),
        )
    }

    /// Persists `event` and folds it into the live session. Only the runner calls this.
    pub(crate) async fn append_event(&self, event: Event) -> Result<Event, EngineError> {
        let mut session = self.shared.session.write().await;
        let service = Arc::clone(&self.shared.services.session_service);
        Ok(service.append_event(&mut session, event).await?)
    }

    /// A new event authored by the current agent on the current branch.
    pub fn new_event(&self) -> Event {
        Event::new(self.invocation_id().clone(), self.agent_name()).with_branch(self.branch.clone())
    }

    pub fn user_content(&self) -> Option<Content> {
        self.shared.user_content.read().clone()
    }

    pub(crate) fn set_user_content(&self, content: Content) {
        *self.shared.user_content.write() = Some(content);
    }

    /// Counts a model call. Fails once the configured limit is exceeded.
    pub fn increment_llm_calls(&self) -> Result<u32, EngineError> {
        let calls = self.shared.llm_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let limit = self.run_config().max_llm_calls;
        if limit > 0 && calls > limit {
            return Err(EngineError::LlmCallsLimitExceeded(limit));
        }
        Ok(calls)
    }

    pub fn llm_calls(&self) -> u32 {
        self.shared.llm_calls.load(Ordering::SeqCst)
    }

    /// Stops every agent of this invocation after its current step.
    pub fn end_invocation(&self) {
        debug!(agent = self.agent_name(), "invocation ended early");
        self.shared.end_invocation.store(true, Ordering::SeqCst);
    }

    pub fn is_ended(&self) -> bool {
        self.shared.end_invocation.load(Ordering::SeqCst)
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.shared.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::llm::LlmAgent;
    use relay_store::InMemorySessionService;

    fn context(max_llm_calls: u32) -> InvocationContext {
        let agent: Arc<dyn Agent> = Arc::new(LlmAgent::builder("root").build());
        let services = InvocationServices {
            session_service: Arc::new(InMemorySessionService::new()),
            artifact_service: None,
            plugins: Arc::new(PluginManager::new()),
            tree: Arc::new(AgentTree::new(Arc::clone(&agent)).unwrap()),
            run_config: RunConfig {
                max_llm_calls,
                ..RunConfig::default()
            },
        };
        let session = Session::new("app", "u", SessionId::from_raw("s"));
        InvocationContext::new(services, session, agent, CancellationToken::new())
    }

    #[test]
    fn llm_call_limit() {
        let ctx = context(2);
        assert_eq!(ctx.increment_llm_calls().unwrap(), 1);
        assert_eq!(ctx.increment_llm_calls().unwrap(), 2);
        assert!(matches!(
            ctx.increment_llm_calls(),
            Err(EngineError::LlmCallsLimitExceeded(2))
        ));
    }

    #[test]
    fn zero_limit_is_unbounded() {
        let ctx = context(0);
        for _ in 0..1000 {
            ctx.increment_llm_calls().unwrap();
        }
    }

    #[test]
    fn clones_share_invocation_state() {
        let ctx = context(5);
        let branched = ctx.with_branch_segment("par").with_branch_segment("x");
        assert_eq!(branched.branch(), Some("par.x"));
        assert_eq!(branched.invocation_id(), ctx.invocation_id());
        branched.end_invocation();
        assert!(ctx.is_ended());
        ctx.cancellation_token().cancel();
        assert!(branched.is_cancelled());
    }

    #[tokio::test]
    async fn events_carry_agent_and_branch() {
        let ctx = context(5).with_branch_segment("b");
        let event = ctx.new_event();
        assert_eq!(event.author, "root");
        assert_eq!(event.branch.as_deref(), Some("b"));
        assert_eq!(&event.invocation_id, ctx.invocation_id());
        assert_eq!(ctx.session_id().await.as_str(), "s");
    }
}
