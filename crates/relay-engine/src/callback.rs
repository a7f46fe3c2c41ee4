use relay_core::events::{Content, EventActions, Part};
use relay_core::ids::InvocationId;
use relay_core::state::{merge_into, State, StateMap};

use crate::context::InvocationContext;
use crate::error::EngineError;

/// What a callback or plugin sees: a state snapshot plus pending actions.
///
/// Writes never touch the session directly. They accumulate here and reach
/// the session through the event the caller emits.
pub struct CallbackContext {
    invocation: InvocationContext,
    state: State,
    actions: EventActions,
}

impl CallbackContext {
    pub async fn new(invocation: &InvocationContext) -> Self {
        let snapshot = invocation.session().await.state.clone();
        Self {
            invocation: invocation.clone(),
            state: State::new(snapshot),
            actions: EventActions::default(),
        }
    }

    pub fn invocation(&self) -> &InvocationContext {
        &self.invocation
    }

    pub fn invocation_id(&self) -> &InvocationId {
        self.invocation.invocation_id()
    }

    pub fn agent_name(&self) -> &str {
        self.invocation.agent_name()
    }

    pub fn user_content(&self) -> Option<Content> {
        self.invocation.user_content()
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut State {
        &mut self.state
    }

    pub fn actions(&self) -> &EventActions {
        &self.actions
    }

    pub fn actions_mut(&mut self) -> &mut EventActions {
        &mut self.actions
    }

    /// Saves an artifact and records the new version in the pending actions.
    pub async fn save_artifact(&mut self, filename: &str, artifact: Part) -> Result<u64, EngineError> {
        let service = self
            .invocation
            .artifact_service()
            .cloned()
            .ok_or_else(|| EngineError::Configuration("no artifact service configured".into()))?;
        let scope = self.invocation.artifact_scope().await;
        let version = service.save_artifact(&scope, filename, artifact).await?;
        self.actions.artifact_delta.insert(filename.to_string(), version);
        Ok(version)
    }

    pub async fn load_artifact(
        &self,
        filename: &str,
        version: Option<u64>,
    ) -> Result<Option<Part>, EngineError> {
        let Some(service) = self.invocation.artifact_service() else {
            return Err(EngineError::Configuration("no artifact service configured".into()));
        };
        let scope = self.invocation.artifact_scope().await;
        Ok(service.load_artifact(&scope, filename, version).await?)
    }

    pub async fn list_artifacts(&self) -> Result<Vec<String>, EngineError> {
        let Some(service) = self.invocation.artifact_service() else {
            return Err(EngineError::Configuration("no artifact service configured".into()));
        };
        let scope = self.invocation.artifact_scope().await;
        Ok(service.list_artifact_keys(&scope).await?)
    }

    pub fn has_changes(&self) -> bool {
        self.state.has_delta() || !self.actions.is_empty()
    }

    /// Moves the pending actions out, leaving the state writes visible as the
    /// new snapshot.
    pub fn take_actions(&mut self) -> EventActions {
        let mut actions = std::mem::take(&mut self.actions);
        let state = std::mem::replace(&mut self.state, State::new(StateMap::new()));
        merge_into(&mut actions.state_delta, state.delta());
        self.state = State::new(state.to_map());
        actions
    }

    /// Pending actions with the state writes folded into the delta.
    pub fn into_actions(self) -> EventActions {
        let mut actions = self.actions;
        merge_into(&mut actions.state_delta, self.state.delta());
        actions
    }
}
