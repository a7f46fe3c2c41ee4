use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use relay_core::clock;
use relay_core::events::Event;
use relay_core::ids::SessionId;
use relay_core::state::{merge_into, strip_temp, StateMap};

use crate::error::StoreError;

/// An append-only event log plus the state folded from it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub app_name: String,
    pub user_id: String,
    /// Session keys plus `app:`/`user:` keys merged in from shared storage.
    pub state: StateMap,
    pub events: Vec<Event>,
    /// Timestamp of the most recently appended event, or the creation time.
    pub last_update_time: f64,
}

impl Session {
    pub fn new(app_name: impl Into<String>, user_id: impl Into<String>, id: SessionId) -> Self {
        Self {
            id,
            app_name: app_name.into(),
            user_id: user_id.into(),
            state: StateMap::new(),
            events: Vec::new(),
            last_update_time: clock::now(),
        }
    }
}

/// Limits applied to the events returned by [`SessionService::get_session`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GetSessionConfig {
    /// Keep only the newest N events.
    pub num_recent_events: Option<usize>,
    /// Keep only events strictly newer than this timestamp.
    pub after_timestamp: Option<f64>,
}

impl GetSessionConfig {
    pub fn recent(n: usize) -> Self {
        Self {
            num_recent_events: Some(n),
            ..Default::default()
        }
    }

    pub fn after(timestamp: f64) -> Self {
        Self {
            after_timestamp: Some(timestamp),
            ..Default::default()
        }
    }

    pub fn apply(&self, events: &mut Vec<Event>) {
        if let Some(after) = self.after_timestamp {
            events.retain(|e| e.timestamp > after);
        }
        if let Some(n) = self.num_recent_events {
            let excess = events.len().saturating_sub(n);
            events.drain(..excess);
        }
    }
}

/// Persistence contract for sessions.
///
/// Lookups that find nothing return `Ok(None)`. `append_event` is the only
/// sanctioned way to change session state.
#[async_trait]
pub trait SessionService: Send + Sync {
    /// Fails with [`StoreError::AlreadyExists`] when `session_id` is given and taken.
    async fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        state: Option<StateMap>,
        session_id: Option<SessionId>,
    ) -> Result<Session, StoreError>;

    async fn get_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &SessionId,
        config: Option<&GetSessionConfig>,
    ) -> Result<Option<Session>, StoreError>;

    /// Sessions of one user, without their events.
    async fn list_sessions(&self, app_name: &str, user_id: &str) -> Result<Vec<Session>, StoreError>;

    /// Deleting an absent session succeeds.
    async fn delete_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &SessionId,
    ) -> Result<(), StoreError>;

    /// Applies the event's state delta and appends it.
    ///
    /// Partial events are returned untouched. `temp:` keys reach the live
    /// `session` but are stripped from the stored event, which is returned.
    /// An event for a session the store does not know is logged and returned
    /// unchanged.
    async fn append_event(&self, session: &mut Session, event: Event) -> Result<Event, StoreError>;
}

/// Applies `event` to the in-memory `session` and returns the copy to persist.
pub(crate) fn apply_event(session: &mut Session, event: &Event) -> Event {
    merge_into(&mut session.state, &event.actions.state_delta);
    let mut stored = event.clone();
    stored.actions.state_delta = strip_temp(&event.actions.state_delta);
    session.events.push(stored.clone());
    session.last_update_time = event.timestamp;
    stored
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::ids::InvocationId;
    use serde_json::json;

    fn events(n: usize) -> Vec<Event> {
        (0..n).map(|_| Event::new(InvocationId::new(), "a")).collect()
    }

    #[test]
    fn recent_keeps_newest() {
        let mut evs = events(5);
        let last_two: Vec<_> = evs[3..].iter().map(|e| e.id.clone()).collect();
        GetSessionConfig::recent(2).apply(&mut evs);
        assert_eq!(evs.iter().map(|e| e.id.clone()).collect::<Vec<_>>(), last_two);
    }

    #[test]
    fn recent_larger_than_log_keeps_all() {
        let mut evs = events(2);
        GetSessionConfig::recent(10).apply(&mut evs);
        assert_eq!(evs.len(), 2);
    }

    #[test]
    fn after_timestamp_is_strict() {
        let mut evs = events(3);
        let cutoff = evs[1].timestamp;
        GetSessionConfig::after(cutoff).apply(&mut evs);
        assert_eq!(evs.len(), 1);
        assert!(evs[0].timestamp > cutoff);
    }

    #[test]
    fn apply_event_strips_temp_from_stored_copy() {
        let mut session = Session::new("app", "u", SessionId::from_raw("s"));
        let mut event = Event::new(InvocationId::new(), "a");
        event.actions.state_delta.insert("temp:scratch".into(), json!(1));
        event.actions.state_delta.insert("count".into(), json!(2));

        let stored = apply_event(&mut session, &event);
        assert_eq!(session.state["temp:scratch"], json!(1));
        assert!(!stored.actions.state_delta.contains_key("temp:scratch"));
        assert_eq!(session.events[0], stored);
        assert_eq!(session.last_update_time, event.timestamp);
    }
}
