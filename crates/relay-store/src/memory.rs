use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, instrument, warn};

use relay_core::events::Event;
use relay_core::ids::SessionId;
use relay_core::state::{materialize, merge_into, split_scopes, StateMap};

use crate::error::StoreError;
use crate::session::{apply_event, GetSessionConfig, Session, SessionService};

type SessionKey = (String, String, SessionId);

#[derive(Default)]
struct Inner {
    /// Stored sessions hold only session-scoped keys.
    sessions: HashMap<SessionKey, Session>,
    app_state: HashMap<String, StateMap>,
    user_state: HashMap<(String, String), StateMap>,
}

impl Inner {
    fn merged_state(&self, session: &Session) -> StateMap {
        let empty = StateMap::new();
        let app = self.app_state.get(&session.app_name).unwrap_or(&empty);
        let user = self
            .user_state
            .get(&(session.app_name.clone(), session.user_id.clone()))
            .unwrap_or(&empty);
        materialize(&session.state, app, user)
    }

    fn apply_shared(&mut self, app_name: &str, user_id: &str, app: &StateMap, user: &StateMap) {
        if !app.is_empty() {
            merge_into(self.app_state.entry(app_name.to_string()).or_default(), app);
        }
        if !user.is_empty() {
            merge_into(
                self.user_state
                    .entry((app_name.to_string(), user_id.to_string()))
                    .or_default(),
                user,
            );
        }
    }
}

/// Process-local session storage. Contents are lost on drop.
#[derive(Default)]
pub struct InMemorySessionService {
    inner: RwLock<Inner>,
}

impl InMemorySessionService {
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(app_name: &str, user_id: &str, session_id: &SessionId) -> SessionKey {
    (app_name.to_string(), user_id.to_string(), session_id.clone())
}

#[async_trait]
impl SessionService for InMemorySessionService {
    #[instrument(skip(self, state))]
    async fn create_session(
        &self,
        app_name: &str,
        user_id: &str,
        state: Option<StateMap>,
        session_id: Option<SessionId>,
    ) -> Result<Session, StoreError> {
        let id = session_id.unwrap_or_default();
        let mut inner = self.inner.write();
        let key = key(app_name, user_id, &id);
        if inner.sessions.contains_key(&key) {
            return Err(StoreError::AlreadyExists(format!("session {id}")));
        }

        let scoped = split_scopes(&state.unwrap_or_default());
        inner.apply_shared(app_name, user_id, &scoped.app, &scoped.user);

        let mut session = Session::new(app_name, user_id, id);
        session.state = scoped.session;
        inner.sessions.insert(key, session.clone());
        session.state = inner.merged_state(&session);
        debug!(session_id = %session.id, "session created");
        Ok(session)
    }

    async fn get_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &SessionId,
        config: Option<&GetSessionConfig>,
    ) -> Result<Option<Session>, StoreError> {
        let inner = self.inner.read();
        let Some(stored) = inner.sessions.get(&key(app_name, user_id, session_id)) else {
            return Ok(None);
        };
        let mut session = stored.clone();
        if let Some(config) = config {
            config.apply(&mut session.events);
        }
        session.state = inner.merged_state(stored);
        Ok(Some(session))
    }

    async fn list_sessions(&self, app_name: &str, user_id: &str) -> Result<Vec<Session>, StoreError> {
        let inner = self.inner.read();
        let mut sessions: Vec<Session> = inner
            .sessions
            .values()
            .filter(|s| s.app_name == app_name && s.user_id == user_id)
            .map(|s| Session {
                events: Vec::new(),
                state: inner.merged_state(s),
                ..s.clone()
            })
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(sessions)
    }

    #[instrument(skip(self))]
    async fn delete_session(
        &self,
        app_name: &str,
        user_id: &str,
        session_id: &SessionId,
    ) -> Result<(), StoreError> {
        let removed = self
            .inner
            .write()
            .sessions
            .remove(&key(app_name, user_id, session_id));
        debug!(existed = removed.is_some(), "session deleted");
        Ok(())
    }

    #[instrument(skip_all, fields(session_id = %session.id, event_id = %event.id, author = %event.author))]
    async fn append_event(&self, session: &mut Session, event: Event) -> Result<Event, StoreError> {
        if event.partial {
            return Ok(event);
        }
        let mut inner = self.inner.write();
        let key = key(&session.app_name, &session.user_id, &session.id);
        if !inner.sessions.contains_key(&key) {
            warn!("append to unknown session, event not persisted");
            return Ok(event);
        }

        let stored_event = apply_event(session, &event);
        let scoped = split_scopes(&stored_event.actions.state_delta);
        inner.apply_shared(&session.app_name, &session.user_id, &scoped.app, &scoped.user);
        if let Some(stored) = inner.sessions.get_mut(&key) {
            merge_into(&mut stored.state, &scoped.session);
            stored.events.push(stored_event.clone());
            stored.last_update_time = stored_event.timestamp;
        }
        Ok(stored_event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::ids::InvocationId;
    use serde_json::json;

    fn delta(pairs: &[(&str, serde_json::Value)]) -> StateMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn event_with(pairs: &[(&str, serde_json::Value)]) -> Event {
        Event::new(InvocationId::new(), "agent").with_state_delta(delta(pairs))
    }

    #[tokio::test]
    async fn create_and_get() {
        let svc = InMemorySessionService::new();
        let created = svc
            .create_session("app", "u1", Some(delta(&[("k", json!(1))])), None)
            .await
            .unwrap();
        let loaded = svc
            .get_session("app", "u1", &created.id, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.state["k"], json!(1));
        assert!(loaded.events.is_empty());
    }

    #[tokio::test]
    async fn generated_ids_differ() {
        let svc = InMemorySessionService::new();
        let a = svc.create_session("app", "u", None, None).await.unwrap();
        let b = svc.create_session("app", "u", None, None).await.unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn duplicate_explicit_id_rejected() {
        let svc = InMemorySessionService::new();
        let id = SessionId::from_raw("fixed");
        svc.create_session("app", "u", None, Some(id.clone())).await.unwrap();
        let err = svc
            .create_session("app", "u", None, Some(id))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn get_missing_is_none() {
        let svc = InMemorySessionService::new();
        let found = svc
            .get_session("app", "u", &SessionId::from_raw("nope"), None)
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn state_is_fold_of_deltas() {
        let svc = InMemorySessionService::new();
        let mut session = svc
            .create_session("app", "u", Some(delta(&[("a", json!(1)), ("b", json!(1))])), None)
            .await
            .unwrap();
        svc.append_event(&mut session, event_with(&[("a", json!(2))]))
            .await
            .unwrap();
        svc.append_event(&mut session, event_with(&[("c", json!(3)), ("a", json!(4))]))
            .await
            .unwrap();

        let loaded = svc
            .get_session("app", "u", &session.id, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.state, delta(&[("a", json!(4)), ("b", json!(1)), ("c", json!(3))]));
        assert_eq!(loaded.state, session.state);
        assert_eq!(loaded.events.len(), 2);
    }

    #[tokio::test]
    async fn temp_keys_reach_live_session_only() {
        let svc = InMemorySessionService::new();
        let mut session = svc.create_session("app", "u", None, None).await.unwrap();
        let stored = svc
            .append_event(&mut session, event_with(&[("temp:x", json!(1)), ("y", json!(2))]))
            .await
            .unwrap();

        assert_eq!(session.state["temp:x"], json!(1));
        assert!(!stored.actions.state_delta.contains_key("temp:x"));
        let loaded = svc
            .get_session("app", "u", &session.id, None)
            .await
            .unwrap()
            .unwrap();
        assert!(!loaded.state.contains_key("temp:x"));
        assert!(!loaded.events[0].actions.state_delta.contains_key("temp:x"));
    }

    #[tokio::test]
    async fn app_and_user_state_shared_across_sessions() {
        let svc = InMemorySessionService::new();
        let mut first = svc.create_session("app", "u1", None, None).await.unwrap();
        svc.append_event(
            &mut first,
            event_with(&[("app:theme", json!("dark")), ("user:lang", json!("fr")), ("own", json!(true))]),
        )
        .await
        .unwrap();

        let sibling = svc.create_session("app", "u1", None, None).await.unwrap();
        assert_eq!(sibling.state["app:theme"], json!("dark"));
        assert_eq!(sibling.state["user:lang"], json!("fr"));
        assert!(!sibling.state.contains_key("own"));

        let other_user = svc.create_session("app", "u2", None, None).await.unwrap();
        assert_eq!(other_user.state["app:theme"], json!("dark"));
        assert!(!other_user.state.contains_key("user:lang"));

        let other_app = svc.create_session("other", "u1", None, None).await.unwrap();
        assert!(other_app.state.is_empty());
    }

    #[tokio::test]
    async fn partial_events_not_persisted() {
        let svc = InMemorySessionService::new();
        let mut session = svc.create_session("app", "u", None, None).await.unwrap();
        let partial = event_with(&[("a", json!(1))]).with_partial(true);
        let returned = svc.append_event(&mut session, partial.clone()).await.unwrap();
        assert_eq!(returned, partial);
        assert!(session.events.is_empty());
        assert!(!session.state.contains_key("a"));
    }

    #[tokio::test]
    async fn append_to_unknown_session_returns_event() {
        let svc = InMemorySessionService::new();
        let mut ghost = Session::new("app", "u", SessionId::from_raw("ghost"));
        let event = event_with(&[("a", json!(1))]);
        let returned = svc.append_event(&mut ghost, event.clone()).await.unwrap();
        assert_eq!(returned, event);
        assert!(svc
            .get_session("app", "u", &ghost.id, None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let svc = InMemorySessionService::new();
        let session = svc.create_session("app", "u", None, None).await.unwrap();
        svc.delete_session("app", "u", &session.id).await.unwrap();
        svc.delete_session("app", "u", &session.id).await.unwrap();
        assert!(svc
            .get_session("app", "u", &session.id, None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn list_omits_events() {
        let svc = InMemorySessionService::new();
        let mut session = svc.create_session("app", "u", None, None).await.unwrap();
        svc.append_event(&mut session, event_with(&[("a", json!(1))]))
            .await
            .unwrap();
        svc.create_session("app", "other", None, None).await.unwrap();

        let listed = svc.list_sessions("app", "u").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].events.is_empty());
        assert_eq!(listed[0].state["a"], json!(1));
    }

    #[tokio::test]
    async fn get_session_applies_config() {
        let svc = InMemorySessionService::new();
        let mut session = svc.create_session("app", "u", None, None).await.unwrap();
        for i in 0..4 {
            svc.append_event(&mut session, event_with(&[("i", json!(i))]))
                .await
                .unwrap();
        }
        let loaded = svc
            .get_session("app", "u", &session.id, Some(&GetSessionConfig::recent(0)))
            .await
            .unwrap()
            .unwrap();
        assert!(loaded.events.is_empty());
        assert_eq!(loaded.state["i"], json!(3));
    }
}
